//! Embedded transactional store for the auction entities.
//!
//! Tables are `BTreeMap`s keyed by id with the secondary indexes the hot
//! paths need. Every mutating operation on a lot runs through [`Store::with_lot`],
//! which serializes writers per lot and commits the staged write set
//! atomically. Bid rows and audit events are immutable once committed: the
//! store itself refuses any edit beyond the whitelisted status flags.

mod txn;

pub use txn::LotTxn;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use uuid::Uuid;

use shared::types::{
    Auction, AuctionId, AuctionStatus, AuditEvent, AuditKind, BatchId, Bid, BidId, ImageMapping,
    ImportBatch, Invoice, InvoiceId, Lot, LotId, LotStatus, MappingId, UnixSeconds, UserId,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(String),
    /// Serialization conflict; the caller may retry the whole operation.
    #[error("serialization conflict")]
    Aborted,
}

#[derive(Default)]
pub(crate) struct Tables {
    pub auctions: BTreeMap<AuctionId, Auction>,
    pub lots: BTreeMap<LotId, Lot>,
    pub bids: BTreeMap<BidId, Bid>,
    pub audit_by_lot: BTreeMap<LotId, Vec<AuditEvent>>,

    // Secondary indexes
    pub lots_by_auction: BTreeMap<AuctionId, BTreeSet<LotId>>,
    pub lot_numbers: BTreeMap<(AuctionId, u32), LotId>,
    /// Bid ids per lot in insertion (= chronological) order.
    pub bids_by_lot: BTreeMap<LotId, Vec<BidId>>,
    pub winning_by_lot: BTreeMap<LotId, BidId>,
    /// `(lot, bidder) -> bid` for rows whose `max_bid_active` is set.
    pub active_max_by_lot: BTreeMap<(LotId, UserId), BidId>,
    pub bids_by_bidder: BTreeSet<(UserId, UnixSeconds, BidId)>,

    pub watchlist: BTreeSet<(UserId, LotId)>,
    pub watchers_by_lot: BTreeMap<LotId, BTreeSet<UserId>>,

    pub invoices: BTreeMap<InvoiceId, Invoice>,
    pub invoices_by_auction: BTreeMap<AuctionId, Vec<InvoiceId>>,
    pub invoice_seq: u64,

    pub import_batches: BTreeMap<BatchId, ImportBatch>,
    pub mappings: BTreeMap<MappingId, ImageMapping>,
    /// First mapping to claim a `(lot, photo_order)` slot wins.
    pub mapping_slots: BTreeMap<(LotId, u32), MappingId>,

    /// Lots whose `lot_closed` audit event has been emitted (close dedupe).
    pub lot_close_audited: BTreeSet<LotId>,
}

pub struct Store {
    tables: RwLock<Tables>,
    lot_locks: Mutex<HashMap<LotId, Arc<Mutex<()>>>>,
    #[cfg(test)]
    pub(crate) abort_next: std::sync::atomic::AtomicU32,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            lot_locks: Mutex::new(HashMap::new()),
            #[cfg(test)]
            abort_next: std::sync::atomic::AtomicU32::new(0),
        }
    }

    fn lot_lock(&self, lot_id: LotId) -> Arc<Mutex<()>> {
        self.lot_locks
            .lock()
            .entry(lot_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` inside an exclusive transaction over one lot.
    ///
    /// The closure sees a staged copy of the lot, its auction and all its
    /// bids; reads within the transaction observe its own writes. On `Ok`
    /// the whole write set commits atomically; on `Err` nothing is applied.
    /// Concurrent callers targeting the same lot execute serially.
    pub fn with_lot<T>(
        &self,
        lot_id: LotId,
        f: impl FnOnce(&mut LotTxn) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let lock = self.lot_lock(lot_id);
        let _guard = lock.lock();

        let mut txn = {
            let tables = self.tables.read();
            LotTxn::load(&tables, lot_id)?
        };
        let out = f(&mut txn)?;
        self.commit_lot(txn)?;
        Ok(out)
    }

    fn commit_lot(&self, txn: LotTxn) -> Result<(), StoreError> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            if self
                .abort_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Aborted);
            }
        }

        let (lot, existing, inserted, audit) = txn.into_parts();
        let mut tables = self.tables.write();

        if lot.current_close_at < lot.original_close_at {
            return Err(StoreError::Conflict(
                "lot close time may only grow".into(),
            ));
        }

        // Immutable-row enforcement: committed bids only ever change their
        // status flags.
        for staged in &existing {
            let stored = tables
                .bids
                .get(&staged.id)
                .ok_or(StoreError::NotFound("bid"))?;
            if immutable_fields_differ(stored, staged) {
                return Err(StoreError::Conflict(format!(
                    "bid {} is immutable",
                    staged.id
                )));
            }
        }
        for bid in &inserted {
            if tables.bids.contains_key(&bid.id) {
                return Err(StoreError::Conflict(format!("bid {} already exists", bid.id)));
            }
            if bid.lot_id != lot.id {
                return Err(StoreError::Conflict("bid belongs to another lot".into()));
            }
        }

        // At most one winning row, and it must match the lot snapshot.
        let winners: Vec<&Bid> = existing
            .iter()
            .chain(inserted.iter())
            .filter(|b| b.is_winning)
            .collect();
        if winners.len() > 1 {
            return Err(StoreError::Conflict("multiple winning bids".into()));
        }
        if let Some(winner) = winners.first() {
            if lot.current_bidder_id != Some(winner.bidder_id) || lot.current_bid != winner.amount {
                return Err(StoreError::Conflict(
                    "winning bid does not match lot snapshot".into(),
                ));
            }
        }

        let lot_id = lot.id;

        // Apply rows.
        for staged in existing {
            tables.bids.insert(staged.id, staged);
        }
        for bid in &inserted {
            tables
                .bids_by_lot
                .entry(lot_id)
                .or_default()
                .push(bid.id);
            tables
                .bids_by_bidder
                .insert((bid.bidder_id, bid.created_at, bid.id));
        }
        for bid in inserted {
            tables.bids.insert(bid.id, bid);
        }
        for event in &audit {
            if event.kind == AuditKind::LotClosed {
                tables.lot_close_audited.insert(lot_id);
            }
        }
        tables.audit_by_lot.entry(lot_id).or_default().extend(audit);
        tables.lots.insert(lot_id, lot);

        // Rebuild the lot-scoped indexes from the final rows.
        let lot_bids: Vec<Bid> = tables
            .bids_by_lot
            .get(&lot_id)
            .map(|ids| ids.iter().map(|id| tables.bids[id].clone()).collect())
            .unwrap_or_default();

        match lot_bids.iter().find(|b| b.is_winning) {
            Some(winner) => {
                tables.winning_by_lot.insert(lot_id, winner.id);
            }
            None => {
                tables.winning_by_lot.remove(&lot_id);
            }
        }

        let stale: Vec<(LotId, UserId)> = tables
            .active_max_by_lot
            .range((lot_id, Uuid::nil())..=(lot_id, Uuid::max()))
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            tables.active_max_by_lot.remove(&key);
        }
        for bid in &lot_bids {
            if bid.max_bid_active && bid.max_bid.is_some() {
                tables
                    .active_max_by_lot
                    .insert((lot_id, bid.bidder_id), bid.id);
            }
        }

        Ok(())
    }

    // ─────────────────────────────────────────────────────────
    // Auctions
    // ─────────────────────────────────────────────────────────

    pub fn insert_auction(&self, auction: Auction) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.auctions.contains_key(&auction.id) {
            return Err(StoreError::Conflict("auction id already exists".into()));
        }
        tables.lots_by_auction.entry(auction.id).or_default();
        tables.auctions.insert(auction.id, auction);
        Ok(())
    }

    pub fn auction(&self, id: AuctionId) -> Result<Auction, StoreError> {
        self.tables
            .read()
            .auctions
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("auction"))
    }

    pub fn update_auction<T>(
        &self,
        id: AuctionId,
        f: impl FnOnce(&mut Auction) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut tables = self.tables.write();
        let auction = tables
            .auctions
            .get_mut(&id)
            .ok_or(StoreError::NotFound("auction"))?;
        f(auction)
    }

    pub fn auctions(&self, status: Option<AuctionStatus>) -> Vec<Auction> {
        self.tables
            .read()
            .auctions
            .values()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .cloned()
            .collect()
    }

    // ─────────────────────────────────────────────────────────
    // Lots
    // ─────────────────────────────────────────────────────────

    /// Insert a batch of lots for one auction; the whole batch commits or
    /// none of it does. Enforces `(auction, lot_number)` uniqueness against
    /// both the table and the batch itself.
    pub fn insert_lots(&self, auction_id: AuctionId, lots: Vec<Lot>) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.auctions.contains_key(&auction_id) {
            return Err(StoreError::NotFound("auction"));
        }
        let mut batch_numbers = BTreeSet::new();
        for lot in &lots {
            if lot.auction_id != auction_id {
                return Err(StoreError::Conflict("lot belongs to another auction".into()));
            }
            if tables.lot_numbers.contains_key(&(auction_id, lot.lot_number))
                || !batch_numbers.insert(lot.lot_number)
            {
                return Err(StoreError::Conflict(format!(
                    "duplicate lot number {}",
                    lot.lot_number
                )));
            }
        }
        for lot in lots {
            tables.lot_numbers.insert((auction_id, lot.lot_number), lot.id);
            tables
                .lots_by_auction
                .entry(auction_id)
                .or_default()
                .insert(lot.id);
            tables.lots.insert(lot.id, lot);
        }
        Ok(())
    }

    pub fn insert_lot(&self, lot: Lot) -> Result<(), StoreError> {
        let auction_id = lot.auction_id;
        self.insert_lots(auction_id, vec![lot])
    }

    pub fn lot(&self, id: LotId) -> Result<Lot, StoreError> {
        self.tables
            .read()
            .lots
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("lot"))
    }

    pub fn lot_by_number(&self, auction_id: AuctionId, number: u32) -> Option<Lot> {
        let tables = self.tables.read();
        let id = tables.lot_numbers.get(&(auction_id, number))?;
        tables.lots.get(id).cloned()
    }

    pub fn lots_of_auction(&self, auction_id: AuctionId) -> Result<Vec<Lot>, StoreError> {
        let tables = self.tables.read();
        let ids = tables
            .lots_by_auction
            .get(&auction_id)
            .ok_or(StoreError::NotFound("auction"))?;
        Ok(ids.iter().map(|id| tables.lots[id].clone()).collect())
    }

    /// Active lots whose close time has passed.
    pub fn due_lots(&self, now: UnixSeconds) -> Vec<LotId> {
        self.tables
            .read()
            .lots
            .values()
            .filter(|l| l.status == LotStatus::Active && l.current_close_at <= now)
            .map(|l| l.id)
            .collect()
    }

    /// Active auctions whose every lot has reached a terminal status.
    pub fn auctions_ready_to_close(&self) -> Vec<AuctionId> {
        let tables = self.tables.read();
        tables
            .auctions
            .values()
            .filter(|a| a.status == AuctionStatus::Active)
            .filter(|a| {
                tables
                    .lots_by_auction
                    .get(&a.id)
                    .map(|ids| {
                        !ids.is_empty()
                            && ids.iter().all(|id| tables.lots[id].status.is_terminal())
                    })
                    .unwrap_or(false)
            })
            .map(|a| a.id)
            .collect()
    }

    pub fn lot_close_audited(&self, lot_id: LotId) -> bool {
        self.tables.read().lot_close_audited.contains(&lot_id)
    }

    // ─────────────────────────────────────────────────────────
    // Bids & audit
    // ─────────────────────────────────────────────────────────

    pub fn bid_history(&self, lot_id: LotId) -> Result<Vec<Bid>, StoreError> {
        let tables = self.tables.read();
        if !tables.lots.contains_key(&lot_id) {
            return Err(StoreError::NotFound("lot"));
        }
        Ok(tables
            .bids_by_lot
            .get(&lot_id)
            .map(|ids| ids.iter().map(|id| tables.bids[id].clone()).collect())
            .unwrap_or_default())
    }

    pub fn bids_of_bidder(&self, bidder: UserId) -> Vec<Bid> {
        let tables = self.tables.read();
        tables
            .bids_by_bidder
            .range((bidder, i64::MIN, Uuid::nil())..=(bidder, i64::MAX, Uuid::max()))
            .map(|(_, _, id)| tables.bids[id].clone())
            .collect()
    }

    pub fn audit_of_lot(&self, lot_id: LotId) -> Vec<AuditEvent> {
        self.tables
            .read()
            .audit_by_lot
            .get(&lot_id)
            .cloned()
            .unwrap_or_default()
    }

    // ─────────────────────────────────────────────────────────
    // Watchlist
    // ─────────────────────────────────────────────────────────

    /// Idempotent; returns whether the pair was newly added.
    pub fn add_watch(&self, user: UserId, lot_id: LotId) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        if !tables.lots.contains_key(&lot_id) {
            return Err(StoreError::NotFound("lot"));
        }
        let added = tables.watchlist.insert((user, lot_id));
        tables.watchers_by_lot.entry(lot_id).or_default().insert(user);
        Ok(added)
    }

    /// Idempotent; returns whether the pair existed.
    pub fn remove_watch(&self, user: UserId, lot_id: LotId) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        if !tables.lots.contains_key(&lot_id) {
            return Err(StoreError::NotFound("lot"));
        }
        let removed = tables.watchlist.remove(&(user, lot_id));
        if let Some(watchers) = tables.watchers_by_lot.get_mut(&lot_id) {
            watchers.remove(&user);
        }
        Ok(removed)
    }

    pub fn watched_lots(&self, user: UserId) -> Vec<Lot> {
        let tables = self.tables.read();
        tables
            .watchlist
            .range((user, Uuid::nil())..=(user, Uuid::max()))
            .filter_map(|(_, lot_id)| tables.lots.get(lot_id).cloned())
            .collect()
    }

    pub fn watchers_of_lot(&self, lot_id: LotId) -> Vec<UserId> {
        self.tables
            .read()
            .watchers_by_lot
            .get(&lot_id)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default()
    }

    // ─────────────────────────────────────────────────────────
    // Invoices
    // ─────────────────────────────────────────────────────────

    pub fn next_invoice_seq(&self) -> u64 {
        let mut tables = self.tables.write();
        tables.invoice_seq += 1;
        tables.invoice_seq
    }

    /// Insert a generated invoice set; fails whole if any invoice exists for
    /// the auction already.
    pub fn insert_invoices(
        &self,
        auction_id: AuctionId,
        invoices: Vec<Invoice>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.auctions.contains_key(&auction_id) {
            return Err(StoreError::NotFound("auction"));
        }
        if tables
            .invoices_by_auction
            .get(&auction_id)
            .is_some_and(|ids| !ids.is_empty())
        {
            return Err(StoreError::Conflict("invoices already generated".into()));
        }
        for invoice in &invoices {
            for item in &invoice.items {
                if !tables.lots.contains_key(&item.lot_id) {
                    return Err(StoreError::NotFound("lot"));
                }
            }
        }
        let ids: Vec<InvoiceId> = invoices.iter().map(|i| i.id).collect();
        for invoice in invoices {
            tables.invoices.insert(invoice.id, invoice);
        }
        tables.invoices_by_auction.insert(auction_id, ids);
        Ok(())
    }

    pub fn invoice(&self, id: InvoiceId) -> Result<Invoice, StoreError> {
        self.tables
            .read()
            .invoices
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("invoice"))
    }

    pub fn invoices_of_auction(&self, auction_id: AuctionId) -> Vec<Invoice> {
        let tables = self.tables.read();
        tables
            .invoices_by_auction
            .get(&auction_id)
            .map(|ids| ids.iter().map(|id| tables.invoices[id].clone()).collect())
            .unwrap_or_default()
    }

    pub fn invoices_of_bidder(&self, bidder: UserId) -> Vec<Invoice> {
        self.tables
            .read()
            .invoices
            .values()
            .filter(|i| i.bidder_id == bidder)
            .cloned()
            .collect()
    }

    /// Payment/fulfillment status updates only; monetary fields are frozen.
    pub fn update_invoice_status<T>(
        &self,
        id: InvoiceId,
        f: impl FnOnce(&mut Invoice) -> T,
    ) -> Result<T, StoreError> {
        let mut tables = self.tables.write();
        let invoice = tables
            .invoices
            .get_mut(&id)
            .ok_or(StoreError::NotFound("invoice"))?;
        let frozen = (
            invoice.subtotal,
            invoice.premium,
            invoice.tax,
            invoice.shipping,
            invoice.total,
        );
        let out = f(invoice);
        if (
            invoice.subtotal,
            invoice.premium,
            invoice.tax,
            invoice.shipping,
            invoice.total,
        ) != frozen
        {
            return Err(StoreError::Conflict(
                "invoice monetary fields are immutable".into(),
            ));
        }
        Ok(out)
    }

    // ─────────────────────────────────────────────────────────
    // Imports
    // ─────────────────────────────────────────────────────────

    pub fn insert_batch(&self, batch: ImportBatch) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.auctions.contains_key(&batch.auction_id) {
            return Err(StoreError::NotFound("auction"));
        }
        tables.import_batches.insert(batch.id, batch);
        Ok(())
    }

    pub fn batch(&self, id: BatchId) -> Result<ImportBatch, StoreError> {
        self.tables
            .read()
            .import_batches
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("import batch"))
    }

    /// Insert image mappings. Rows with a claimed `(lot, photo_order)` slot
    /// register it; the importer has already resolved conflicts, so a taken
    /// slot here is a hard conflict.
    pub fn insert_mappings(&self, mappings: Vec<ImageMapping>) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        for mapping in &mappings {
            if let (Some(lot_id), Some(order)) = (mapping.lot_id, mapping.photo_order) {
                if !tables.lots.contains_key(&lot_id) {
                    return Err(StoreError::NotFound("lot"));
                }
                if claims_slot(mapping) && tables.mapping_slots.contains_key(&(lot_id, order)) {
                    return Err(StoreError::Conflict(format!(
                        "photo slot {order} of lot already assigned"
                    )));
                }
            }
        }
        for mapping in mappings {
            if let (Some(lot_id), Some(order)) = (mapping.lot_id, mapping.photo_order) {
                if claims_slot(&mapping) {
                    tables.mapping_slots.insert((lot_id, order), mapping.id);
                }
            }
            tables.mappings.insert(mapping.id, mapping);
        }
        Ok(())
    }

    pub fn photo_slot_taken(&self, lot_id: LotId, order: u32) -> bool {
        self.tables
            .read()
            .mapping_slots
            .contains_key(&(lot_id, order))
    }

    pub fn mapping(&self, id: MappingId) -> Result<ImageMapping, StoreError> {
        self.tables
            .read()
            .mappings
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("image mapping"))
    }

    pub fn mappings_of_batch(&self, batch_id: BatchId) -> Vec<ImageMapping> {
        self.tables
            .read()
            .mappings
            .values()
            .filter(|m| m.batch_id == batch_id)
            .cloned()
            .collect()
    }

    /// Reassign a mapping by hand. The target slot must be free.
    pub fn assign_mapping(
        &self,
        id: MappingId,
        lot_id: LotId,
        order: u32,
    ) -> Result<ImageMapping, StoreError> {
        let mut tables = self.tables.write();
        if !tables.lots.contains_key(&lot_id) {
            return Err(StoreError::NotFound("lot"));
        }
        if tables
            .mapping_slots
            .get(&(lot_id, order))
            .is_some_and(|owner| *owner != id)
        {
            return Err(StoreError::Conflict(format!(
                "photo slot {order} of lot already assigned"
            )));
        }
        let old_slot = tables
            .mappings
            .get(&id)
            .map(|m| (m.lot_id, m.photo_order))
            .ok_or(StoreError::NotFound("image mapping"))?;
        if let (Some(old_lot), Some(old_order)) = old_slot {
            if tables
                .mapping_slots
                .get(&(old_lot, old_order))
                .is_some_and(|owner| *owner == id)
            {
                tables.mapping_slots.remove(&(old_lot, old_order));
            }
        }
        tables.mapping_slots.insert((lot_id, order), id);
        let mapping = tables
            .mappings
            .get_mut(&id)
            .ok_or(StoreError::NotFound("image mapping"))?;
        mapping.lot_id = Some(lot_id);
        mapping.photo_order = Some(order);
        mapping.status = shared::types::MappingStatus::Manual;
        mapping.reason = None;
        Ok(mapping.clone())
    }
}

fn claims_slot(mapping: &ImageMapping) -> bool {
    matches!(
        mapping.status,
        shared::types::MappingStatus::Matched | shared::types::MappingStatus::Manual
    )
}

/// Everything on a bid row except the whitelisted status flags.
fn immutable_fields_differ(stored: &Bid, staged: &Bid) -> bool {
    stored.lot_id != staged.lot_id
        || stored.bidder_id != staged.bidder_id
        || stored.amount != staged.amount
        || stored.bid_type != staged.bid_type
        || stored.max_bid != staged.max_bid
        || stored.buy_now != staged.buy_now
        || stored.previous_amount != staged.previous_amount
        || stored.previous_bidder_id != staged.previous_bidder_id
        || stored.ip_address != staged.ip_address
        || stored.user_agent != staged.user_agent
        || stored.created_at != staged.created_at
}
