use shared::types::{
    Auction, AuditEvent, Bid, BidId, IncrementTier, Lot, LotId, UserId,
};

use super::{StoreError, Tables};

/// Staged working copy of one lot's cluster: the lot row, its auction
/// (read-only), every bid on the lot, plus pending inserts and audit
/// appends. Nothing here touches the tables until the commit at the end of
/// [`super::Store::with_lot`].
pub struct LotTxn {
    pub(crate) auction: Auction,
    pub(crate) lot: Lot,
    /// Existing bids of the lot in chronological order; status-flag edits
    /// on these are written back at commit.
    pub(crate) existing: Vec<Bid>,
    pub(crate) inserted: Vec<Bid>,
    pub(crate) audit: Vec<AuditEvent>,
}

impl LotTxn {
    pub(crate) fn load(tables: &Tables, lot_id: LotId) -> Result<Self, StoreError> {
        let lot = tables
            .lots
            .get(&lot_id)
            .cloned()
            .ok_or(StoreError::NotFound("lot"))?;
        let auction = tables
            .auctions
            .get(&lot.auction_id)
            .cloned()
            .ok_or(StoreError::NotFound("auction"))?;
        let existing = tables
            .bids_by_lot
            .get(&lot_id)
            .map(|ids| ids.iter().map(|id| tables.bids[id].clone()).collect())
            .unwrap_or_default();
        Ok(Self {
            auction,
            lot,
            existing,
            inserted: Vec::new(),
            audit: Vec::new(),
        })
    }

    pub(crate) fn into_parts(self) -> (Lot, Vec<Bid>, Vec<Bid>, Vec<AuditEvent>) {
        (self.lot, self.existing, self.inserted, self.audit)
    }

    pub fn auction(&self) -> &Auction {
        &self.auction
    }

    pub fn lot(&self) -> &Lot {
        &self.lot
    }

    pub fn lot_mut(&mut self) -> &mut Lot {
        &mut self.lot
    }

    /// All bids of the lot as staged, committed rows first, then inserts.
    pub fn bids(&self) -> impl Iterator<Item = &Bid> {
        self.existing.iter().chain(self.inserted.iter())
    }

    pub fn bids_mut(&mut self) -> impl Iterator<Item = &mut Bid> {
        self.existing.iter_mut().chain(self.inserted.iter_mut())
    }

    pub fn winning_bid(&self) -> Option<&Bid> {
        self.bids().find(|b| b.is_winning)
    }

    pub fn winning_bid_mut(&mut self) -> Option<&mut Bid> {
        self.bids_mut().find(|b| b.is_winning)
    }

    /// The bidder's standing proxy cap on this lot, if any. At most one row
    /// per bidder ever has an active maximum.
    pub fn active_max_bid(&self, bidder: UserId) -> Option<&Bid> {
        self.bids()
            .find(|b| b.bidder_id == bidder && b.max_bid_active && b.max_bid.is_some())
    }

    /// Retire every standing proxy cap the bidder holds on this lot.
    pub fn deactivate_max_bids(&mut self, bidder: UserId) {
        for bid in self.bids_mut() {
            if bid.bidder_id == bidder && bid.max_bid_active {
                bid.max_bid_active = false;
            }
        }
    }

    pub fn insert_bid(&mut self, bid: Bid) -> BidId {
        let id = bid.id;
        self.inserted.push(bid);
        id
    }

    pub fn audit(&mut self, event: AuditEvent) {
        self.audit.push(event);
    }

    /// Increment table in force for this lot: per-lot override first, then
    /// the auction's table.
    pub fn effective_increment_rules(&self) -> &[IncrementTier] {
        self.lot
            .increment_rules_override
            .as_deref()
            .unwrap_or(&self.auction.increment_rules)
    }
}
