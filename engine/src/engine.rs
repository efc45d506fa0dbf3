use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, instrument};
use uuid::Uuid;

use shared::events::FeedFrame;
use shared::rules::default_increment_tiers;
use shared::types::{
    Auction, AuctionId, AuctionStatus, AuditEvent, AuditKind, Bid, BidStatus, IncrementTier, Lot,
    LotId, LotSnapshot, LotStatus, PremiumTier, UnixSeconds, UserId,
};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, ResultCode};
use crate::hub::SubscriptionHub;
use crate::notifier::{Notifier, NoopNotifier};
use crate::store::Store;

/// The aggregate wiring store, clock, hub and notifier together. One
/// instance serves all auctions; per-lot serialization lives in the store.
pub struct Engine {
    pub(crate) store: Arc<Store>,
    pub(crate) clock: Clock,
    pub(crate) hub: SubscriptionHub,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) config: EngineConfig,
}

/// Auction creation parameters. Omitted increment rules fall back to the
/// house table.
pub struct AuctionParams {
    pub title: String,
    pub start_at: UnixSeconds,
    pub end_at: UnixSeconds,
    pub soft_close_enabled: bool,
    pub trigger_window: i64,
    pub extension: i64,
    pub increment_rules: Option<Vec<IncrementTier>>,
    pub premium_rules: Vec<PremiumTier>,
    pub tax_rate: Option<Decimal>,
}

pub struct LotParams {
    pub lot_number: u32,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub condition: Option<String>,
    pub starting_bid: Decimal,
    pub reserve_price: Option<Decimal>,
    pub buy_now_price: Option<Decimal>,
    pub increment_rules_override: Option<Vec<IncrementTier>>,
    pub shipping_amount: Option<Decimal>,
    pub quantity: Option<u32>,
    pub location: Option<String>,
    pub shipping_available: bool,
    pub tags: Vec<String>,
}

impl Engine {
    pub fn new(clock: Clock, config: EngineConfig) -> Self {
        Self::with_notifier(clock, config, Arc::new(NoopNotifier))
    }

    pub fn with_notifier(
        clock: Clock,
        config: EngineConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let hub = SubscriptionHub::new(
            Duration::from_secs(config.heartbeat_secs),
            config.subscriber_buffer,
        );
        Self {
            store: Arc::new(Store::new()),
            clock,
            hub,
            notifier,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────
    // Auction & lot management
    // ─────────────────────────────────────────────────────────

    #[instrument(skip_all, fields(title = %params.title))]
    pub fn create_auction(&self, params: AuctionParams) -> Result<Auction, EngineError> {
        if params.end_at <= params.start_at {
            return Err(EngineError::rejected(
                ResultCode::InvalidAmount,
                "auction must end after it starts",
            ));
        }
        let auction = Auction {
            id: Uuid::new_v4(),
            title: params.title,
            status: AuctionStatus::Draft,
            start_at: params.start_at,
            end_at: params.end_at,
            soft_close_enabled: params.soft_close_enabled,
            trigger_window: params.trigger_window,
            extension: params.extension,
            increment_rules: params
                .increment_rules
                .unwrap_or_else(default_increment_tiers),
            premium_rules: params.premium_rules,
            tax_rate: params.tax_rate,
            created_at: self.clock.now(),
        };
        self.store.insert_auction(auction.clone())?;
        info!(auction_id = %auction.id, "auction created");
        Ok(auction)
    }

    pub fn add_lot(&self, auction_id: AuctionId, params: LotParams) -> Result<Lot, EngineError> {
        if params.starting_bid < Decimal::ZERO {
            return Err(EngineError::rejected(
                ResultCode::InvalidAmount,
                "starting bid must not be negative",
            ));
        }
        let auction = self.store.auction(auction_id)?;
        if !matches!(
            auction.status,
            AuctionStatus::Draft | AuctionStatus::Published
        ) {
            return Err(EngineError::rejected(
                ResultCode::Conflict,
                "lots can only be added before the auction runs",
            ));
        }
        let lot = Lot {
            id: Uuid::new_v4(),
            auction_id,
            lot_number: params.lot_number,
            title: params.title,
            description: params.description,
            category: params.category,
            condition: params.condition,
            starting_bid: params.starting_bid,
            reserve_price: params.reserve_price,
            buy_now_price: params.buy_now_price,
            increment_rules_override: params.increment_rules_override,
            shipping_amount: params.shipping_amount.unwrap_or(Decimal::ZERO),
            quantity: params.quantity.unwrap_or(1),
            location: params.location,
            shipping_available: params.shipping_available,
            tags: params.tags,
            original_close_at: auction.end_at,
            current_close_at: auction.end_at,
            extension_count: 0,
            status: LotStatus::Pending,
            current_bid: Decimal::ZERO,
            current_bidder_id: None,
            bid_count: 0,
            reserve_met: false,
            closed_at: None,
            created_at: self.clock.now(),
        };
        self.store.insert_lot(lot.clone())?;
        Ok(lot)
    }

    /// Draft -> Published. Requires at least one lot.
    pub fn publish_auction(&self, auction_id: AuctionId) -> Result<Auction, EngineError> {
        let lots = self.store.lots_of_auction(auction_id)?;
        if lots.is_empty() {
            return Err(EngineError::rejected(
                ResultCode::Conflict,
                "an auction needs at least one lot before publishing",
            ));
        }
        self.store.update_auction(auction_id, |auction| {
            if auction.status != AuctionStatus::Draft {
                return Err(crate::store::StoreError::Conflict(
                    "only draft auctions can be published".into(),
                ));
            }
            auction.status = AuctionStatus::Published;
            Ok(())
        })?;
        Ok(self.store.auction(auction_id)?)
    }

    /// Published -> Active once the start time has been reached; activates
    /// every pending lot.
    #[instrument(skip(self))]
    pub fn activate_auction(&self, auction_id: AuctionId) -> Result<Auction, EngineError> {
        let now = self.clock.now();
        self.store.update_auction(auction_id, |auction| {
            if auction.status != AuctionStatus::Published {
                return Err(crate::store::StoreError::Conflict(
                    "only published auctions can be activated".into(),
                ));
            }
            if now < auction.start_at {
                return Err(crate::store::StoreError::Conflict(
                    "auction has not reached its start time".into(),
                ));
            }
            auction.status = AuctionStatus::Active;
            Ok(())
        })?;
        for lot in self.store.lots_of_auction(auction_id)? {
            if lot.status == LotStatus::Pending {
                self.store.with_lot(lot.id, |txn| {
                    if txn.lot().status == LotStatus::Pending {
                        txn.lot_mut().status = LotStatus::Active;
                    }
                    Ok(())
                })?;
            }
        }
        info!(%auction_id, "auction activated");
        Ok(self.store.auction(auction_id)?)
    }

    /// Pull a lot from sale. Terminal; no bids may follow.
    pub fn withdraw_lot(&self, lot_id: LotId) -> Result<LotSnapshot, EngineError> {
        let now = self.clock.now();
        let now_ms = self.clock.now_millis();
        let (snapshot, frame) = self.store.with_lot(lot_id, |txn| {
            if txn.lot().status.is_terminal() {
                return Err(crate::store::StoreError::Conflict(
                    "lot is already closed".into(),
                ));
            }
            txn.lot_mut().status = LotStatus::Withdrawn;
            txn.lot_mut().closed_at = Some(now);
            for bid in txn.bids_mut() {
                bid.status = BidStatus::Lost;
            }
            let mut event = audit_event(txn.lot(), AuditKind::LotClosed, now);
            event.result_message = Some("withdrawn".into());
            txn.audit(event);
            let snapshot = txn.lot().snapshot();
            Ok((snapshot.clone(), FeedFrame::lot_closed(snapshot, now_ms)))
        })?;
        self.hub.publish(lot_id, frame);
        Ok(snapshot)
    }

    // ─────────────────────────────────────────────────────────
    // Read surface
    // ─────────────────────────────────────────────────────────

    pub fn auction(&self, id: AuctionId) -> Result<Auction, EngineError> {
        Ok(self.store.auction(id)?)
    }

    pub fn lot(&self, id: LotId) -> Result<Lot, EngineError> {
        Ok(self.store.lot(id)?)
    }

    pub fn lot_snapshot(&self, id: LotId) -> Result<LotSnapshot, EngineError> {
        Ok(self.store.lot(id)?.snapshot())
    }

    pub fn bid_history(&self, lot_id: LotId) -> Result<Vec<Bid>, EngineError> {
        Ok(self.store.bid_history(lot_id)?)
    }

    pub fn audit_trail(&self, lot_id: LotId) -> Vec<AuditEvent> {
        self.store.audit_of_lot(lot_id)
    }

    /// A bidder's own bids across every lot, oldest first.
    pub fn bids_of_bidder(&self, bidder: UserId) -> Vec<Bid> {
        self.store.bids_of_bidder(bidder)
    }

    // ─────────────────────────────────────────────────────────
    // Watchlist
    // ─────────────────────────────────────────────────────────

    pub fn add_watch(&self, user: UserId, lot_id: LotId) -> Result<bool, EngineError> {
        Ok(self.store.add_watch(user, lot_id)?)
    }

    pub fn remove_watch(&self, user: UserId, lot_id: LotId) -> Result<bool, EngineError> {
        Ok(self.store.remove_watch(user, lot_id)?)
    }

    pub fn watched_lots(&self, user: UserId) -> Vec<Lot> {
        self.store.watched_lots(user)
    }

    // ─────────────────────────────────────────────────────────
    // Live updates
    // ─────────────────────────────────────────────────────────

    /// Open a live stream for a lot: one snapshot frame, then incremental
    /// frames in commit order.
    pub fn subscribe(&self, lot_id: LotId) -> Result<ReceiverStream<FeedFrame>, EngineError> {
        let lot = self.store.lot(lot_id)?;
        Ok(self.hub.subscribe(lot_id, lot.snapshot(), &self.clock))
    }
}

/// Baseline audit row for a lot event; callers fill in the specifics.
pub(crate) fn audit_event(lot: &Lot, kind: AuditKind, at: UnixSeconds) -> AuditEvent {
    AuditEvent {
        id: Uuid::new_v4(),
        lot_id: lot.id,
        auction_id: lot.auction_id,
        bidder_id: None,
        kind,
        previous_amount: None,
        new_amount: None,
        result_code: None,
        result_message: None,
        snapshot: serde_json::to_value(lot.snapshot()).unwrap_or(serde_json::Value::Null),
        created_at: at,
    }
}
