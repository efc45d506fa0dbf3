//! Lot and auction finalization.
//!
//! Closes are idempotent: re-running on an already-closed lot is a no-op and
//! the `lot_closed` audit row is emitted exactly once per lot. A scheduler
//! tick drives due closes; admins can force the same paths.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument};

use shared::events::FeedFrame;
use shared::types::{
    Auction, AuctionStatus, AuditKind, BidStatus, LotId, LotSnapshot, LotStatus,
};

use crate::engine::{audit_event, Engine};
use crate::error::{EngineError, ResultCode};

enum CloseResult {
    Closed {
        snapshot: LotSnapshot,
        frame: FeedFrame,
    },
    AlreadyTerminal {
        snapshot: LotSnapshot,
    },
    NotOpen,
}

impl Engine {
    /// Finalize one lot: `Sold` when a bidder holds it and any reserve is
    /// met, `Unsold` otherwise. Safe to call again after a crash; the second
    /// run observes the terminal status and does nothing.
    #[instrument(skip(self), fields(lot = %lot_id))]
    pub async fn close_lot(&self, lot_id: LotId) -> Result<LotSnapshot, EngineError> {
        match self.close_lot_inner(lot_id, false)? {
            CloseResult::Closed { snapshot, frame } => {
                self.hub.publish(lot_id, frame);
                self.notifier.lot_closed(&snapshot).await;
                info!(status = ?snapshot.status, "lot closed");
                Ok(snapshot)
            }
            CloseResult::AlreadyTerminal { snapshot } => Ok(snapshot),
            CloseResult::NotOpen => Err(EngineError::rejected(
                ResultCode::NotActive,
                "lot never opened for bidding",
            )),
        }
    }

    fn close_lot_inner(&self, lot_id: LotId, force: bool) -> Result<CloseResult, EngineError> {
        let now = self.clock.now();
        let now_ms = self.clock.now_millis();
        let audited = self.store.lot_close_audited(lot_id);
        let result = self.store.with_lot(lot_id, |txn| {
            match txn.lot().status {
                LotStatus::Active => {}
                LotStatus::Pending if force => {}
                LotStatus::Pending => return Ok(CloseResult::NotOpen),
                _ => {
                    return Ok(CloseResult::AlreadyTerminal {
                        snapshot: txn.lot().snapshot(),
                    })
                }
            }

            let lot = txn.lot();
            let sold = lot.current_bidder_id.is_some()
                && (lot.reserve_price.is_none() || lot.reserve_met);
            let final_status = if sold { LotStatus::Sold } else { LotStatus::Unsold };

            for bid in txn.bids_mut() {
                bid.status = if bid.is_winning && sold {
                    BidStatus::Won
                } else {
                    BidStatus::Lost
                };
            }
            txn.lot_mut().status = final_status;
            txn.lot_mut().closed_at = Some(now);

            if !audited {
                txn.audit(audit_event(txn.lot(), AuditKind::LotClosed, now));
            }
            let snapshot = txn.lot().snapshot();
            Ok(CloseResult::Closed {
                frame: FeedFrame::lot_closed(snapshot.clone(), now_ms),
                snapshot,
            })
        })?;
        Ok(result)
    }

    /// Admin force-close: every open lot is finalized (pending lots close
    /// `Unsold`), the auction transitions to `Closed`, and invoices are
    /// generated.
    #[instrument(skip(self), fields(auction = %auction_id))]
    pub async fn close_auction(&self, auction_id: shared::types::AuctionId) -> Result<Auction, EngineError> {
        let auction = self.store.auction(auction_id)?;
        if auction.status == AuctionStatus::Closed {
            return Ok(auction);
        }
        if auction.status == AuctionStatus::Draft {
            return Err(EngineError::rejected(
                ResultCode::NotActive,
                "draft auctions cannot be closed",
            ));
        }

        for lot in self.store.lots_of_auction(auction_id)? {
            if !lot.status.is_terminal() {
                match self.close_lot_inner(lot.id, true)? {
                    CloseResult::Closed { snapshot, frame } => {
                        self.hub.publish(lot.id, frame);
                        self.notifier.lot_closed(&snapshot).await;
                    }
                    CloseResult::AlreadyTerminal { .. } | CloseResult::NotOpen => {}
                }
            }
        }
        self.finalize_auction(auction_id)
    }

    /// Mark the auction closed and run the invoicer. Idempotent on the
    /// invoicing side: a prior generation is left untouched.
    pub(crate) fn finalize_auction(
        &self,
        auction_id: shared::types::AuctionId,
    ) -> Result<Auction, EngineError> {
        self.store.update_auction(auction_id, |auction| {
            auction.status = AuctionStatus::Closed;
            Ok(())
        })?;
        match self.generate_invoices(auction_id) {
            Ok(_) => {}
            Err(EngineError::Rejected {
                code: ResultCode::AlreadyGenerated,
                ..
            }) => {}
            Err(err) => return Err(err),
        }
        info!(%auction_id, "auction closed");
        Ok(self.store.auction(auction_id)?)
    }

    /// One scheduler pass: activate published auctions whose start time has
    /// arrived, close every due lot, then close auctions whose lots are all
    /// terminal. Per-item failures are logged and never stop the pass.
    pub async fn tick(&self) -> usize {
        let now = self.clock.now();

        for auction in self.store.auctions(Some(AuctionStatus::Published)) {
            if auction.start_at <= now {
                if let Err(err) = self.activate_auction(auction.id) {
                    error!(auction = %auction.id, %err, "auto-activation failed");
                }
            }
        }

        let mut closed = 0usize;
        for lot_id in self.store.due_lots(now) {
            match self.close_lot(lot_id).await {
                Ok(_) => closed += 1,
                Err(err) => error!(lot = %lot_id, %err, "scheduled close failed"),
            }
        }

        for auction_id in self.store.auctions_ready_to_close() {
            if let Err(err) = self.finalize_auction(auction_id) {
                error!(auction = %auction_id, %err, "auction finalization failed");
            }
        }
        closed
    }
}

/// Time-based trigger loop: wakes on a fixed interval and lets the engine
/// process whatever has become due.
pub struct Scheduler {
    engine: Arc<Engine>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        let tick_interval = Duration::from_millis(engine.config.close_tick_ms);
        Self {
            engine,
            tick_interval,
        }
    }

    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            interval.tick().await;
            self.engine.tick().await;
        }
    }
}
