//! Bid acceptance and proxy resolution.
//!
//! Everything here runs inside a single per-lot store transaction; the hub
//! and notifier are only touched after commit. Policy refusals still commit,
//! because the `bid_rejected` audit row must survive.

use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{instrument, warn};
use uuid::Uuid;

use shared::events::FeedFrame;
use shared::rules::{increment, min_next_bid};
use shared::types::{
    AuditKind, Bid, BidStatus, BidType, Lot, LotId, LotSnapshot, LotStatus, UnixMillis,
    UnixSeconds, UserId,
};

use crate::engine::{audit_event, Engine};
use crate::error::{EngineError, ResultCode};
use crate::store::{LotTxn, StoreError};

#[derive(Debug, Clone)]
pub struct PlaceBidRequest {
    pub lot_id: LotId,
    pub bidder_id: UserId,
    pub amount: Decimal,
    pub max_bid: Option<Decimal>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// What a bid or buy-now call hands back: the fresh lot snapshot plus the
/// flags the caller needs to render the result.
#[derive(Debug, Clone)]
pub struct BidOutcome {
    pub result_code: ResultCode,
    /// True when the caller now holds the lot.
    pub accepted: bool,
    pub proxy_triggered: bool,
    pub outbid_occurred: bool,
    pub lot: LotSnapshot,
    pub min_next_bid: Decimal,
    pub message: String,
}

/// Committed result of one bid transaction, before fan-out.
enum Applied {
    Accepted {
        proxy_triggered: bool,
        outbid_user: Option<UserId>,
        frames: Vec<FeedFrame>,
        snapshot: LotSnapshot,
        floor: Decimal,
    },
    /// State changed, but the incumbent's proxy held the lot.
    Defended {
        frames: Vec<FeedFrame>,
        snapshot: LotSnapshot,
        floor: Decimal,
    },
    Refused {
        code: ResultCode,
        message: String,
    },
}

impl Engine {
    /// Place a bid, optionally with a proxy maximum.
    ///
    /// Serialization conflicts retry the whole call on the configured
    /// backoff schedule; once the schedule is exhausted the caller gets
    /// `TRANSIENT_CONFLICT` and no state has changed.
    #[instrument(skip(self, req), fields(lot = %req.lot_id, bidder = %req.bidder_id))]
    pub async fn place_bid(&self, req: PlaceBidRequest) -> Result<BidOutcome, EngineError> {
        let mut attempt = 0usize;
        let applied = loop {
            match self.run_bid_txn(&req) {
                Err(EngineError::Store(StoreError::Aborted)) => {
                    if attempt >= self.config.retry_backoff_ms.len() {
                        warn!("bid retries exhausted");
                        return Err(EngineError::rejected(
                            ResultCode::TransientConflict,
                            "the lot is under heavy contention, please retry",
                        ));
                    }
                    let delay = self.config.retry_backoff_ms[attempt];
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(EngineError::Store(StoreError::NotFound(_))) => {
                    return Err(EngineError::rejected(
                        ResultCode::LotNotActive,
                        "lot is not open for bidding",
                    ));
                }
                other => break other?,
            }
        };

        match applied {
            Applied::Accepted {
                proxy_triggered,
                outbid_user,
                frames,
                snapshot,
                floor,
            } => {
                for frame in frames {
                    self.hub.publish(req.lot_id, frame);
                }
                if let Some(user) = outbid_user {
                    self.notifier.outbid(user, &snapshot).await;
                }
                Ok(BidOutcome {
                    result_code: ResultCode::Ok,
                    accepted: true,
                    proxy_triggered,
                    outbid_occurred: outbid_user.is_some(),
                    lot: snapshot,
                    min_next_bid: floor,
                    message: "bid accepted".into(),
                })
            }
            Applied::Defended {
                frames,
                snapshot,
                floor,
            } => {
                for frame in frames {
                    self.hub.publish(req.lot_id, frame);
                }
                let message = format!(
                    "outbid by the incumbent's maximum; current bid is now {}",
                    snapshot.current_bid
                );
                Ok(BidOutcome {
                    result_code: ResultCode::OutbidByProxy,
                    accepted: false,
                    proxy_triggered: true,
                    outbid_occurred: false,
                    lot: snapshot,
                    min_next_bid: floor,
                    message,
                })
            }
            Applied::Refused { code, message } => Err(EngineError::Rejected { code, message }),
        }
    }

    fn run_bid_txn(&self, req: &PlaceBidRequest) -> Result<Applied, EngineError> {
        let now = self.clock.now();
        let now_ms = self.clock.now_millis();
        Ok(self
            .store
            .with_lot(req.lot_id, |txn| Ok(apply_bid(txn, req, now, now_ms)))?)
    }

    /// Immediate purchase at the lot's buy-now price. Transitions the lot to
    /// `Sold` in the same transaction.
    #[instrument(skip(self), fields(lot = %lot_id, bidder = %bidder_id))]
    pub async fn buy_now(
        &self,
        lot_id: LotId,
        bidder_id: UserId,
    ) -> Result<BidOutcome, EngineError> {
        let now = self.clock.now();
        let now_ms = self.clock.now_millis();
        let applied = self
            .store
            .with_lot(lot_id, |txn| Ok(apply_buy_now(txn, bidder_id, now, now_ms)))
            .map_err(|err| match err {
                StoreError::NotFound(_) => EngineError::rejected(
                    ResultCode::LotNotActive,
                    "lot is not open for bidding",
                ),
                StoreError::Aborted => EngineError::rejected(
                    ResultCode::TransientConflict,
                    "the lot is under heavy contention, please retry",
                ),
                other => EngineError::Store(other),
            })?;

        match applied {
            Applied::Accepted {
                outbid_user,
                frames,
                snapshot,
                floor,
                ..
            } => {
                for frame in frames {
                    self.hub.publish(lot_id, frame);
                }
                if let Some(user) = outbid_user {
                    self.notifier.outbid(user, &snapshot).await;
                }
                self.notifier.lot_closed(&snapshot).await;
                Ok(BidOutcome {
                    result_code: ResultCode::Ok,
                    accepted: true,
                    proxy_triggered: false,
                    outbid_occurred: outbid_user.is_some(),
                    lot: snapshot,
                    min_next_bid: floor,
                    message: "lot purchased".into(),
                })
            }
            Applied::Refused { code, message } => Err(EngineError::Rejected { code, message }),
            Applied::Defended { .. } => Err(EngineError::Invariant(
                "buy now cannot be proxy-defended".into(),
            )),
        }
    }
}

fn apply_bid(txn: &mut LotTxn, req: &PlaceBidRequest, now: UnixSeconds, now_ms: UnixMillis) -> Applied {
    // Preconditions in contract order; the first failure short-circuits with
    // a bid_rejected audit row.
    if req.amount <= Decimal::ZERO {
        return refuse(
            txn,
            req.bidder_id,
            req.amount,
            ResultCode::InvalidAmount,
            "bid amount must be positive".into(),
            now,
        );
    }
    if let Some(max) = req.max_bid {
        if max < req.amount {
            return refuse(
                txn,
                req.bidder_id,
                req.amount,
                ResultCode::InvalidMaxBid,
                "maximum bid must be at least the bid amount".into(),
                now,
            );
        }
    }
    if txn.lot().status != LotStatus::Active {
        return refuse(
            txn,
            req.bidder_id,
            req.amount,
            ResultCode::LotNotActive,
            "lot is not open for bidding".into(),
            now,
        );
    }
    if now >= txn.lot().current_close_at {
        return refuse(
            txn,
            req.bidder_id,
            req.amount,
            ResultCode::AuctionClosed,
            "bidding on this lot has closed".into(),
            now,
        );
    }
    let rules = txn.effective_increment_rules().to_vec();
    let floor = min_next_bid(txn.lot().current_bid, txn.lot().starting_bid, &rules);
    if req.amount < floor {
        return refuse(
            txn,
            req.bidder_id,
            req.amount,
            ResultCode::BidTooLow,
            format!("bid must be at least {floor}"),
            now,
        );
    }
    if txn.lot().current_bidder_id == Some(req.bidder_id) {
        return refuse(
            txn,
            req.bidder_id,
            req.amount,
            ResultCode::SelfOutbid,
            "you already hold the high bid".into(),
            now,
        );
    }

    let step = increment(txn.lot().current_bid, &rules);
    let holder = txn.lot().current_bidder_id;
    let holder_max = holder
        .and_then(|h| txn.active_max_bid(h))
        .and_then(|b| b.max_bid);

    match (holder, holder_max) {
        (Some(defender), Some(h_max)) => {
            if req.max_bid == Some(h_max) {
                // Equal maximums: the earlier one stands.
                return refuse(
                    txn,
                    req.bidder_id,
                    req.amount,
                    ResultCode::MaxBidTied,
                    format!("an equal maximum bid is already in place at {h_max}"),
                    now,
                );
            }
            let effective_max = req.max_bid.unwrap_or(req.amount);
            if effective_max > h_max {
                overtake(txn, req, defender, h_max, step, now, now_ms)
            } else {
                defend(txn, req, defender, h_max, effective_max, step, now, now_ms)
            }
        }
        _ => accept_outright(txn, req, now, now_ms),
    }
}

/// Case A: no standing maximum to beat; the bid lands as given.
fn accept_outright(
    txn: &mut LotTxn,
    req: &PlaceBidRequest,
    now: UnixSeconds,
    now_ms: UnixMillis,
) -> Applied {
    let prev_amount = txn.lot().current_bid;
    let outbid_user = displace_winner(txn, now);
    txn.deactivate_max_bids(req.bidder_id);

    let mut row = bid_row(txn.lot(), req.bidder_id, req.amount, BidType::Manual, now);
    row.max_bid = req.max_bid;
    row.max_bid_active = req.max_bid.is_some();
    row.is_winning = true;
    row.ip_address = req.ip_address.clone();
    row.user_agent = req.user_agent.clone();
    txn.insert_bid(row);

    let lot = txn.lot_mut();
    lot.current_bid = req.amount;
    lot.current_bidder_id = Some(req.bidder_id);
    lot.bid_count += 1;

    let mut event = audit_event(txn.lot(), AuditKind::BidPlaced, now);
    event.bidder_id = Some(req.bidder_id);
    event.previous_amount = Some(prev_amount);
    event.new_amount = Some(req.amount);
    event.result_code = Some(ResultCode::Ok.as_str().into());
    txn.audit(event);

    if let Some(user) = outbid_user {
        let mut event = audit_event(txn.lot(), AuditKind::OutbidOccurred, now);
        event.bidder_id = Some(user);
        event.previous_amount = Some(prev_amount);
        event.new_amount = Some(req.amount);
        txn.audit(event);
    }

    let (frames, snapshot, floor) = finish_state_change(txn, now, now_ms);
    Applied::Accepted {
        proxy_triggered: false,
        outbid_user,
        frames,
        snapshot,
        floor,
    }
}

/// Case B: the challenger's maximum beats the incumbent cap. The incumbent
/// makes a final proxy stand at their cap, then the challenger takes the lot
/// one step above it (clamped to their own maximum).
fn overtake(
    txn: &mut LotTxn,
    req: &PlaceBidRequest,
    defender: UserId,
    h_max: Decimal,
    step: Decimal,
    now: UnixSeconds,
    now_ms: UnixMillis,
) -> Applied {
    let prev_amount = txn.lot().current_bid;
    let effective_max = req.max_bid.unwrap_or(req.amount);
    let new_current = effective_max.min(h_max + step);

    displace_winner(txn, now);
    txn.deactivate_max_bids(defender);
    txn.deactivate_max_bids(req.bidder_id);

    let mut stand = bid_row(txn.lot(), defender, h_max, BidType::Proxy, now);
    stand.max_bid = Some(h_max);
    stand.status = BidStatus::Outbid;
    stand.outbid_at = Some(now);
    txn.insert_bid(stand);

    let mut row = bid_row(txn.lot(), req.bidder_id, new_current, BidType::Manual, now);
    row.previous_amount = h_max;
    row.previous_bidder_id = Some(defender);
    row.max_bid = req.max_bid;
    row.max_bid_active = req.max_bid.is_some();
    row.is_winning = true;
    row.ip_address = req.ip_address.clone();
    row.user_agent = req.user_agent.clone();
    txn.insert_bid(row);

    let lot = txn.lot_mut();
    lot.current_bid = new_current;
    lot.current_bidder_id = Some(req.bidder_id);
    lot.bid_count += 2;

    let mut event = audit_event(txn.lot(), AuditKind::ProxyTriggered, now);
    event.bidder_id = Some(defender);
    event.previous_amount = Some(prev_amount);
    event.new_amount = Some(h_max);
    txn.audit(event);

    let mut event = audit_event(txn.lot(), AuditKind::BidPlaced, now);
    event.bidder_id = Some(req.bidder_id);
    event.previous_amount = Some(h_max);
    event.new_amount = Some(new_current);
    event.result_code = Some(ResultCode::Ok.as_str().into());
    txn.audit(event);

    let mut event = audit_event(txn.lot(), AuditKind::OutbidOccurred, now);
    event.bidder_id = Some(defender);
    event.previous_amount = Some(prev_amount);
    event.new_amount = Some(new_current);
    txn.audit(event);

    let (frames, snapshot, floor) = finish_state_change(txn, now, now_ms);
    Applied::Accepted {
        proxy_triggered: true,
        outbid_user: Some(defender),
        frames,
        snapshot,
        floor,
    }
}

/// Case C: the incumbent's maximum covers the challenge. The challenger's
/// losing bid is recorded at their cap and the incumbent auto-bids the
/// smallest defending amount.
#[allow(clippy::too_many_arguments)]
fn defend(
    txn: &mut LotTxn,
    req: &PlaceBidRequest,
    defender: UserId,
    h_max: Decimal,
    effective_max: Decimal,
    step: Decimal,
    now: UnixSeconds,
    now_ms: UnixMillis,
) -> Applied {
    let prev_amount = txn.lot().current_bid;
    let defended = h_max.min(effective_max + step);

    let mut losing = bid_row(txn.lot(), req.bidder_id, effective_max, BidType::Manual, now);
    losing.max_bid = req.max_bid;
    losing.status = BidStatus::Outbid;
    losing.outbid_at = Some(now);
    losing.ip_address = req.ip_address.clone();
    losing.user_agent = req.user_agent.clone();
    txn.insert_bid(losing);

    displace_winner(txn, now);
    // The cap moves onto the fresh proxy row; older rows go inactive.
    txn.deactivate_max_bids(defender);

    let mut proxy = bid_row(txn.lot(), defender, defended, BidType::Proxy, now);
    proxy.previous_amount = effective_max;
    proxy.previous_bidder_id = Some(req.bidder_id);
    proxy.max_bid = Some(h_max);
    proxy.max_bid_active = true;
    proxy.is_winning = true;
    txn.insert_bid(proxy);

    let lot = txn.lot_mut();
    lot.current_bid = defended;
    lot.bid_count += 2;

    let mut event = audit_event(txn.lot(), AuditKind::BidPlaced, now);
    event.bidder_id = Some(req.bidder_id);
    event.previous_amount = Some(prev_amount);
    event.new_amount = Some(effective_max);
    event.result_code = Some(ResultCode::OutbidByProxy.as_str().into());
    txn.audit(event);

    let mut event = audit_event(txn.lot(), AuditKind::ProxyTriggered, now);
    event.bidder_id = Some(defender);
    event.previous_amount = Some(effective_max);
    event.new_amount = Some(defended);
    txn.audit(event);

    let (frames, snapshot, floor) = finish_state_change(txn, now, now_ms);
    Applied::Defended {
        frames,
        snapshot,
        floor,
    }
}

fn apply_buy_now(
    txn: &mut LotTxn,
    bidder_id: UserId,
    now: UnixSeconds,
    now_ms: UnixMillis,
) -> Applied {
    let buy_now_price = match txn.lot().buy_now_price {
        _ if txn.lot().status != LotStatus::Active => {
            return refuse(
                txn,
                bidder_id,
                Decimal::ZERO,
                ResultCode::LotNotActive,
                "lot is not open for bidding".into(),
                now,
            );
        }
        _ if now >= txn.lot().current_close_at => {
            return refuse(
                txn,
                bidder_id,
                Decimal::ZERO,
                ResultCode::AuctionClosed,
                "bidding on this lot has closed".into(),
                now,
            );
        }
        None => {
            return refuse(
                txn,
                bidder_id,
                Decimal::ZERO,
                ResultCode::NoBuyNow,
                "lot has no buy-now price".into(),
                now,
            );
        }
        Some(price) => price,
    };
    if txn.lot().current_bidder_id == Some(bidder_id) {
        return refuse(
            txn,
            bidder_id,
            buy_now_price,
            ResultCode::SelfOutbid,
            "you already hold the high bid".into(),
            now,
        );
    }

    let prev_amount = txn.lot().current_bid;
    let outbid_user = displace_winner(txn, now);
    if let Some(user) = outbid_user {
        txn.deactivate_max_bids(user);
    }

    let mut row = bid_row(txn.lot(), bidder_id, buy_now_price, BidType::Manual, now);
    row.buy_now = true;
    row.is_winning = true;
    row.status = BidStatus::Won;
    txn.insert_bid(row);

    for bid in txn.bids_mut() {
        if !bid.is_winning {
            bid.status = BidStatus::Lost;
        }
    }

    let lot = txn.lot_mut();
    lot.current_bid = buy_now_price;
    lot.current_bidder_id = Some(bidder_id);
    lot.bid_count += 1;
    lot.status = LotStatus::Sold;
    lot.closed_at = Some(now);

    if update_reserve(txn) {
        let event = audit_event(txn.lot(), AuditKind::ReserveMet, now);
        txn.audit(event);
    }

    let mut event = audit_event(txn.lot(), AuditKind::BuyNowExecuted, now);
    event.bidder_id = Some(bidder_id);
    event.previous_amount = Some(prev_amount);
    event.new_amount = Some(buy_now_price);
    event.result_code = Some(ResultCode::Ok.as_str().into());
    txn.audit(event);

    let event = audit_event(txn.lot(), AuditKind::LotClosed, now);
    txn.audit(event);

    let snapshot = txn.lot().snapshot();
    let frames = vec![
        FeedFrame::bid(snapshot.clone(), now_ms),
        FeedFrame::lot_closed(snapshot.clone(), now_ms),
    ];
    Applied::Accepted {
        proxy_triggered: false,
        outbid_user,
        frames,
        snapshot,
        floor: buy_now_price,
    }
}

/// Reserve check plus soft-close extension, emitting their audit rows and
/// building the post-commit frames. Shared tail of every accepted change.
fn finish_state_change(
    txn: &mut LotTxn,
    now: UnixSeconds,
    now_ms: UnixMillis,
) -> (Vec<FeedFrame>, LotSnapshot, Decimal) {
    let mut frames = Vec::new();
    if update_reserve(txn) {
        let event = audit_event(txn.lot(), AuditKind::ReserveMet, now);
        txn.audit(event);
    }
    frames.push(FeedFrame::bid(txn.lot().snapshot(), now_ms));
    if apply_soft_close(txn, now) {
        let event = audit_event(txn.lot(), AuditKind::SoftCloseTriggered, now);
        txn.audit(event);
        frames.push(FeedFrame::soft_close(txn.lot().snapshot(), now_ms));
    }
    let rules = txn.effective_increment_rules().to_vec();
    let floor = min_next_bid(txn.lot().current_bid, txn.lot().starting_bid, &rules);
    (frames, txn.lot().snapshot(), floor)
}

fn update_reserve(txn: &mut LotTxn) -> bool {
    let lot = txn.lot();
    if lot.reserve_met {
        return false;
    }
    match lot.reserve_price {
        Some(reserve) if lot.current_bid >= reserve => {
            txn.lot_mut().reserve_met = true;
            true
        }
        _ => false,
    }
}

/// Extend the close when the bid landed inside the trigger window.
/// Extensions compound: every qualifying bid pushes the close again.
fn apply_soft_close(txn: &mut LotTxn, now: UnixSeconds) -> bool {
    let auction = txn.auction();
    if !auction.soft_close_enabled {
        return false;
    }
    let (trigger, extension) = (auction.trigger_window, auction.extension);
    if txn.lot().current_close_at - now <= trigger {
        let lot = txn.lot_mut();
        lot.current_close_at = lot.current_close_at.max(now + extension);
        lot.extension_count += 1;
        true
    } else {
        false
    }
}

fn displace_winner(txn: &mut LotTxn, now: UnixSeconds) -> Option<UserId> {
    let winner = txn.winning_bid_mut()?;
    winner.is_winning = false;
    winner.status = BidStatus::Outbid;
    winner.outbid_at = Some(now);
    Some(winner.bidder_id)
}

fn refuse(
    txn: &mut LotTxn,
    bidder: UserId,
    amount: Decimal,
    code: ResultCode,
    message: String,
    now: UnixSeconds,
) -> Applied {
    let mut event = audit_event(txn.lot(), AuditKind::BidRejected, now);
    event.bidder_id = Some(bidder);
    event.previous_amount = Some(txn.lot().current_bid);
    event.new_amount = Some(amount);
    event.result_code = Some(code.as_str().into());
    event.result_message = Some(message.clone());
    txn.audit(event);
    Applied::Refused { code, message }
}

fn bid_row(lot: &Lot, bidder: UserId, amount: Decimal, bid_type: BidType, now: UnixSeconds) -> Bid {
    Bid {
        id: Uuid::new_v4(),
        lot_id: lot.id,
        bidder_id: bidder,
        amount,
        bid_type,
        max_bid: None,
        max_bid_active: false,
        is_winning: false,
        status: BidStatus::Active,
        buy_now: false,
        previous_amount: lot.current_bid,
        previous_bidder_id: lot.current_bidder_id,
        outbid_at: None,
        ip_address: None,
        user_agent: None,
        created_at: now,
    }
}
