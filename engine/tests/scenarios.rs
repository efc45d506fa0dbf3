//! End-to-end bidding scenarios over the public engine API.

use std::sync::Arc;

use anyhow::Result;
use rust_decimal::Decimal;
use uuid::Uuid;

use engine::{
    AuctionParams, Clock, Engine, EngineConfig, EngineError, LotParams, PlaceBidRequest,
    ResultCode,
};
use shared::types::{
    Auction, AuctionId, AuctionStatus, AuditKind, BidType, IncrementTier, LotId, LotStatus,
    PremiumTier,
};

const T0: i64 = 1_700_000_000;

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn new_engine(soft_close: bool) -> (Arc<Engine>, Auction) {
    let engine = Arc::new(Engine::new(Clock::manual(T0), EngineConfig::default()));
    let auction = engine
        .create_auction(AuctionParams {
            title: "Saturday estate sale".into(),
            start_at: T0,
            end_at: T0 + 3_600,
            soft_close_enabled: soft_close,
            trigger_window: 300,
            extension: 300,
            increment_rules: None,
            premium_rules: vec![PremiumTier {
                min: Decimal::ZERO,
                max: None,
                rate: dec("0.15"),
            }],
            tax_rate: None,
        })
        .unwrap();
    (engine, auction)
}

fn lot_params(number: u32, starting: Decimal) -> LotParams {
    LotParams {
        lot_number: number,
        title: format!("Lot {number}"),
        description: None,
        category: None,
        condition: None,
        starting_bid: starting,
        reserve_price: None,
        buy_now_price: None,
        increment_rules_override: None,
        shipping_amount: None,
        quantity: None,
        location: None,
        shipping_available: false,
        tags: Vec::new(),
    }
}

fn flat_ten_step() -> Option<Vec<IncrementTier>> {
    Some(vec![IncrementTier {
        min: Decimal::ZERO,
        max: None,
        step: Decimal::from(10),
    }])
}

fn open(engine: &Engine, auction: AuctionId) {
    engine.publish_auction(auction).unwrap();
    engine.activate_auction(auction).unwrap();
}

async fn place(
    engine: &Engine,
    lot: LotId,
    bidder: Uuid,
    amount: Decimal,
    max: Option<Decimal>,
) -> std::result::Result<engine::BidOutcome, EngineError> {
    engine
        .place_bid(PlaceBidRequest {
            lot_id: lot,
            bidder_id: bidder,
            amount,
            max_bid: max,
            ip_address: None,
            user_agent: None,
        })
        .await
}

#[tokio::test]
async fn increment_floor_moves_with_the_tier_table() -> Result<()> {
    let (engine, auction) = new_engine(false);
    let lot = engine.add_lot(auction.id, lot_params(1, Decimal::from(100)))?;
    open(&engine, auction.id);
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

    let outcome = place(&engine, lot.id, u1, Decimal::from(100), None).await?;
    assert_eq!(outcome.lot.current_bid, Decimal::from(100));

    // 100 sits in the 100-500 band, so the floor is now 110.
    let err = place(&engine, lot.id, u2, Decimal::from(105), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::BidTooLow);
    assert!(err.to_string().contains("110"));

    let outcome = place(&engine, lot.id, u2, Decimal::from(110), None).await?;
    assert_eq!(outcome.lot.current_bid, Decimal::from(110));
    assert_eq!(outcome.lot.current_bidder_id, Some(u2));
    Ok(())
}

#[tokio::test]
async fn proxy_defends_the_incumbent_within_their_maximum() -> Result<()> {
    let (engine, auction) = new_engine(false);
    let mut params = lot_params(1, Decimal::ZERO);
    params.increment_rules_override = flat_ten_step();
    let lot = engine.add_lot(auction.id, params)?;
    open(&engine, auction.id);
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

    place(&engine, lot.id, u1, Decimal::from(50), Some(Decimal::from(200))).await?;

    let outcome = place(&engine, lot.id, u2, Decimal::from(60), None).await?;
    assert_eq!(outcome.result_code, ResultCode::OutbidByProxy);
    assert!(!outcome.accepted);
    assert!(outcome.proxy_triggered);
    assert_eq!(outcome.lot.current_bid, Decimal::from(70));
    assert_eq!(outcome.lot.current_bidder_id, Some(u1));
    assert_eq!(outcome.lot.bid_count, 3);

    // Two rows appended: the losing manual bid, then the proxy defense.
    let bids = engine.bid_history(lot.id)?;
    assert_eq!(bids.len(), 3);
    let challenger = &bids[1];
    assert_eq!(challenger.bidder_id, u2);
    assert_eq!(challenger.amount, Decimal::from(60));
    assert_eq!(challenger.bid_type, BidType::Manual);
    assert!(!challenger.is_winning);
    let defense = &bids[2];
    assert_eq!(defense.bidder_id, u1);
    assert_eq!(defense.amount, Decimal::from(70));
    assert_eq!(defense.bid_type, BidType::Proxy);
    assert!(defense.is_winning);
    assert!(defense.max_bid_active);

    let kinds: Vec<AuditKind> = engine.audit_trail(lot.id).iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&AuditKind::ProxyTriggered));
    assert!(kinds.contains(&AuditKind::BidPlaced));
    Ok(())
}

#[tokio::test]
async fn a_larger_maximum_overtakes_the_standing_proxy() -> Result<()> {
    let (engine, auction) = new_engine(false);
    let mut params = lot_params(1, Decimal::ZERO);
    params.increment_rules_override = flat_ten_step();
    let lot = engine.add_lot(auction.id, params)?;
    open(&engine, auction.id);
    let (u1, u2, u3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    place(&engine, lot.id, u1, Decimal::from(50), Some(Decimal::from(200))).await?;
    place(&engine, lot.id, u2, Decimal::from(60), None).await.ok();
    assert_eq!(engine.lot_snapshot(lot.id)?.current_bid, Decimal::from(70));

    let outcome = place(&engine, lot.id, u3, Decimal::from(80), Some(Decimal::from(300))).await?;
    assert_eq!(outcome.result_code, ResultCode::Ok);
    assert!(outcome.proxy_triggered);
    assert!(outcome.outbid_occurred);
    // min(300, 200 + 10)
    assert_eq!(outcome.lot.current_bid, Decimal::from(210));
    assert_eq!(outcome.lot.current_bidder_id, Some(u3));
    assert_eq!(outcome.lot.bid_count, 5);

    // U1's cap is exhausted everywhere.
    let bids = engine.bid_history(lot.id)?;
    assert!(bids
        .iter()
        .filter(|b| b.bidder_id == u1)
        .all(|b| !b.max_bid_active));
    // Exactly one winning row, and it matches the snapshot.
    let winners: Vec<_> = bids.iter().filter(|b| b.is_winning).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].bidder_id, u3);
    assert_eq!(winners[0].amount, Decimal::from(210));
    Ok(())
}

#[tokio::test]
async fn equal_maximums_tie_and_first_in_wins() -> Result<()> {
    let (engine, auction) = new_engine(false);
    let mut params = lot_params(1, Decimal::ZERO);
    params.increment_rules_override = flat_ten_step();
    let lot = engine.add_lot(auction.id, params)?;
    open(&engine, auction.id);
    let (u1, u4) = (Uuid::new_v4(), Uuid::new_v4());

    place(&engine, lot.id, u1, Decimal::from(70), Some(Decimal::from(200))).await?;
    let audits_before = engine.audit_trail(lot.id).len();

    let err = place(&engine, lot.id, u4, Decimal::from(100), Some(Decimal::from(200)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::MaxBidTied);

    let snapshot = engine.lot_snapshot(lot.id)?;
    assert_eq!(snapshot.current_bid, Decimal::from(70));
    assert_eq!(snapshot.current_bidder_id, Some(u1));
    assert_eq!(snapshot.bid_count, 1);

    let audits = engine.audit_trail(lot.id);
    assert_eq!(audits.len(), audits_before + 1);
    assert_eq!(audits.last().unwrap().kind, AuditKind::BidRejected);
    assert_eq!(
        audits.last().unwrap().result_code.as_deref(),
        Some("MAX_BID_TIED")
    );
    Ok(())
}

#[tokio::test]
async fn soft_close_extensions_compound() -> Result<()> {
    let (engine, auction) = new_engine(true);
    let lot = engine.add_lot(auction.id, lot_params(1, Decimal::from(10)))?;
    open(&engine, auction.id);
    let close = T0 + 3_600;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

    // Two minutes before close: inside the five-minute trigger window.
    engine.clock().set(close - 120);
    let outcome = place(&engine, lot.id, u1, Decimal::from(10), None).await?;
    let first_extension = close - 120 + 300;
    assert_eq!(outcome.lot.current_close_at, first_extension);
    assert_eq!(outcome.lot.extension_count, 1);

    // One minute before the new close: extends again, compounding.
    engine.clock().set(first_extension - 60);
    let outcome = place(&engine, lot.id, u2, Decimal::from(15), None).await?;
    assert_eq!(outcome.lot.current_close_at, first_extension - 60 + 300);
    assert_eq!(outcome.lot.extension_count, 2);
    assert!(outcome.lot.current_close_at > first_extension);

    let kinds: Vec<AuditKind> = engine.audit_trail(lot.id).iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == AuditKind::SoftCloseTriggered)
            .count(),
        2
    );
    Ok(())
}

#[tokio::test]
async fn reserve_not_met_closes_the_lot_unsold() -> Result<()> {
    let (engine, auction) = new_engine(false);
    let mut params = lot_params(1, Decimal::from(100));
    params.reserve_price = Some(Decimal::from(500));
    let lot = engine.add_lot(auction.id, params)?;
    open(&engine, auction.id);
    let u1 = Uuid::new_v4();

    place(&engine, lot.id, u1, Decimal::from(400), None).await?;
    assert!(!engine.lot_snapshot(lot.id)?.reserve_met);

    engine.clock().advance_secs(4_000);
    let snapshot = engine.close_lot(lot.id).await?;
    assert_eq!(snapshot.status, LotStatus::Unsold);

    let bids = engine.bid_history(lot.id)?;
    assert!(bids
        .iter()
        .all(|b| b.status == shared::types::BidStatus::Lost));
    assert!(engine
        .audit_trail(lot.id)
        .iter()
        .any(|e| e.kind == AuditKind::LotClosed));
    Ok(())
}

#[tokio::test]
async fn invoices_round_half_up_and_reconcile() -> Result<()> {
    let (engine, auction) = new_engine(false);
    let lot_a = engine.add_lot(auction.id, lot_params(1, Decimal::from(100)))?;
    let lot_b = engine.add_lot(auction.id, lot_params(2, dec("250.55")))?;
    open(&engine, auction.id);
    let winner = Uuid::new_v4();

    place(&engine, lot_a.id, winner, Decimal::from(100), None).await?;
    place(&engine, lot_b.id, winner, dec("250.55"), None).await?;

    engine.clock().advance_secs(4_000);
    assert_eq!(engine.tick().await, 2);
    assert_eq!(engine.auction(auction.id)?.status, AuctionStatus::Closed);

    let invoices = engine.invoices_of_auction(auction.id);
    assert_eq!(invoices.len(), 1);
    let invoice = &invoices[0];
    assert_eq!(invoice.bidder_id, winner);
    assert_eq!(invoice.items[0].premium_amount, dec("15.00"));
    assert_eq!(invoice.items[0].line_total, dec("115.00"));
    assert_eq!(invoice.items[1].premium_amount, dec("37.58"));
    assert_eq!(invoice.items[1].line_total, dec("288.13"));
    assert_eq!(invoice.subtotal, dec("350.55"));
    assert_eq!(invoice.premium, dec("52.58"));
    assert_eq!(invoice.total, dec("403.13"));
    assert_eq!(
        invoice.total,
        invoice.subtotal + invoice.premium + invoice.tax + invoice.shipping
    );
    assert!(invoice.invoice_number.starts_with("INV-"));
    assert!(invoice.invoice_number.ends_with("-00001"));

    // Second generation is refused and changes nothing.
    let err = engine.generate_invoices(auction.id).unwrap_err();
    assert_eq!(err.code(), ResultCode::AlreadyGenerated);
    assert_eq!(engine.invoices_of_auction(auction.id).len(), 1);
    Ok(())
}

#[tokio::test]
async fn buy_now_sells_the_lot_immediately() -> Result<()> {
    let (engine, auction) = new_engine(false);
    let mut params = lot_params(1, Decimal::from(10));
    params.buy_now_price = Some(Decimal::from(500));
    let lot = engine.add_lot(auction.id, params)?;
    open(&engine, auction.id);
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

    place(&engine, lot.id, u1, Decimal::from(10), None).await?;
    let outcome = engine.buy_now(lot.id, u2).await?;
    assert_eq!(outcome.lot.status, LotStatus::Sold);
    assert_eq!(outcome.lot.current_bid, Decimal::from(500));
    assert_eq!(outcome.lot.current_bidder_id, Some(u2));

    let kinds: Vec<AuditKind> = engine.audit_trail(lot.id).iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&AuditKind::BuyNowExecuted));
    assert!(kinds.contains(&AuditKind::LotClosed));

    // No further bids, and the holder cannot buy their own lot back.
    let err = place(&engine, lot.id, u1, Decimal::from(600), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::LotNotActive);
    let err = engine.buy_now(lot.id, u2).await.unwrap_err();
    assert_eq!(err.code(), ResultCode::LotNotActive);
    Ok(())
}

#[tokio::test]
async fn bids_at_the_close_boundary() -> Result<()> {
    let (engine, auction) = new_engine(false);
    let lot = engine.add_lot(auction.id, lot_params(1, Decimal::from(10)))?;
    open(&engine, auction.id);
    let close = T0 + 3_600;

    // One second before close: accepted.
    engine.clock().set(close - 1);
    place(&engine, lot.id, Uuid::new_v4(), Decimal::from(10), None).await?;

    // Exactly at close: rejected.
    engine.clock().set(close);
    let err = place(&engine, lot.id, Uuid::new_v4(), Decimal::from(15), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::AuctionClosed);
    Ok(())
}

#[tokio::test]
async fn bid_of_exactly_the_floor_is_accepted_and_a_cent_less_is_not() -> Result<()> {
    let (engine, auction) = new_engine(false);
    let lot = engine.add_lot(auction.id, lot_params(1, Decimal::from(50)))?;
    open(&engine, auction.id);
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

    place(&engine, lot.id, u1, Decimal::from(50), None).await?;
    // Floor is 55; a cent short is refused.
    let err = place(&engine, lot.id, u2, dec("54.99"), None).await.unwrap_err();
    assert_eq!(err.code(), ResultCode::BidTooLow);
    let outcome = place(&engine, lot.id, u2, Decimal::from(55), None).await?;
    assert_eq!(outcome.result_code, ResultCode::Ok);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bids_leave_exactly_one_winner() -> Result<()> {
    let (engine, auction) = new_engine(false);
    let lot = engine.add_lot(auction.id, lot_params(1, Decimal::from(1)))?;
    open(&engine, auction.id);
    let lot_id = lot.id;

    let mut handles = Vec::new();
    for i in 0..24u32 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let bidder = Uuid::new_v4();
            let amount = Decimal::from(1 + i * 7);
            let max = (i % 3 == 0).then(|| amount + Decimal::from(50));
            let _ = place(&engine, lot_id, bidder, amount, max).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let snapshot = engine.lot_snapshot(lot_id)?;
    let bids = engine.bid_history(lot_id)?;
    let winners: Vec<_> = bids.iter().filter(|b| b.is_winning).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].amount, snapshot.current_bid);
    assert_eq!(Some(winners[0].bidder_id), snapshot.current_bidder_id);
    assert_eq!(bids.len() as u32, snapshot.bid_count);

    // The audited amount sequence never decreases across accepted writes.
    let amounts: Vec<Decimal> = engine
        .audit_trail(lot_id)
        .iter()
        .filter(|e| matches!(e.kind, AuditKind::BidPlaced | AuditKind::ProxyTriggered))
        .filter_map(|e| e.new_amount)
        .collect();
    for pair in amounts.windows(2) {
        assert!(pair[1] >= pair[0]);
    }
    // Every bid_placed audit corresponds to a committed row.
    for event in engine
        .audit_trail(lot_id)
        .iter()
        .filter(|e| e.kind == AuditKind::BidPlaced)
    {
        assert!(bids.iter().any(|b| {
            Some(b.bidder_id) == event.bidder_id
                && Some(b.amount) == event.new_amount
                && b.created_at == event.created_at
        }));
    }
    Ok(())
}

#[tokio::test]
async fn current_bid_is_non_decreasing_over_a_random_history() -> Result<()> {
    let (engine, auction) = new_engine(false);
    let lot = engine.add_lot(auction.id, lot_params(1, Decimal::from(5)))?;
    open(&engine, auction.id);

    let mut last = Decimal::ZERO;
    let mut amount = Decimal::from(5);
    for i in 0..40u32 {
        let bidder = Uuid::from_u128(u128::from(i % 5) + 1);
        let max = (i % 4 == 0).then(|| amount + Decimal::from(20));
        match place(&engine, lot.id, bidder, amount, max).await {
            Ok(outcome) => {
                assert!(outcome.lot.current_bid >= last);
                last = outcome.lot.current_bid;
            }
            Err(err) => {
                // Refusals never move the price.
                assert_eq!(engine.lot_snapshot(lot.id)?.current_bid, last);
                let _ = err;
            }
        }
        amount += Decimal::from(7);
    }
    Ok(())
}

#[tokio::test]
async fn watchlist_round_trips_and_is_idempotent() -> Result<()> {
    let (engine, auction) = new_engine(false);
    let lot = engine.add_lot(auction.id, lot_params(1, Decimal::from(5)))?;
    open(&engine, auction.id);
    let user = Uuid::new_v4();

    assert!(engine.add_watch(user, lot.id)?);
    assert!(!engine.add_watch(user, lot.id)?);
    assert_eq!(engine.watched_lots(user).len(), 1);
    assert!(engine.remove_watch(user, lot.id)?);
    assert!(engine.watched_lots(user).is_empty());
    Ok(())
}
