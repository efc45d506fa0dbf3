//! Shared fixtures for the unit tests in this crate.

use rust_decimal::Decimal;
use uuid::Uuid;

use shared::rules::default_increment_tiers;
use shared::types::{
    Auction, AuctionStatus, Bid, BidStatus, BidType, FulfillmentStatus, Invoice, InvoiceItem, Lot,
    LotStatus, PaymentStatus, PremiumTier, UnixSeconds, UserId,
};

pub(crate) fn draft_auction(now: UnixSeconds) -> Auction {
    Auction {
        id: Uuid::new_v4(),
        title: "Estate sale".into(),
        status: AuctionStatus::Draft,
        start_at: now,
        end_at: now + 3_600,
        soft_close_enabled: true,
        trigger_window: 300,
        extension: 300,
        increment_rules: default_increment_tiers(),
        premium_rules: vec![PremiumTier {
            min: Decimal::ZERO,
            max: None,
            rate: Decimal::new(15, 2),
        }],
        tax_rate: None,
        created_at: now,
    }
}

pub(crate) fn active_lot(auction: &Auction, number: u32, starting: Decimal) -> Lot {
    Lot {
        id: Uuid::new_v4(),
        auction_id: auction.id,
        lot_number: number,
        title: format!("Lot {number}"),
        description: None,
        category: None,
        condition: None,
        starting_bid: starting,
        reserve_price: None,
        buy_now_price: None,
        increment_rules_override: None,
        shipping_amount: Decimal::ZERO,
        quantity: 1,
        location: None,
        shipping_available: false,
        tags: Vec::new(),
        original_close_at: auction.end_at,
        current_close_at: auction.end_at,
        extension_count: 0,
        status: LotStatus::Active,
        current_bid: Decimal::ZERO,
        current_bidder_id: None,
        bid_count: 0,
        reserve_met: false,
        closed_at: None,
        created_at: auction.created_at,
    }
}

/// A winning manual row as the engine would write it; the caller is
/// responsible for keeping the lot snapshot in agreement.
pub(crate) fn bid_row(lot: &Lot, bidder: UserId, amount: Decimal, at: UnixSeconds) -> Bid {
    Bid {
        id: Uuid::new_v4(),
        lot_id: lot.id,
        bidder_id: bidder,
        amount,
        bid_type: BidType::Manual,
        max_bid: None,
        max_bid_active: false,
        is_winning: true,
        status: BidStatus::Active,
        buy_now: false,
        previous_amount: lot.current_bid,
        previous_bidder_id: lot.current_bidder_id,
        outbid_at: None,
        ip_address: None,
        user_agent: None,
        created_at: at,
    }
}

pub(crate) fn invoice_for(auction: &Auction, lot: &Lot, amount: Decimal) -> Invoice {
    let premium = shared::rules::round_cents(amount * Decimal::new(15, 2));
    Invoice {
        id: Uuid::new_v4(),
        invoice_number: "INV-20260801-00001".into(),
        auction_id: auction.id,
        bidder_id: Uuid::new_v4(),
        items: vec![InvoiceItem {
            lot_id: lot.id,
            lot_number: lot.lot_number,
            title: lot.title.clone(),
            winning_bid: amount,
            premium_rate: Decimal::new(15, 2),
            premium_amount: premium,
            tax_rate: Decimal::ZERO,
            tax_amount: Decimal::ZERO,
            shipping_amount: Decimal::ZERO,
            line_total: amount + premium,
        }],
        subtotal: amount,
        premium,
        tax: Decimal::ZERO,
        shipping: Decimal::ZERO,
        total: amount + premium,
        payment_status: PaymentStatus::Unpaid,
        fulfillment_status: FulfillmentStatus::Pending,
        created_at: auction.created_at,
    }
}
