//! Invoice generation at auction close.
//!
//! Runs once per auction: sold lots are grouped per winning bidder, premium
//! and tax are computed per lot with half-up cent rounding, and the invoice
//! totals are sums of the already-rounded line figures so the
//! `total = subtotal + premium + tax + shipping` identity holds exactly.

use std::collections::BTreeMap;

use chrono::DateTime;
use rust_decimal::Decimal;
use tracing::{info, instrument};
use uuid::Uuid;

use shared::rules::{premium_rate, round_cents};
use shared::types::{
    AuctionId, FulfillmentStatus, Invoice, InvoiceId, InvoiceItem, Lot, LotStatus, PaymentStatus,
    UnixSeconds, UserId,
};

use crate::engine::Engine;
use crate::error::{EngineError, ResultCode};
use crate::store::StoreError;

impl Engine {
    /// Generate the invoices for a closed auction, one per winning bidder.
    /// Fails with `ALREADY_GENERATED` on any repeat call.
    #[instrument(skip(self), fields(auction = %auction_id))]
    pub fn generate_invoices(&self, auction_id: AuctionId) -> Result<Vec<InvoiceId>, EngineError> {
        let auction = self.store.auction(auction_id)?;
        if auction.status != shared::types::AuctionStatus::Closed {
            return Err(EngineError::rejected(
                ResultCode::NotClosed,
                "invoices are generated after the auction closes",
            ));
        }
        if !self.store.invoices_of_auction(auction_id).is_empty() {
            return Err(EngineError::rejected(
                ResultCode::AlreadyGenerated,
                "invoices already exist for this auction",
            ));
        }

        let mut by_bidder: BTreeMap<UserId, Vec<Lot>> = BTreeMap::new();
        for lot in self.store.lots_of_auction(auction_id)? {
            if lot.status == LotStatus::Sold {
                let bidder = lot.current_bidder_id.ok_or_else(|| {
                    EngineError::Invariant(format!("sold lot {} has no winning bidder", lot.id))
                })?;
                by_bidder.entry(bidder).or_default().push(lot);
            }
        }

        let now = self.clock.now();
        let tax_rate = auction.tax_rate.unwrap_or(Decimal::ZERO);
        let mut invoices = Vec::with_capacity(by_bidder.len());
        for (bidder, mut lots) in by_bidder {
            lots.sort_by_key(|l| l.lot_number);
            let items: Vec<InvoiceItem> = lots
                .iter()
                .map(|lot| invoice_item(lot, &auction.premium_rules, tax_rate))
                .collect();

            let subtotal: Decimal = items.iter().map(|i| i.winning_bid).sum();
            let premium: Decimal = items.iter().map(|i| i.premium_amount).sum();
            let tax: Decimal = items.iter().map(|i| i.tax_amount).sum();
            let shipping: Decimal = items.iter().map(|i| i.shipping_amount).sum();

            invoices.push(Invoice {
                id: Uuid::new_v4(),
                invoice_number: self.next_invoice_number(now),
                auction_id,
                bidder_id: bidder,
                items,
                subtotal,
                premium,
                tax,
                shipping,
                total: subtotal + premium + tax + shipping,
                payment_status: PaymentStatus::Unpaid,
                fulfillment_status: FulfillmentStatus::Pending,
                created_at: now,
            });
        }

        let ids: Vec<InvoiceId> = invoices.iter().map(|i| i.id).collect();
        self.store
            .insert_invoices(auction_id, invoices)
            .map_err(|err| match err {
                StoreError::Conflict(_) => EngineError::rejected(
                    ResultCode::AlreadyGenerated,
                    "invoices already exist for this auction",
                ),
                other => EngineError::Store(other),
            })?;
        info!(count = ids.len(), "invoices generated");
        Ok(ids)
    }

    /// `INV-YYYYMMDD-NNNNN`; the sequence is system-wide, not per day.
    fn next_invoice_number(&self, now: UnixSeconds) -> String {
        let date = DateTime::from_timestamp(now, 0)
            .map(|d| d.format("%Y%m%d").to_string())
            .unwrap_or_else(|| "00000000".into());
        format!("INV-{date}-{:05}", self.store.next_invoice_seq())
    }

    pub fn invoice(&self, id: InvoiceId) -> Result<Invoice, EngineError> {
        Ok(self.store.invoice(id)?)
    }

    pub fn invoices_of_auction(&self, auction_id: AuctionId) -> Vec<Invoice> {
        self.store.invoices_of_auction(auction_id)
    }

    pub fn invoices_of_bidder(&self, bidder: UserId) -> Vec<Invoice> {
        self.store.invoices_of_bidder(bidder)
    }

    pub fn mark_invoice_paid(&self, id: InvoiceId) -> Result<Invoice, EngineError> {
        self.store.update_invoice_status(id, |invoice| {
            invoice.payment_status = PaymentStatus::Paid;
        })?;
        Ok(self.store.invoice(id)?)
    }

    pub fn set_fulfillment(
        &self,
        id: InvoiceId,
        status: FulfillmentStatus,
    ) -> Result<Invoice, EngineError> {
        self.store.update_invoice_status(id, |invoice| {
            invoice.fulfillment_status = status;
        })?;
        Ok(self.store.invoice(id)?)
    }
}

fn invoice_item(lot: &Lot, premium_rules: &[shared::types::PremiumTier], tax_rate: Decimal) -> InvoiceItem {
    let winning_bid = lot.current_bid;
    let rate = premium_rate(winning_bid, premium_rules);
    let premium_amount = round_cents(winning_bid * rate);
    let tax_amount = round_cents((winning_bid + premium_amount) * tax_rate);
    let shipping_amount = round_cents(lot.shipping_amount);
    InvoiceItem {
        lot_id: lot.id,
        lot_number: lot.lot_number,
        title: lot.title.clone(),
        winning_bid,
        premium_rate: rate,
        premium_amount,
        tax_rate,
        tax_amount,
        shipping_amount,
        line_total: winning_bid + premium_amount + tax_amount + shipping_amount,
    }
}
