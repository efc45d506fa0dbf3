use async_graphql::{Enum, InputObject, SimpleObject};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type AuctionId = Uuid;
pub type LotId = Uuid;
pub type BidId = Uuid;
pub type UserId = Uuid;
pub type InvoiceId = Uuid;
pub type BatchId = Uuid;
pub type MappingId = Uuid;

/// Seconds since the Unix epoch. All lifecycle timestamps are stored in this
/// form; milliseconds appear only on live-update frames.
pub type UnixSeconds = i64;
pub type UnixMillis = i64;

/// Caller role as established by the auth collaborator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Enum)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guest,
    Bidder,
    Staff,
    Admin,
}

impl Role {
    pub fn is_staff(self) -> bool {
        matches!(self, Role::Staff | Role::Admin)
    }

    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Enum)]
#[serde(rename_all = "snake_case")]
pub enum AuctionStatus {
    Draft,
    Published,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Enum)]
#[serde(rename_all = "snake_case")]
pub enum LotStatus {
    Pending,
    Active,
    Closed,
    Sold,
    Unsold,
    Withdrawn,
}

impl LotStatus {
    /// Terminal states accept no further bids and never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LotStatus::Closed | LotStatus::Sold | LotStatus::Unsold | LotStatus::Withdrawn
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Enum)]
#[serde(rename_all = "snake_case")]
pub enum BidType {
    Manual,
    Proxy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Enum)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Active,
    Outbid,
    Won,
    Lost,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Enum)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Refunded,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Enum)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    Pending,
    Shipped,
    PickedUp,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Enum)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Matched,
    Unmatched,
    Conflict,
    Manual,
}

/// One price band of the increment table: applies while
/// `min <= current < max` (open-ended when `max` is `None`).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, SimpleObject)]
pub struct IncrementTier {
    pub min: Decimal,
    pub max: Option<Decimal>,
    pub step: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, InputObject)]
#[graphql(name = "IncrementTierInput")]
pub struct IncrementTierInput {
    pub min: Decimal,
    pub max: Option<Decimal>,
    pub step: Decimal,
}

impl From<IncrementTierInput> for IncrementTier {
    fn from(input: IncrementTierInput) -> Self {
        Self {
            min: input.min,
            max: input.max,
            step: input.step,
        }
    }
}

/// Buyer's premium band, same shape as [`IncrementTier`] with a rate
/// (fraction, e.g. `0.15` for 15%) instead of a step.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, SimpleObject)]
pub struct PremiumTier {
    pub min: Decimal,
    pub max: Option<Decimal>,
    pub rate: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, InputObject)]
#[graphql(name = "PremiumTierInput")]
pub struct PremiumTierInput {
    pub min: Decimal,
    pub max: Option<Decimal>,
    pub rate: Decimal,
}

impl From<PremiumTierInput> for PremiumTier {
    fn from(input: PremiumTierInput) -> Self {
        Self {
            min: input.min,
            max: input.max,
            rate: input.rate,
        }
    }
}

/// An auction groups lots under one timing and rule configuration.
#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct Auction {
    pub id: AuctionId,
    pub title: String,
    pub status: AuctionStatus,
    pub start_at: UnixSeconds,
    pub end_at: UnixSeconds,
    pub soft_close_enabled: bool,
    /// Window before close within which a bid triggers an extension (seconds).
    pub trigger_window: i64,
    /// Length of each soft-close extension (seconds).
    pub extension: i64,
    pub increment_rules: Vec<IncrementTier>,
    pub premium_rules: Vec<PremiumTier>,
    pub tax_rate: Option<Decimal>,
    pub created_at: UnixSeconds,
}

/// A single item under the hammer. Carries both its configuration and the
/// live bidding snapshot maintained by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct Lot {
    pub id: LotId,
    pub auction_id: AuctionId,
    /// Unique within the auction.
    pub lot_number: u32,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub condition: Option<String>,
    pub starting_bid: Decimal,
    pub reserve_price: Option<Decimal>,
    pub buy_now_price: Option<Decimal>,
    /// Per-lot override of the auction increment table.
    pub increment_rules_override: Option<Vec<IncrementTier>>,
    pub shipping_amount: Decimal,
    pub quantity: u32,
    pub location: Option<String>,
    pub shipping_available: bool,
    pub tags: Vec<String>,
    pub original_close_at: UnixSeconds,
    /// Grows under soft close; never less than `original_close_at`.
    pub current_close_at: UnixSeconds,
    pub extension_count: u32,
    pub status: LotStatus,
    pub current_bid: Decimal,
    pub current_bidder_id: Option<UserId>,
    pub bid_count: u32,
    pub reserve_met: bool,
    pub closed_at: Option<UnixSeconds>,
    pub created_at: UnixSeconds,
}

impl Lot {
    pub fn snapshot(&self) -> LotSnapshot {
        LotSnapshot {
            id: self.id,
            auction_id: self.auction_id,
            lot_number: self.lot_number,
            status: self.status,
            starting_bid: self.starting_bid,
            current_bid: self.current_bid,
            current_bidder_id: self.current_bidder_id,
            bid_count: self.bid_count,
            reserve_met: self.reserve_met,
            current_close_at: self.current_close_at,
            extension_count: self.extension_count,
        }
    }
}

/// The live view of a lot pushed to subscribers and returned from bid calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, SimpleObject)]
pub struct LotSnapshot {
    pub id: LotId,
    pub auction_id: AuctionId,
    pub lot_number: u32,
    pub status: LotStatus,
    pub starting_bid: Decimal,
    pub current_bid: Decimal,
    pub current_bidder_id: Option<UserId>,
    pub bid_count: u32,
    pub reserve_met: bool,
    pub current_close_at: UnixSeconds,
    pub extension_count: u32,
}

/// Append-only record of any amount ever set as the live bid. Only
/// `is_winning`, `max_bid_active`, `status` and `outbid_at` may change after
/// insert; the store refuses any other mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub lot_id: LotId,
    pub bidder_id: UserId,
    pub amount: Decimal,
    pub bid_type: BidType,
    /// Present only when the placing user supplied a maximum.
    pub max_bid: Option<Decimal>,
    /// True while this row's `max_bid` is the user's standing proxy cap.
    pub max_bid_active: bool,
    pub is_winning: bool,
    pub status: BidStatus,
    pub buy_now: bool,
    /// Lot snapshot immediately before this bid was applied.
    pub previous_amount: Decimal,
    pub previous_bidder_id: Option<UserId>,
    pub outbid_at: Option<UnixSeconds>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: UnixSeconds,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Enum)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    BidPlaced,
    BidRejected,
    ProxyTriggered,
    OutbidOccurred,
    SoftCloseTriggered,
    LotClosed,
    ReserveMet,
    BuyNowExecuted,
}

/// Append-only engine decision record; never updated or deleted. The primary
/// source of truth for disputes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub lot_id: LotId,
    pub auction_id: AuctionId,
    pub bidder_id: Option<UserId>,
    pub kind: AuditKind,
    pub previous_amount: Option<Decimal>,
    pub new_amount: Option<Decimal>,
    pub result_code: Option<String>,
    pub result_message: Option<String>,
    /// JSON snapshot of the lot at the time of the event.
    pub snapshot: serde_json::Value,
    pub created_at: UnixSeconds,
}

/// One line of an invoice, capturing the rates in force at generation time.
#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct InvoiceItem {
    pub lot_id: LotId,
    pub lot_number: u32,
    pub title: String,
    pub winning_bid: Decimal,
    pub premium_rate: Decimal,
    pub premium_amount: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub shipping_amount: Decimal,
    pub line_total: Decimal,
}

/// One invoice per (auction, winning bidder). Monetary fields are frozen at
/// generation; only the two status fields may change afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct Invoice {
    pub id: InvoiceId,
    pub invoice_number: String,
    pub auction_id: AuctionId,
    pub bidder_id: UserId,
    pub items: Vec<InvoiceItem>,
    pub subtotal: Decimal,
    pub premium: Decimal,
    pub tax: Decimal,
    pub shipping: Decimal,
    pub total: Decimal,
    pub payment_status: PaymentStatus,
    pub fulfillment_status: FulfillmentStatus,
    pub created_at: UnixSeconds,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Enum)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    LotCsv,
    Images,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Enum)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Applied,
    Rejected,
}

/// Per-row failure detail for an import batch.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, SimpleObject)]
pub struct RowError {
    /// 1-based data row number (header excluded).
    pub row: u32,
    pub field: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct ImportBatch {
    pub id: BatchId,
    pub auction_id: AuctionId,
    pub kind: BatchKind,
    pub outcome: BatchOutcome,
    pub total_rows: u32,
    pub applied_rows: u32,
    pub errors: Vec<RowError>,
    pub created_at: UnixSeconds,
}

/// Outcome of matching one uploaded image filename against the auction's
/// lots.
#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct ImageMapping {
    pub id: MappingId,
    pub batch_id: BatchId,
    pub auction_id: AuctionId,
    pub filename: String,
    pub stored_url: String,
    pub lot_id: Option<LotId>,
    pub photo_order: Option<u32>,
    pub status: MappingStatus,
    pub reason: Option<String>,
    pub created_at: UnixSeconds,
}
