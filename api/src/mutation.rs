use async_graphql::{Context, Error, InputObject, Object, SimpleObject};
use rust_decimal::Decimal;

use engine::engine::{AuctionParams, LotParams};
use engine::{ImageFile, PlaceBidRequest, ResultCode};
use shared::types::{
    Auction, AuctionId, FulfillmentStatus, ImageMapping, ImportBatch, IncrementTierInput, Invoice,
    InvoiceId, Lot, LotId, LotSnapshot, MappingId, PremiumTierInput, RowError, UnixSeconds,
};

use crate::auth::{self, ClientMeta, RateLimiter};
use crate::query::engine;

#[derive(InputObject)]
pub struct PlaceBidInput {
    pub lot_id: LotId,
    pub amount: Decimal,
    pub max_bid: Option<Decimal>,
}

#[derive(InputObject)]
pub struct CreateAuctionInput {
    pub title: String,
    pub start_at: UnixSeconds,
    pub end_at: UnixSeconds,
    pub soft_close_enabled: Option<bool>,
    /// Seconds before close within which a bid extends the lot.
    pub trigger_window: Option<i64>,
    /// Seconds added by each extension.
    pub extension: Option<i64>,
    pub increment_rules: Option<Vec<IncrementTierInput>>,
    pub premium_rules: Option<Vec<PremiumTierInput>>,
    pub tax_rate: Option<Decimal>,
}

#[derive(InputObject)]
pub struct AddLotInput {
    pub lot_number: u32,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub condition: Option<String>,
    pub starting_bid: Decimal,
    pub reserve_price: Option<Decimal>,
    pub buy_now_price: Option<Decimal>,
    pub increment_rules_override: Option<Vec<IncrementTierInput>>,
    pub shipping_amount: Option<Decimal>,
    pub quantity: Option<u32>,
    pub location: Option<String>,
    pub shipping_available: Option<bool>,
    pub tags: Option<Vec<String>>,
}

#[derive(InputObject)]
pub struct ImageFileInput {
    pub filename: String,
    pub url: String,
}

/// Outcome of a bid or buy-now call. `success` is false when the incumbent's
/// proxy defended the lot (the state still changed).
#[derive(SimpleObject)]
pub struct BidPayload {
    pub success: bool,
    pub result_code: String,
    pub proxy_triggered: bool,
    pub outbid_occurred: bool,
    pub lot: LotSnapshot,
    pub min_next_bid: Decimal,
    pub message: String,
}

impl From<engine::BidOutcome> for BidPayload {
    fn from(outcome: engine::BidOutcome) -> Self {
        Self {
            success: outcome.accepted,
            result_code: outcome.result_code.as_str().into(),
            proxy_triggered: outcome.proxy_triggered,
            outbid_occurred: outcome.outbid_occurred,
            lot: outcome.lot,
            min_next_bid: outcome.min_next_bid,
            message: outcome.message,
        }
    }
}

#[derive(SimpleObject)]
pub struct CsvImportPayload {
    pub batch: ImportBatch,
    pub lots: Vec<Lot>,
    pub errors: Vec<RowError>,
}

#[derive(SimpleObject)]
pub struct MatchImagesPayload {
    pub batch: ImportBatch,
    pub mappings: Vec<ImageMapping>,
}

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    /// Place a bid, optionally carrying a proxy maximum.
    async fn place_bid(
        &self,
        ctx: &Context<'_>,
        input: PlaceBidInput,
    ) -> Result<BidPayload, Error> {
        let identity = auth::require_bidder(ctx)?.clone();
        let engine = engine(ctx)?;
        let limiter = ctx
            .data::<std::sync::Arc<RateLimiter>>()
            .map_err(|_| auth::api_error(ResultCode::Internal, "rate limiter not configured"))?;
        if !limiter.check(identity.user_id, engine.clock().now()) {
            return Err(auth::api_error(
                ResultCode::TransientConflict,
                "too many bids, slow down",
            ));
        }
        let meta = ctx.data_opt::<ClientMeta>().cloned().unwrap_or_default();
        let outcome = engine
            .place_bid(PlaceBidRequest {
                lot_id: input.lot_id,
                bidder_id: identity.user_id,
                amount: input.amount,
                max_bid: input.max_bid,
                ip_address: meta.ip_address,
                user_agent: meta.user_agent,
            })
            .await
            .map_err(auth::engine_error)?;
        Ok(outcome.into())
    }

    /// Immediate purchase at the lot's buy-now price.
    async fn buy_now(&self, ctx: &Context<'_>, lot_id: LotId) -> Result<BidPayload, Error> {
        let identity = auth::require_bidder(ctx)?.clone();
        let outcome = engine(ctx)?
            .buy_now(lot_id, identity.user_id)
            .await
            .map_err(auth::engine_error)?;
        Ok(outcome.into())
    }

    async fn add_watch(&self, ctx: &Context<'_>, lot_id: LotId) -> Result<bool, Error> {
        let identity = auth::identity(ctx)?.clone();
        engine(ctx)?
            .add_watch(identity.user_id, lot_id)
            .map_err(auth::engine_error)
    }

    async fn remove_watch(&self, ctx: &Context<'_>, lot_id: LotId) -> Result<bool, Error> {
        let identity = auth::identity(ctx)?.clone();
        engine(ctx)?
            .remove_watch(identity.user_id, lot_id)
            .map_err(auth::engine_error)
    }

    // ─────────────────────────────────────────────────────────
    // Staff: catalog management
    // ─────────────────────────────────────────────────────────

    async fn create_auction(
        &self,
        ctx: &Context<'_>,
        input: CreateAuctionInput,
    ) -> Result<Auction, Error> {
        auth::require_staff(ctx)?;
        engine(ctx)?
            .create_auction(AuctionParams {
                title: input.title,
                start_at: input.start_at,
                end_at: input.end_at,
                soft_close_enabled: input.soft_close_enabled.unwrap_or(true),
                trigger_window: input.trigger_window.unwrap_or(300),
                extension: input.extension.unwrap_or(300),
                increment_rules: input
                    .increment_rules
                    .map(|tiers| tiers.into_iter().map(Into::into).collect()),
                premium_rules: input
                    .premium_rules
                    .map(|tiers| tiers.into_iter().map(Into::into).collect())
                    .unwrap_or_default(),
                tax_rate: input.tax_rate,
            })
            .map_err(auth::engine_error)
    }

    async fn add_lot(
        &self,
        ctx: &Context<'_>,
        auction_id: AuctionId,
        input: AddLotInput,
    ) -> Result<Lot, Error> {
        auth::require_staff(ctx)?;
        engine(ctx)?
            .add_lot(
                auction_id,
                LotParams {
                    lot_number: input.lot_number,
                    title: input.title,
                    description: input.description,
                    category: input.category,
                    condition: input.condition,
                    starting_bid: input.starting_bid,
                    reserve_price: input.reserve_price,
                    buy_now_price: input.buy_now_price,
                    increment_rules_override: input
                        .increment_rules_override
                        .map(|tiers| tiers.into_iter().map(Into::into).collect()),
                    shipping_amount: input.shipping_amount,
                    quantity: input.quantity,
                    location: input.location,
                    shipping_available: input.shipping_available.unwrap_or(false),
                    tags: input.tags.unwrap_or_default(),
                },
            )
            .map_err(auth::engine_error)
    }

    async fn publish_auction(&self, ctx: &Context<'_>, id: AuctionId) -> Result<Auction, Error> {
        auth::require_staff(ctx)?;
        engine(ctx)?.publish_auction(id).map_err(auth::engine_error)
    }

    async fn activate_auction(&self, ctx: &Context<'_>, id: AuctionId) -> Result<Auction, Error> {
        auth::require_staff(ctx)?;
        engine(ctx)?.activate_auction(id).map_err(auth::engine_error)
    }

    async fn withdraw_lot(&self, ctx: &Context<'_>, lot_id: LotId) -> Result<LotSnapshot, Error> {
        auth::require_staff(ctx)?;
        engine(ctx)?.withdraw_lot(lot_id).map_err(auth::engine_error)
    }

    // ─────────────────────────────────────────────────────────
    // Admin: close & invoice
    // ─────────────────────────────────────────────────────────

    async fn close_lot(&self, ctx: &Context<'_>, lot_id: LotId) -> Result<LotSnapshot, Error> {
        auth::require_admin(ctx)?;
        engine(ctx)?
            .close_lot(lot_id)
            .await
            .map_err(auth::engine_error)
    }

    async fn close_auction(&self, ctx: &Context<'_>, id: AuctionId) -> Result<Auction, Error> {
        auth::require_admin(ctx)?;
        engine(ctx)?
            .close_auction(id)
            .await
            .map_err(auth::engine_error)
    }

    async fn generate_invoices(
        &self,
        ctx: &Context<'_>,
        auction_id: AuctionId,
    ) -> Result<Vec<InvoiceId>, Error> {
        auth::require_admin(ctx)?;
        engine(ctx)?
            .generate_invoices(auction_id)
            .map_err(auth::engine_error)
    }

    async fn mark_invoice_paid(
        &self,
        ctx: &Context<'_>,
        id: InvoiceId,
    ) -> Result<Invoice, Error> {
        auth::require_staff(ctx)?;
        engine(ctx)?.mark_invoice_paid(id).map_err(auth::engine_error)
    }

    async fn set_fulfillment(
        &self,
        ctx: &Context<'_>,
        id: InvoiceId,
        status: FulfillmentStatus,
    ) -> Result<Invoice, Error> {
        auth::require_staff(ctx)?;
        engine(ctx)?
            .set_fulfillment(id, status)
            .map_err(auth::engine_error)
    }

    // ─────────────────────────────────────────────────────────
    // Staff: bulk ingest
    // ─────────────────────────────────────────────────────────

    async fn import_lots_csv(
        &self,
        ctx: &Context<'_>,
        auction_id: AuctionId,
        csv: String,
    ) -> Result<CsvImportPayload, Error> {
        auth::require_staff(ctx)?;
        let report = engine(ctx)?
            .import_lots_csv(auction_id, csv.as_bytes())
            .map_err(auth::engine_error)?;
        Ok(CsvImportPayload {
            errors: report.batch.errors.clone(),
            batch: report.batch,
            lots: report.lots,
        })
    }

    async fn match_images(
        &self,
        ctx: &Context<'_>,
        auction_id: AuctionId,
        files: Vec<ImageFileInput>,
    ) -> Result<MatchImagesPayload, Error> {
        auth::require_staff(ctx)?;
        let files = files
            .into_iter()
            .map(|f| ImageFile {
                filename: f.filename,
                stored_url: f.url,
            })
            .collect();
        let report = engine(ctx)?
            .match_images(auction_id, files)
            .map_err(auth::engine_error)?;
        Ok(MatchImagesPayload {
            batch: report.batch,
            mappings: report.mappings,
        })
    }

    async fn manual_assign(
        &self,
        ctx: &Context<'_>,
        mapping_id: MappingId,
        lot_id: LotId,
        photo_order: u32,
    ) -> Result<ImageMapping, Error> {
        auth::require_admin(ctx)?;
        engine(ctx)?
            .manual_assign(mapping_id, lot_id, photo_order)
            .map_err(auth::engine_error)
    }
}
