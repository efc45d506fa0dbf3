use std::sync::Arc;

use async_graphql::{Context, Error, Object, SimpleObject};
use rust_decimal::Decimal;

use engine::Engine;
use shared::types::{
    Auction, AuctionId, AuctionStatus, BatchId, Bid, BidId, BidStatus, BidType, ImageMapping,
    ImportBatch, Invoice, Lot, LotId, UnixSeconds, UserId,
};

use crate::auth::{self, Identity};

pub(crate) fn engine<'a>(ctx: &Context<'a>) -> Result<&'a Arc<Engine>, Error> {
    ctx.data::<Arc<Engine>>()
        .map_err(|_| auth::api_error(engine::ResultCode::Internal, "engine not configured"))
}

/// Public view of one bid-history row. Bidder identity (and the secret
/// maximum) stay hidden unless the viewer is staff or the bidder themself;
/// everyone still gets a stable per-lot alias so the chain reads coherently.
#[derive(SimpleObject)]
pub struct BidView {
    pub id: BidId,
    pub lot_id: LotId,
    pub amount: Decimal,
    pub bid_type: BidType,
    pub status: BidStatus,
    pub is_winning: bool,
    pub buy_now: bool,
    pub max_bid: Option<Decimal>,
    pub bidder_id: Option<UserId>,
    pub bidder_alias: String,
    pub created_at: UnixSeconds,
}

pub(crate) fn redact_history(bids: Vec<Bid>, viewer: Option<&Identity>) -> Vec<BidView> {
    let privileged = viewer.is_some_and(|v| v.role.is_staff());
    let mut first_seen: Vec<UserId> = Vec::new();
    bids.into_iter()
        .map(|bid| {
            let position = match first_seen.iter().position(|u| *u == bid.bidder_id) {
                Some(i) => i,
                None => {
                    first_seen.push(bid.bidder_id);
                    first_seen.len() - 1
                }
            };
            let own = viewer.is_some_and(|v| v.user_id == bid.bidder_id);
            let visible = privileged || own;
            BidView {
                id: bid.id,
                lot_id: bid.lot_id,
                amount: bid.amount,
                bid_type: bid.bid_type,
                status: bid.status,
                is_winning: bid.is_winning,
                buy_now: bid.buy_now,
                max_bid: if visible { bid.max_bid } else { None },
                bidder_id: if visible { Some(bid.bidder_id) } else { None },
                bidder_alias: format!("Bidder {}", position + 1),
                created_at: bid.created_at,
            }
        })
        .collect()
}

fn paginate<T>(items: Vec<T>, offset: Option<usize>, limit: Option<usize>) -> Vec<T> {
    let offset = offset.unwrap_or(0);
    let items = items.into_iter().skip(offset);
    match limit {
        Some(limit) => items.take(limit).collect(),
        None => items.collect(),
    }
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// List auctions, optionally filtered by status, with pagination.
    /// - offset: Skip the first N auctions (default: 0)
    /// - limit: Return at most N auctions (default: unlimited)
    async fn auctions(
        &self,
        ctx: &Context<'_>,
        status: Option<AuctionStatus>,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Vec<Auction>, Error> {
        let mut auctions = engine(ctx)?.store().auctions(status);
        auctions.sort_by_key(|a| a.start_at);
        Ok(paginate(auctions, offset, limit))
    }

    async fn auction(&self, ctx: &Context<'_>, id: AuctionId) -> Result<Auction, Error> {
        engine(ctx)?.auction(id).map_err(auth::engine_error)
    }

    async fn auction_lots(
        &self,
        ctx: &Context<'_>,
        auction_id: AuctionId,
    ) -> Result<Vec<Lot>, Error> {
        let mut lots = engine(ctx)?
            .store()
            .lots_of_auction(auction_id)
            .map_err(|e| auth::engine_error(e.into()))?;
        lots.sort_by_key(|l| l.lot_number);
        Ok(lots)
    }

    async fn lot(&self, ctx: &Context<'_>, id: LotId) -> Result<Lot, Error> {
        engine(ctx)?.lot(id).map_err(auth::engine_error)
    }

    /// Chronological bid history for a lot, identity-redacted per viewer.
    async fn bid_history(
        &self,
        ctx: &Context<'_>,
        lot_id: LotId,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Vec<BidView>, Error> {
        let bids = engine(ctx)?
            .bid_history(lot_id)
            .map_err(auth::engine_error)?;
        let viewer = ctx.data_opt::<Identity>();
        Ok(paginate(redact_history(bids, viewer), offset, limit))
    }

    /// The caller's own bids across every lot, oldest first.
    async fn my_bids(&self, ctx: &Context<'_>) -> Result<Vec<BidView>, Error> {
        let identity = auth::identity(ctx)?;
        let bids = engine(ctx)?.bids_of_bidder(identity.user_id);
        Ok(redact_history(bids, Some(identity)))
    }

    /// The caller's watched lots.
    async fn watchlist(&self, ctx: &Context<'_>) -> Result<Vec<Lot>, Error> {
        let identity = auth::identity(ctx)?;
        Ok(engine(ctx)?.watched_lots(identity.user_id))
    }

    /// Invoices addressed to the caller.
    async fn my_invoices(&self, ctx: &Context<'_>) -> Result<Vec<Invoice>, Error> {
        let identity = auth::identity(ctx)?;
        Ok(engine(ctx)?.invoices_of_bidder(identity.user_id))
    }

    async fn auction_invoices(
        &self,
        ctx: &Context<'_>,
        auction_id: AuctionId,
    ) -> Result<Vec<Invoice>, Error> {
        auth::require_staff(ctx)?;
        Ok(engine(ctx)?.invoices_of_auction(auction_id))
    }

    async fn import_batch(&self, ctx: &Context<'_>, id: BatchId) -> Result<ImportBatch, Error> {
        auth::require_staff(ctx)?;
        engine(ctx)?.import_batch(id).map_err(auth::engine_error)
    }

    async fn batch_mappings(
        &self,
        ctx: &Context<'_>,
        batch_id: BatchId,
    ) -> Result<Vec<ImageMapping>, Error> {
        auth::require_staff(ctx)?;
        Ok(engine(ctx)?.batch_mappings(batch_id))
    }
}
