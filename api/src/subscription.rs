use async_graphql::{Context, Error, Subscription};
use futures::Stream;

use shared::events::FeedFrame;
use shared::types::LotId;

use crate::auth;
use crate::query::engine;

pub struct SubscriptionRoot;

#[Subscription]
impl SubscriptionRoot {
    /// Live updates for one lot: a snapshot frame first, then bid,
    /// soft-close and close frames in commit order, with heartbeats while
    /// idle. Disconnecting simply detaches the subscriber.
    async fn lot_feed(
        &self,
        ctx: &Context<'_>,
        lot_id: LotId,
    ) -> Result<impl Stream<Item = FeedFrame>, Error> {
        engine(ctx)?.subscribe(lot_id).map_err(auth::engine_error)
    }
}
