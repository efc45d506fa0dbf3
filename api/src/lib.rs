//! Transport-independent API surface.
//!
//! The service accepts `async_graphql::Request`s and returns `Response`s;
//! whatever HTTP/WebSocket binding fronts it is an external collaborator.
//! The auth collaborator attaches an [`auth::Identity`] to each request; the
//! roots here only parse input, enforce roles and shape responses. Every
//! rule lives in the engine.

pub mod auth;
pub mod mutation;
pub mod query;
pub mod subscription;

use std::sync::Arc;

use async_graphql::{Request, Response, Schema};
use futures::Stream;

use engine::Engine;

use crate::auth::RateLimiter;
use crate::mutation::MutationRoot;
use crate::query::QueryRoot;
use crate::subscription::SubscriptionRoot;

pub type ApiSchema = Schema<QueryRoot, MutationRoot, SubscriptionRoot>;

pub struct ApiService {
    schema: ApiSchema,
}

impl ApiService {
    pub fn new(engine: Arc<Engine>) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            engine.config().rate_limit_max,
            engine.config().rate_limit_window_secs,
        ));
        let schema = Schema::build(QueryRoot, MutationRoot, SubscriptionRoot)
            .data(engine)
            .data(limiter)
            .finish();
        Self { schema }
    }

    /// Execute one query or mutation. Attach the caller's identity with
    /// `request.data(Identity { .. })` before calling.
    pub async fn handle_query(&self, request: impl Into<Request>) -> Response {
        self.schema.execute(request).await
    }

    /// Execute a subscription operation, yielding a response per frame.
    pub fn handle_subscription(
        &self,
        request: impl Into<Request>,
    ) -> impl Stream<Item = Response> + '_ {
        self.schema.execute_stream(request)
    }

    pub fn schema(&self) -> &ApiSchema {
        &self.schema
    }

    pub fn sdl(&self) -> String {
        self.schema.sdl()
    }
}
