//! Identity handling and per-identity rate limiting.
//!
//! The auth collaborator owns session issuance; by the time a request
//! reaches this crate it carries (at most) an authenticated [`Identity`] as
//! request data. Resolvers never learn whether a resource exists before the
//! identity check passes.

use std::collections::HashMap;

use async_graphql::{Context, Error, ErrorExtensions};
use parking_lot::Mutex;

use engine::{EngineError, ResultCode};
use shared::types::{Role, UnixSeconds, UserId};

/// Authenticated caller, established externally and attached to the request.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
}

/// Optional transport metadata recorded on manual bids.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Build a GraphQL error carrying the stable result code and an HTTP hint.
pub fn api_error(code: ResultCode, message: impl Into<String>) -> Error {
    Error::new(message.into()).extend_with(|_, ext| {
        ext.set("code", code.as_str());
        ext.set("http_status", code.http_status() as i32);
    })
}

pub fn engine_error(err: EngineError) -> Error {
    if let EngineError::Invariant(detail) = &err {
        tracing::error!(%detail, "engine invariant violated");
    }
    api_error(err.code(), err.to_string())
}

pub fn identity<'a>(ctx: &Context<'a>) -> Result<&'a Identity, Error> {
    ctx.data_opt::<Identity>()
        .ok_or_else(|| api_error(ResultCode::Unauthorized, "authentication required"))
}

/// A signed-in account that may place bids.
pub fn require_bidder<'a>(ctx: &Context<'a>) -> Result<&'a Identity, Error> {
    let identity = identity(ctx)?;
    if identity.role == Role::Guest {
        return Err(api_error(ResultCode::Forbidden, "bidding requires an account"));
    }
    Ok(identity)
}

pub fn require_staff<'a>(ctx: &Context<'a>) -> Result<&'a Identity, Error> {
    let identity = identity(ctx)?;
    if !identity.role.is_staff() {
        return Err(api_error(ResultCode::Forbidden, "staff access required"));
    }
    Ok(identity)
}

pub fn require_admin<'a>(ctx: &Context<'a>) -> Result<&'a Identity, Error> {
    let identity = identity(ctx)?;
    if !identity.role.is_admin() {
        return Err(api_error(ResultCode::Forbidden, "admin access required"));
    }
    Ok(identity)
}

const PRUNE_THRESHOLD: usize = 10_000;

/// Fixed-window per-identity counter with bounded memory: stale buckets are
/// swept whenever the map grows past a threshold.
pub struct RateLimiter {
    limit: u32,
    window_secs: i64,
    buckets: Mutex<HashMap<UserId, (UnixSeconds, u32)>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window_secs: i64) -> Self {
        Self {
            limit,
            window_secs,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record one call; false means the identity is over its window budget.
    pub fn check(&self, user: UserId, now: UnixSeconds) -> bool {
        let mut buckets = self.buckets.lock();
        if buckets.len() > PRUNE_THRESHOLD {
            let window = self.window_secs;
            buckets.retain(|_, (start, _)| now - *start < window);
        }
        let entry = buckets.entry(user).or_insert((now, 0));
        if now - entry.0 >= self.window_secs {
            *entry = (now, 0);
        }
        if entry.1 >= self.limit {
            false
        } else {
            entry.1 += 1;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn limiter_resets_after_the_window() {
        let limiter = RateLimiter::new(2, 10);
        let user = Uuid::new_v4();
        assert!(limiter.check(user, 100));
        assert!(limiter.check(user, 101));
        assert!(!limiter.check(user, 105));
        // Fresh window, fresh budget.
        assert!(limiter.check(user, 110));
    }

    #[test]
    fn limiter_tracks_identities_independently() {
        let limiter = RateLimiter::new(1, 10);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(limiter.check(a, 100));
        assert!(!limiter.check(a, 100));
        assert!(limiter.check(b, 100));
    }
}
