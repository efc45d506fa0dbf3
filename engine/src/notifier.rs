use async_trait::async_trait;

use shared::types::{LotSnapshot, UserId};

/// Outbound notification collaborator (email/push delivery lives elsewhere).
/// Invoked strictly after the owning transaction has committed; a slow or
/// failing notifier can never roll back engine state.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// The given user lost the high-bid position on a lot.
    async fn outbid(&self, user: UserId, lot: &LotSnapshot);

    /// A lot reached a terminal status.
    async fn lot_closed(&self, lot: &LotSnapshot);
}

/// Default collaborator for deployments without a delivery channel wired up.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn outbid(&self, _user: UserId, _lot: &LotSnapshot) {}

    async fn lot_closed(&self, _lot: &LotSnapshot) {}
}
