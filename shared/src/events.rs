use async_graphql::{Enum, SimpleObject};
use serde::{Deserialize, Serialize};

use crate::types::{LotSnapshot, UnixMillis};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Enum)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Snapshot,
    Bid,
    SoftClose,
    LotClosed,
    Heartbeat,
}

/// One frame on a lot's live-update stream.
///
/// A new subscriber always receives a `snapshot` frame first; incremental
/// frames follow in publication order. `heartbeat` frames carry no lot and
/// only keep idle connections verifiably alive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, SimpleObject)]
pub struct FeedFrame {
    pub kind: FeedKind,
    pub lot: Option<LotSnapshot>,
    pub at: UnixMillis,
}

impl FeedFrame {
    pub fn snapshot(lot: LotSnapshot, at: UnixMillis) -> Self {
        Self {
            kind: FeedKind::Snapshot,
            lot: Some(lot),
            at,
        }
    }

    pub fn bid(lot: LotSnapshot, at: UnixMillis) -> Self {
        Self {
            kind: FeedKind::Bid,
            lot: Some(lot),
            at,
        }
    }

    pub fn soft_close(lot: LotSnapshot, at: UnixMillis) -> Self {
        Self {
            kind: FeedKind::SoftClose,
            lot: Some(lot),
            at,
        }
    }

    pub fn lot_closed(lot: LotSnapshot, at: UnixMillis) -> Self {
        Self {
            kind: FeedKind::LotClosed,
            lot: Some(lot),
            at,
        }
    }

    pub fn heartbeat(at: UnixMillis) -> Self {
        Self {
            kind: FeedKind::Heartbeat,
            lot: None,
            at,
        }
    }
}
