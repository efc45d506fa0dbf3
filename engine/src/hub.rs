//! Per-lot pub/sub fan-out for live updates.
//!
//! The hub is an observer bolted on after transaction commit; it is never a
//! gate. Publishing to a lot nobody watches is a no-op, and a slow or gone
//! subscriber is detached without ever blocking a publisher.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use shared::events::FeedFrame;
use shared::types::{LotId, LotSnapshot};

use crate::clock::Clock;

const TOPIC_CAPACITY: usize = 256;

pub struct SubscriptionHub {
    topics: Mutex<HashMap<LotId, broadcast::Sender<FeedFrame>>>,
    /// Idle time before a heartbeat frame is interleaved.
    heartbeat: Duration,
    /// Frames buffered per subscriber before it is considered too slow.
    subscriber_buffer: usize,
}

impl SubscriptionHub {
    pub fn new(heartbeat: Duration, subscriber_buffer: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            heartbeat,
            subscriber_buffer,
        }
    }

    fn topic(&self, lot_id: LotId) -> broadcast::Sender<FeedFrame> {
        self.topics
            .lock()
            .entry(lot_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Fan a committed frame out to the lot's subscribers. Subscribers
    /// observe frames in publication order.
    pub fn publish(&self, lot_id: LotId, frame: FeedFrame) {
        if let Entry::Occupied(topic) = self.topics.lock().entry(lot_id) {
            if topic.get().send(frame).is_err() {
                // Last receiver went away; drop the idle topic.
                topic.remove();
            }
        }
    }

    /// Open a live stream for one lot. The caller-provided snapshot is
    /// always the first frame; incremental frames follow, with heartbeats
    /// interleaved after idle periods. There is no historical replay.
    pub fn subscribe(
        &self,
        lot_id: LotId,
        snapshot: LotSnapshot,
        clock: &Clock,
    ) -> ReceiverStream<FeedFrame> {
        let mut feed = self.topic(lot_id).subscribe();
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        let heartbeat = self.heartbeat;
        let clock = clock.clone();

        tokio::spawn(async move {
            let first = FeedFrame::snapshot(snapshot, clock.now_millis());
            if tx.send(first).await.is_err() {
                return;
            }
            loop {
                let frame = match tokio::time::timeout(heartbeat, feed.recv()).await {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(broadcast::error::RecvError::Closed)) => break,
                    Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                        // Too slow to keep a consistent view; detach.
                        debug!(%lot_id, missed, "detaching lagged subscriber");
                        break;
                    }
                    Err(_) => FeedFrame::heartbeat(clock.now_millis()),
                };
                if tx.try_send(frame).is_err() {
                    // Receiver gone or its buffer full; detach without
                    // blocking the publisher side.
                    break;
                }
            }
        });

        ReceiverStream::new(rx)
    }

    /// Number of live subscribers on a lot (observability only).
    pub fn subscriber_count(&self, lot_id: LotId) -> usize {
        self.topics
            .lock()
            .get(&lot_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tokio_stream::StreamExt;

    use crate::testutil::{active_lot, draft_auction};
    use shared::events::FeedKind;

    fn snapshot() -> LotSnapshot {
        let auction = draft_auction(1_000);
        active_lot(&auction, 1, Decimal::from(10)).snapshot()
    }

    #[tokio::test]
    async fn subscriber_sees_snapshot_then_frames_in_order() {
        let hub = SubscriptionHub::new(Duration::from_secs(30), 16);
        let clock = Clock::manual(1_000);
        let snap = snapshot();
        let lot_id = snap.id;

        let mut stream = hub.subscribe(lot_id, snap.clone(), &clock);
        let first = stream.next().await.unwrap();
        assert_eq!(first.kind, FeedKind::Snapshot);

        hub.publish(lot_id, FeedFrame::bid(snap.clone(), 1_000_100));
        hub.publish(lot_id, FeedFrame::soft_close(snap.clone(), 1_000_200));

        let a = stream.next().await.unwrap();
        let b = stream.next().await.unwrap();
        assert_eq!(a.kind, FeedKind::Bid);
        assert_eq!(b.kind, FeedKind::SoftClose);
        assert_eq!(a.at, 1_000_100);
        assert_eq!(b.at, 1_000_200);
    }

    #[tokio::test]
    async fn idle_stream_emits_heartbeats() {
        let hub = SubscriptionHub::new(Duration::from_millis(20), 16);
        let clock = Clock::manual(1_000);
        let snap = snapshot();

        let mut stream = hub.subscribe(snap.id, snap.clone(), &clock);
        let first = stream.next().await.unwrap();
        assert_eq!(first.kind, FeedKind::Snapshot);

        let beat = stream.next().await.unwrap();
        assert_eq!(beat.kind, FeedKind::Heartbeat);
        assert!(beat.lot.is_none());
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_a_no_op() {
        let hub = SubscriptionHub::new(Duration::from_secs(30), 16);
        let snap = snapshot();
        hub.publish(snap.id, FeedFrame::bid(snap.clone(), 1));
        assert_eq!(hub.subscriber_count(snap.id), 0);
    }

    #[tokio::test]
    async fn dropped_subscriber_detaches_publisher_keeps_going() {
        let hub = SubscriptionHub::new(Duration::from_secs(30), 4);
        let clock = Clock::manual(1_000);
        let snap = snapshot();
        let lot_id = snap.id;

        let stream = hub.subscribe(lot_id, snap.clone(), &clock);
        drop(stream);
        // Give the pump task a moment to notice the closed receiver.
        tokio::time::sleep(Duration::from_millis(10)).await;
        for i in 0..100 {
            hub.publish(lot_id, FeedFrame::bid(snap.clone(), i));
        }
    }
}
