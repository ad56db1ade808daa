use super::event::{ChangeEvent, ChangeOp, Checkpoint, EventId, FeedGap, FeedItem};
use crate::config::FeedConfig;
use crate::core::{DetailRecord, Result};
use crate::storage::{FaultInjector, FaultPoint};
use chrono::Utc;
use futures::Stream;
use log::{debug, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{RwLock, watch};

#[derive(Debug, Default)]
struct FeedLog {
    events: VecDeque<ChangeEvent>,
    next_seq: u64,
    /// Sequence numbers consumed by events that were never stored.
    dropped: u64,
    /// Events evicted by retention.
    truncated: u64,
}

struct FeedInner {
    log: RwLock<FeedLog>,
    head: watch::Sender<u64>,
    retention: Option<usize>,
    faults: Arc<FaultInjector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedStats {
    pub head: Checkpoint,
    pub earliest: Checkpoint,
    pub retained: usize,
    pub dropped: u64,
    pub truncated: u64,
}

/// Ordered log of committed detail changes.
///
/// Every event gets the next sequence number. A subscriber that asks for a position the log
/// no longer holds (evicted, dropped, or lost across a restart) receives a [`FeedGap`]
/// instead of the missing events.
#[derive(Clone)]
pub struct ChangeFeed {
    inner: Arc<FeedInner>,
}

impl ChangeFeed {
    pub fn new(config: &FeedConfig, faults: Arc<FaultInjector>) -> Self {
        let (head, _) = watch::channel(0);
        Self {
            inner: Arc::new(FeedInner {
                log: RwLock::new(FeedLog::default()),
                head,
                retention: config.retention,
                faults,
            }),
        }
    }

    /// Append an event for a committed change.
    ///
    /// Returns `None` when the feed-publish fault fires: the sequence number is consumed but
    /// the event is lost.
    pub async fn publish(&self, op: ChangeOp, detail: DetailRecord) -> Result<Option<ChangeEvent>> {
        let mut log = self.inner.log.write().await;
        let seq = log.next_seq;
        log.next_seq += 1;

        let published = if self.inner.faults.should_fail(FaultPoint::FeedPublish)? {
            log.dropped += 1;
            warn!("change event {} for {} dropped", seq, detail.id);
            None
        } else {
            let event = ChangeEvent {
                event_id: EventId::new(),
                seq,
                collection: detail.collection.clone(),
                op,
                detail,
                published_at: Utc::now(),
            };
            log.events.push_back(event.clone());
            if let Some(retention) = self.inner.retention {
                while log.events.len() > retention {
                    log.events.pop_front();
                    log.truncated += 1;
                }
            }
            Some(event)
        };

        self.inner.head.send_replace(log.next_seq);
        Ok(published)
    }

    /// Position the next published event will take.
    pub async fn head(&self) -> Checkpoint {
        Checkpoint(self.inner.log.read().await.next_seq)
    }

    /// Oldest position still readable.
    pub async fn earliest(&self) -> Checkpoint {
        let log = self.inner.log.read().await;
        Checkpoint(log.events.front().map(|e| e.seq).unwrap_or(log.next_seq))
    }

    /// Retained events at or after `from`, in order.
    pub async fn events_since(&self, from: Checkpoint) -> Vec<ChangeEvent> {
        let log = self.inner.log.read().await;
        let start = log.events.partition_point(|e| e.seq < from.0);
        log.events.range(start..).cloned().collect()
    }

    /// Forget every retained event and continue numbering at `head`.
    ///
    /// Used after restoring a snapshot: the events themselves are not persisted.
    pub async fn resume_at(&self, head: Checkpoint) {
        let mut log = self.inner.log.write().await;
        log.truncated += log.events.len() as u64;
        log.events.clear();
        log.next_seq = head.0;
        self.inner.head.send_replace(log.next_seq);
        debug!("feed resumed at {}", head);
    }

    pub async fn stats(&self) -> FeedStats {
        let log = self.inner.log.read().await;
        FeedStats {
            head: Checkpoint(log.next_seq),
            earliest: Checkpoint(log.events.front().map(|e| e.seq).unwrap_or(log.next_seq)),
            retained: log.events.len(),
            dropped: log.dropped,
            truncated: log.truncated,
        }
    }

    /// Read the feed starting at `from`.
    pub fn subscribe(&self, from: Checkpoint) -> ChangeSubscription {
        ChangeSubscription {
            feed: self.clone(),
            collections: None,
            next: from.0,
            head_rx: self.inner.head.subscribe(),
        }
    }
}

/// A cursor over the change feed.
pub struct ChangeSubscription {
    feed: ChangeFeed,
    collections: Option<HashSet<String>>,
    next: u64,
    head_rx: watch::Receiver<u64>,
}

impl ChangeSubscription {
    /// Only deliver events of these collections. Gaps are always delivered.
    pub fn filter<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = Some(collections.into_iter().map(Into::into).collect());
        self
    }

    /// Position of the next item this subscription will read.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.next)
    }

    /// Move the cursor, e.g. back to a saved checkpoint for redelivery.
    pub fn seek(&mut self, to: Checkpoint) {
        self.next = to.0;
    }

    fn wants(&self, event: &ChangeEvent) -> bool {
        self.collections
            .as_ref()
            .map(|set| set.contains(&event.collection))
            .unwrap_or(true)
    }

    /// The next available item, or `None` when the subscriber has caught up.
    pub async fn try_next(&mut self) -> Option<FeedItem> {
        let inner = self.feed.inner.clone();
        let log = inner.log.read().await;
        loop {
            let idx = log.events.partition_point(|e| e.seq < self.next);
            match log.events.get(idx) {
                Some(event) if event.seq > self.next => {
                    let gap = FeedGap {
                        expected: self.next,
                        resumed_at: event.seq,
                    };
                    self.next = event.seq;
                    return Some(FeedItem::Gap(gap));
                }
                Some(event) => {
                    self.next = event.seq + 1;
                    if self.wants(event) {
                        return Some(FeedItem::Event(event.clone()));
                    }
                }
                None if log.next_seq > self.next => {
                    let gap = FeedGap {
                        expected: self.next,
                        resumed_at: log.next_seq,
                    };
                    self.next = log.next_seq;
                    return Some(FeedItem::Gap(gap));
                }
                None => return None,
            }
        }
    }

    /// Wait for the next item.
    pub async fn next(&mut self) -> Option<FeedItem> {
        loop {
            self.head_rx.borrow_and_update();
            if let Some(item) = self.try_next().await {
                return Some(item);
            }
            if self.head_rx.changed().await.is_err() {
                return None;
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = FeedItem> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|item| (item, subscription))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DetailId, EntityId, LIKES};
    use futures::StreamExt;
    use std::time::Duration;

    fn record(id: u64, collection: &str) -> DetailRecord {
        DetailRecord {
            id: DetailId(id),
            collection: collection.to_string(),
            owner: EntityId::from("alice"),
            subject: Some(EntityId::from("p1")),
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    fn feed(retention: Option<usize>) -> (ChangeFeed, Arc<FaultInjector>) {
        let faults = Arc::new(FaultInjector::new());
        let config = FeedConfig {
            retention,
            ..FeedConfig::default()
        };
        (ChangeFeed::new(&config, faults.clone()), faults)
    }

    #[tokio::test]
    async fn test_events_in_order() {
        let (feed, _) = feed(None);
        for id in 1..=3 {
            feed.publish(ChangeOp::Insert, record(id, LIKES)).await.unwrap();
        }
        let mut sub = feed.subscribe(Checkpoint::BEGINNING);
        let mut seqs = Vec::new();
        while let Some(FeedItem::Event(event)) = sub.try_next().await {
            seqs.push(event.seq);
        }
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(sub.checkpoint(), Checkpoint(3));
    }

    #[tokio::test]
    async fn test_retention_reports_gap() {
        let (feed, _) = feed(Some(2));
        for id in 1..=5 {
            feed.publish(ChangeOp::Insert, record(id, LIKES)).await.unwrap();
        }
        let mut sub = feed.subscribe(Checkpoint::BEGINNING);
        assert_eq!(
            sub.try_next().await,
            Some(FeedItem::Gap(FeedGap { expected: 0, resumed_at: 3 }))
        );
        assert!(matches!(sub.try_next().await, Some(FeedItem::Event(e)) if e.seq == 3));
        assert_eq!(feed.stats().await.truncated, 3);
    }

    #[tokio::test]
    async fn test_dropped_event_is_a_gap() {
        let (feed, faults) = feed(None);
        faults.fail_nth(FaultPoint::FeedPublish, 2).unwrap();
        for id in 1..=3 {
            feed.publish(ChangeOp::Insert, record(id, LIKES)).await.unwrap();
        }
        let mut sub = feed.subscribe(Checkpoint::BEGINNING);
        assert!(matches!(sub.try_next().await, Some(FeedItem::Event(_))));
        assert_eq!(
            sub.try_next().await,
            Some(FeedItem::Gap(FeedGap { expected: 1, resumed_at: 2 }))
        );
        assert_eq!(feed.stats().await.dropped, 1);
    }

    #[tokio::test]
    async fn test_filter_skips_other_collections() {
        let (feed, _) = feed(None);
        feed.publish(ChangeOp::Insert, record(1, "posts")).await.unwrap();
        feed.publish(ChangeOp::Insert, record(2, LIKES)).await.unwrap();
        let mut sub = feed.subscribe(Checkpoint::BEGINNING).filter([LIKES]);
        assert!(matches!(sub.try_next().await, Some(FeedItem::Event(e)) if e.collection == LIKES));
        assert!(sub.try_next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_wakes_on_publish() {
        let (feed, _) = feed(None);
        let mut stream = Box::pin(feed.subscribe(Checkpoint::BEGINNING).into_stream());
        let publisher = feed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(ChangeOp::Delete, record(9, LIKES)).await.unwrap();
        });
        let item = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(matches!(item, Some(FeedItem::Event(e)) if e.op == ChangeOp::Delete));
    }
}
