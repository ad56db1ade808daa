use crate::config::TransactionPolicy;
use crate::core::{CounterRegistry, Result, TallyError};
use crate::feed::{
    ChangeEvent, ChangeFeed, ChangeOp, ChangeSubscription, Checkpoint, DedupLock, FeedGap,
    FeedItem,
};
use crate::storage::RecordStore;
use crate::transaction::{Change, within_transaction};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tracing::{Instrument, Level, event, info_span};

/// What the listener did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Counter adjustments committed.
    Applied { adjusted: usize },
    /// Already claimed by an earlier delivery.
    Duplicate,
    /// Nothing to count: an update, or a collection without counters.
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    pub applied: usize,
    pub duplicates: usize,
    pub ignored: usize,
    pub gaps: Vec<FeedGap>,
    pub checkpoint: Checkpoint,
}

impl CatchUpReport {
    pub fn missed(&self) -> u64 {
        self.gaps.iter().map(FeedGap::missed).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub applied: u64,
    pub duplicates: u64,
    pub ignored: u64,
    pub failures: u64,
    pub gaps: u64,
    /// Events lost to gaps. Their counter adjustments are never applied.
    pub missed: u64,
}

#[derive(Default)]
struct ListenerCounters {
    applied: AtomicU64,
    duplicates: AtomicU64,
    ignored: AtomicU64,
    failures: AtomicU64,
    gaps: AtomicU64,
    missed: AtomicU64,
}

/// Applies counter adjustments for committed detail changes read from the change feed.
///
/// Delivery is at-least-once and may be out of order; the [`DedupLock`] makes each event count
/// once. The dedup claim and the adjustments for one event commit together in one transaction,
/// so a failed or retried commit never leaves one without the other.
pub struct CounterListener {
    name: String,
    store: Arc<dyn RecordStore>,
    registry: Arc<CounterRegistry>,
    dedup: Arc<dyn DedupLock>,
    policy: TransactionPolicy,
    counters: ListenerCounters,
}

impl CounterListener {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn RecordStore>,
        registry: Arc<CounterRegistry>,
        dedup: Arc<dyn DedupLock>,
        policy: TransactionPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            registry,
            dedup,
            policy,
            counters: ListenerCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            ignored: self.counters.ignored.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            gaps: self.counters.gaps.load(Ordering::Relaxed),
            missed: self.counters.missed.load(Ordering::Relaxed),
        }
    }

    /// Subscribe from the saved checkpoint, or from the start of the feed.
    pub async fn subscription(&self, feed: &ChangeFeed) -> Result<ChangeSubscription> {
        let from = self
            .store
            .load_checkpoint(&self.name)
            .await?
            .unwrap_or(Checkpoint::BEGINNING);
        let collections: BTreeSet<String> = self
            .registry
            .specs()
            .iter()
            .map(|spec| spec.collection.clone())
            .collect();
        Ok(feed.subscribe(from).filter(collections))
    }

    pub async fn handle(&self, change: &ChangeEvent) -> Result<EventOutcome> {
        let keys = self.registry.keys_for(&change.detail);
        if change.op == ChangeOp::Update || keys.is_empty() {
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            return Ok(EventOutcome::Ignored);
        }

        let delta = change.op.delta();
        let event_id = change.event_id;
        let result = within_transaction(&self.store, &self.policy, |store, txn| {
            let keys = keys.clone();
            let dedup = self.dedup.clone();
            async move {
                if !dedup.acquire_once(txn, event_id).await? {
                    return Ok(false);
                }
                for key in keys {
                    store.stage(txn, Change::adjust(key, delta)).await?;
                }
                Ok(true)
            }
        })
        .await;

        match result {
            Ok((true, _)) => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                Ok(EventOutcome::Applied {
                    adjusted: keys.len(),
                })
            }
            Ok((false, _)) | Err(TallyError::EventAlreadyClaimed(_)) => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                event!(
                    Level::DEBUG,
                    listener = %self.name,
                    event_id = %event_id,
                    seq = change.seq,
                    "duplicate delivery skipped"
                );
                Ok(EventOutcome::Duplicate)
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                event!(
                    Level::ERROR,
                    listener = %self.name,
                    event_id = %event_id,
                    seq = change.seq,
                    error = %err,
                    "failed to apply change event"
                );
                Err(err)
            }
        }
    }

    fn record_gap(&self, gap: &FeedGap) {
        self.counters.gaps.fetch_add(1, Ordering::Relaxed);
        self.counters.missed.fetch_add(gap.missed(), Ordering::Relaxed);
        event!(
            Level::WARN,
            listener = %self.name,
            expected = gap.expected,
            resumed_at = gap.resumed_at,
            missed = gap.missed(),
            "change feed gap; counters for the missed events will drift"
        );
    }

    /// Handle one item read from `subscription`. A failed event rewinds the subscription so it
    /// is read again.
    async fn process(
        &self,
        subscription: &mut ChangeSubscription,
        item: FeedItem,
        report: &mut CatchUpReport,
    ) -> Result<()> {
        match item {
            FeedItem::Event(change) => match self.handle(&change).await {
                Ok(EventOutcome::Applied { .. }) => report.applied += 1,
                Ok(EventOutcome::Duplicate) => report.duplicates += 1,
                Ok(EventOutcome::Ignored) => report.ignored += 1,
                Err(err) => {
                    subscription.seek(Checkpoint(change.seq));
                    self.store
                        .save_checkpoint(&self.name, subscription.checkpoint())
                        .await?;
                    return Err(err);
                }
            },
            FeedItem::Gap(gap) => {
                self.record_gap(&gap);
                report.gaps.push(gap);
            }
        }
        self.store
            .save_checkpoint(&self.name, subscription.checkpoint())
            .await
    }

    /// Process everything currently available, then return.
    pub async fn catch_up(&self, subscription: &mut ChangeSubscription) -> Result<CatchUpReport> {
        let mut report = CatchUpReport::default();
        while let Some(item) = subscription.try_next().await {
            self.process(subscription, item, &mut report).await?;
        }
        report.checkpoint = subscription.checkpoint();
        Ok(report)
    }
}

/// Background task feeding a [`CounterListener`] from the change feed.
pub struct CounterListenerWorker {
    listener: Arc<CounterListener>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl CounterListenerWorker {
    pub fn listener(&self) -> &Arc<CounterListener> {
        &self.listener
    }

    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| TallyError::Execution(format!("listener worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for CounterListenerWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Start consuming the feed from the listener's saved checkpoint.
///
/// A failed event is retried after `retry_delay`; a stopped worker resumes where it left off
/// when started again, as long as the feed still holds the events.
pub async fn spawn_counter_listener(
    listener: Arc<CounterListener>,
    feed: ChangeFeed,
    retry_delay: Duration,
) -> Result<CounterListenerWorker> {
    let mut subscription = listener.subscription(&feed).await?;
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let worker_listener = listener.clone();

    event!(
        Level::INFO,
        listener = %listener.name(),
        from = %subscription.checkpoint(),
        "counter listener started"
    );

    let span = info_span!("listener.loop", listener = %listener.name());
    let join_handle = tokio::spawn(
        async move {
            let mut report = CatchUpReport::default();
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    item = subscription.next() => {
                        let Some(item) = item else { break };
                        if worker_listener
                            .process(&mut subscription, item, &mut report)
                            .await
                            .is_err()
                        {
                            sleep(retry_delay).await;
                        }
                    }
                }
            }
            event!(
                Level::INFO,
                listener = %worker_listener.name(),
                applied = report.applied,
                duplicates = report.duplicates,
                gaps = report.gaps.len(),
                "counter listener stopped"
            );
        }
        .instrument(span),
    );

    Ok(CounterListenerWorker {
        listener,
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    })
}
