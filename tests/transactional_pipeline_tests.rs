/// Transactional pipeline tests
///
/// Atomicity of a single unit, and the drift a transaction does not prevent: lost updates,
/// retries after a lost acknowledgement, and writes that bypass the pipeline.
/// Run with: cargo test --test transactional_pipeline_tests

use std::sync::Arc;
use tallydb::transaction::Change;
use tallydb::{
    AggregateKey, AggregateUpdateMode, EntityId, FaultPoint, IsolationLevel, MutationPipeline,
    NewDetail, OwnerRole, PipelineKind, RetryPolicy, TallyConfig, TallyDb, TallyError,
    within_transaction,
};

const LIKES: &str = "likes";

fn liked(user: &str) -> AggregateKey {
    AggregateKey::new(user, "number_of_posts_liked")
}

#[tokio::test]
async fn test_abort_leaves_both_sides_unchanged() {
    let db = TallyDb::open(TallyConfig::default().retry(RetryPolicy::no_retry())).unwrap();
    let pipeline = db.transactional();
    pipeline.create(NewDetail::like("alice", "p1")).await.unwrap();

    for point in [FaultPoint::DetailWrite, FaultPoint::AggregateWrite, FaultPoint::Commit] {
        db.faults().fail_next(point, 1).unwrap();
        let err = pipeline.create(NewDetail::like("alice", "p2")).await.unwrap_err();
        assert!(
            matches!(err, TallyError::TransactionAbort { .. }),
            "{} should abort, got {:?}",
            point,
            err
        );

        let alice = EntityId::from("alice");
        assert_eq!(db.store().count_where(LIKES, OwnerRole::Owner, &alice).await.unwrap(), 1);
        assert_eq!(db.store().read_aggregate(&liked("alice")).await.unwrap(), 1);
        assert_eq!(
            db.store()
                .read_aggregate(&AggregateKey::new("p2", "like_count"))
                .await
                .unwrap(),
            0
        );
    }
    assert!(db.journal().drifted().unwrap().is_empty());
}

#[tokio::test]
async fn test_aborted_unit_is_retried() {
    let db = TallyDb::open(TallyConfig::default()).unwrap();
    db.faults().fail_next(FaultPoint::Commit, 2).unwrap();

    let outcome = db.transactional().create(NewDetail::like("alice", "p1")).await.unwrap();
    assert!(outcome.is_consistent());
    assert_eq!(db.store().read_aggregate(&liked("alice")).await.unwrap(), 1);
    assert_eq!(db.record_store().transaction_stats().aborted, 2);
}

#[tokio::test]
async fn test_timeout_rolls_back() {
    let config = TallyConfig::default()
        .transaction_timeout_ms(30)
        .retry(RetryPolicy::no_retry());
    let db = TallyDb::open(config).unwrap();
    let store = db.store();

    let err = within_transaction(&store, &db.config().transaction, |store, txn| async move {
        store
            .stage(txn, Change::insert(NewDetail::like("alice", "p1")))
            .await?;
        store.stage(txn, Change::adjust(liked("alice"), 1)).await?;
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        Ok(())
    })
    .await
    .unwrap_err();

    assert!(matches!(err, TallyError::TransactionAbort { .. }));
    let alice = EntityId::from("alice");
    assert_eq!(store.count_where(LIKES, OwnerRole::Owner, &alice).await.unwrap(), 0);
    assert_eq!(store.read_aggregate(&liked("alice")).await.unwrap(), 0);
    assert_eq!(db.record_store().active_transactions().await, 0);
}

#[tokio::test]
async fn test_read_committed_loses_interleaved_update() {
    let db = TallyDb::open(TallyConfig::default()).unwrap();
    let store = db.store();
    let key = liked("alice");

    // Two units read the counter before either commits.
    let first = store.begin().await.unwrap();
    let second = store.begin().await.unwrap();
    let seen_first = store.read_aggregate_in(first, &key).await.unwrap();
    let seen_second = store.read_aggregate_in(second, &key).await.unwrap();

    for (txn, seen, post) in [(first, seen_first, "p1"), (second, seen_second, "p2")] {
        store
            .stage(txn, Change::insert(NewDetail::like("alice", post)))
            .await
            .unwrap();
        store
            .stage(txn, Change::SetAggregate { key: key.clone(), value: seen + 1 })
            .await
            .unwrap();
    }
    store.commit(first).await.unwrap();
    store.commit(second).await.unwrap();

    let alice = EntityId::from("alice");
    assert_eq!(store.count_where(LIKES, OwnerRole::Owner, &alice).await.unwrap(), 2);
    assert_eq!(store.read_aggregate(&key).await.unwrap(), 1, "one update was lost");
}

#[tokio::test]
async fn test_serializable_refuses_interleaved_update() {
    let db = TallyDb::open(TallyConfig::default().isolation(IsolationLevel::Serializable)).unwrap();
    let store = db.store();
    let key = liked("alice");

    let first = store.begin().await.unwrap();
    let second = store.begin().await.unwrap();
    let seen_first = store.read_aggregate_in(first, &key).await.unwrap();
    let seen_second = store.read_aggregate_in(second, &key).await.unwrap();
    store
        .stage(first, Change::SetAggregate { key: key.clone(), value: seen_first + 1 })
        .await
        .unwrap();
    store
        .stage(second, Change::SetAggregate { key: key.clone(), value: seen_second + 1 })
        .await
        .unwrap();

    store.commit(first).await.unwrap();
    let err = store.commit(second).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(store.read_aggregate(&key).await.unwrap(), 1);
    assert_eq!(db.record_store().transaction_stats().conflicts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_committed_racing_writers_lose_updates() {
    let config = TallyConfig::default()
        .isolation(IsolationLevel::ReadCommitted)
        .operation_latency_ms(20);
    let db = TallyDb::open(config).unwrap();
    let pipeline: Arc<dyn MutationPipeline> = Arc::from(
        db.pipeline_with_mode(PipelineKind::Transactional, AggregateUpdateMode::ReadModifyWrite),
    );

    let mut handles = vec![];
    for n in 0..6 {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            pipeline
                .create(NewDetail::like("alice", format!("post-{}", n)))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Every unit committed, but they all read the counter before any of them wrote it.
    let alice = EntityId::from("alice");
    assert_eq!(db.store().count_where(LIKES, OwnerRole::Owner, &alice).await.unwrap(), 6);
    let stored = db.store().read_aggregate(&liked("alice")).await.unwrap();
    assert!(stored < 6, "expected lost updates, stored {}", stored);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_serializable_retries_keep_counter_exact() {
    let config = TallyConfig::default()
        .isolation(IsolationLevel::Serializable)
        .operation_latency_ms(2)
        .retry(RetryPolicy {
            max_attempts: 50,
            initial_backoff_ms: 1,
            max_backoff_ms: 20,
        });
    let db = TallyDb::open(config).unwrap();
    let pipeline: Arc<dyn MutationPipeline> = Arc::from(
        db.pipeline_with_mode(PipelineKind::Transactional, AggregateUpdateMode::ReadModifyWrite),
    );

    let mut handles = vec![];
    for n in 0..6 {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            pipeline
                .create(NewDetail::like("alice", format!("post-{}", n)))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(db.store().read_aggregate(&liked("alice")).await.unwrap(), 6);
}

#[tokio::test]
async fn test_retry_after_lost_ack_double_counts() {
    let db = TallyDb::open(TallyConfig::default()).unwrap();
    db.faults().fail_next(FaultPoint::CommitAckLost, 1).unwrap();

    // The first commit lands, its acknowledgement does not; the retry runs the unit again.
    let outcome = db.transactional().create(NewDetail::like("alice", "p1")).await.unwrap();
    assert!(outcome.detail.is_none(), "the retry found the like already recorded");

    let alice = EntityId::from("alice");
    assert_eq!(db.store().count_where(LIKES, OwnerRole::Owner, &alice).await.unwrap(), 1);
    assert_eq!(db.store().read_aggregate(&liked("alice")).await.unwrap(), 2);

    let report = db
        .detector()
        .detect(&"number_of_posts_liked".into())
        .await
        .unwrap();
    let drift = report.mismatch_for(&alice).unwrap();
    assert_eq!((drift.stored, drift.actual), (2, 1));
}

#[tokio::test]
async fn test_bypass_write_is_not_counted() {
    let db = TallyDb::open(TallyConfig::default()).unwrap();
    db.transactional().create(NewDetail::like("alice", "p1")).await.unwrap();

    // A second code path that writes the detail directly.
    db.store().create_detail(NewDetail::like("alice", "p2")).await.unwrap();

    let alice = EntityId::from("alice");
    assert_eq!(db.store().count_where(LIKES, OwnerRole::Owner, &alice).await.unwrap(), 2);
    assert_eq!(db.store().read_aggregate(&liked("alice")).await.unwrap(), 1);
}
