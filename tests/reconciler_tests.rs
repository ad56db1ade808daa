/// Reconciler tests
///
/// Detecting drift against the detail records, repairing it, the scheduled worker, and
/// drift surviving a snapshot round through disk.
/// Run with: cargo test --test reconciler_tests

use std::time::Duration;
use tallydb::{
    AggregateKey, CounterName, EntityId, FaultPoint, MutationPipeline, NewDetail, OwnerRole,
    RepairMode, TallyConfig, TallyDb,
};
use tempfile::TempDir;

async fn drifted_db(config: TallyConfig) -> TallyDb {
    let db = TallyDb::open(config).unwrap();
    let pipeline = db.dual_write();
    db.faults().fail_next(FaultPoint::BetweenWrites, 1).unwrap();
    for post in ["p1", "p2", "p3"] {
        let _ = pipeline.create(NewDetail::like("alice", post)).await;
    }
    pipeline.create(NewDetail::like("bob", "p1")).await.unwrap();
    db
}

#[tokio::test]
async fn test_detect_reports_without_writing() {
    let db = drifted_db(TallyConfig::default()).await;
    let field = CounterName::from("number_of_posts_liked");

    let report = db.detector().detect(&field).await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.mismatches.len(), 1);
    assert!(report.repaired.is_empty());

    let drift = report.mismatch_for(&EntityId::from("alice")).unwrap();
    assert_eq!((drift.stored, drift.actual), (2, 3));
    assert_eq!(drift.difference(), -1);
    assert_eq!(
        db.store()
            .read_aggregate(&AggregateKey::new("alice", field.clone()))
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn test_repair_restores_true_counts() {
    let db = drifted_db(TallyConfig::default()).await;

    let reports = db.detector().reconcile_all(RepairMode::Repair).await.unwrap();
    // The failed mutation missed the user's counter and the post's counter.
    let repaired: usize = reports.iter().map(|r| r.repaired.len()).sum();
    assert_eq!(repaired, 2);

    let again = db.detector().reconcile_all(RepairMode::ReportOnly).await.unwrap();
    assert!(again.iter().all(|r| r.is_clean()));
    let readings = db.inspect(&EntityId::from("alice")).await.unwrap();
    assert!(readings.iter().all(|r| r.is_consistent()));
}

#[tokio::test]
async fn test_repair_sees_owners_without_records() {
    let db = TallyDb::open(TallyConfig::default()).unwrap();
    db.dual_write()
        .create(NewDetail::like("carol", "p9"))
        .await
        .unwrap();
    db.store()
        .delete_where("likes", OwnerRole::Owner, &EntityId::from("carol"))
        .await
        .unwrap();

    let field = CounterName::from("number_of_posts_liked");
    let report = db.detector().reconcile(&field, RepairMode::Repair).await.unwrap();
    assert_eq!(report.repaired, vec![EntityId::from("carol")]);
    assert_eq!(
        db.store()
            .read_aggregate(&AggregateKey::new("carol", field))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_failed_repair_leaves_counter_untouched() {
    let db = drifted_db(TallyConfig::default()).await;
    let config_attempts = db.config().transaction.retry.max_attempts as usize;
    db.faults()
        .fail_next(FaultPoint::AggregateWrite, config_attempts)
        .unwrap();

    let field = CounterName::from("number_of_posts_liked");
    assert!(db.detector().reconcile(&field, RepairMode::Repair).await.is_err());
    assert_eq!(
        db.store()
            .read_aggregate(&AggregateKey::new("alice", field))
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn test_unknown_counter_is_rejected() {
    let db = TallyDb::open(TallyConfig::default()).unwrap();
    let err = db.detector().detect(&CounterName::from("followers")).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn test_scheduled_pass_reports_and_repairs() {
    let db = drifted_db(TallyConfig::default().reconcile_interval_ms(20)).await;
    let worker = db.spawn_reconciler();
    let mut reports = worker.subscribe();

    tokio::time::timeout(Duration::from_secs(2), reports.changed())
        .await
        .unwrap()
        .unwrap();
    let first = worker.latest();
    assert!(first.iter().any(|r| !r.repaired.is_empty()));

    // The next pass finds nothing left to do.
    tokio::time::timeout(Duration::from_secs(2), reports.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(worker.latest().iter().all(|r| r.is_clean()));
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_scheduled_pass_can_only_report() {
    let mut config = TallyConfig::default().reconcile_interval_ms(20);
    config.reconcile.repair = false;
    let db = drifted_db(config).await;
    let worker = db.spawn_reconciler();
    let mut reports = worker.subscribe();

    tokio::time::timeout(Duration::from_secs(2), reports.changed())
        .await
        .unwrap()
        .unwrap();
    worker.stop().await.unwrap();

    let readings = db.inspect(&EntityId::from("alice")).await.unwrap();
    assert!(readings.iter().any(|r| !r.is_consistent()));
}

#[tokio::test]
async fn test_drift_survives_snapshot() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("tally.snapshot");

    let db = drifted_db(TallyConfig::default()).await;
    db.save_snapshot(&path).await.unwrap();

    let restored = TallyDb::open_snapshot(TallyConfig::default(), &path)
        .await
        .unwrap();
    let field = CounterName::from("number_of_posts_liked");
    let report = restored.detector().detect(&field).await.unwrap();
    let drift = report.mismatch_for(&EntityId::from("alice")).unwrap();
    assert_eq!((drift.stored, drift.actual), (2, 3));

    // New records do not collide with restored ones.
    let outcome = restored
        .dual_write()
        .create(NewDetail::like("alice", "p4"))
        .await
        .unwrap();
    assert!(outcome.is_consistent());
    assert_eq!(restored.record_store().detail_count("likes").await, 5);
}
