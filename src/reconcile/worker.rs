use super::drift::{DriftDetector, DriftReport, RepairMode};
use crate::config::ReconcilePolicy;
use crate::core::{Result, TallyError};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

/// Periodic reconciliation pass over every registered counter.
pub struct ReconcilerWorker {
    reports: watch::Receiver<Vec<DriftReport>>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl ReconcilerWorker {
    /// Reports of the most recent completed pass; empty before the first one.
    pub fn latest(&self) -> Vec<DriftReport> {
        self.reports.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<DriftReport>> {
        self.reports.clone()
    }

    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| TallyError::Execution(format!("reconciler join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for ReconcilerWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

pub fn spawn_reconciler(detector: Arc<DriftDetector>, policy: ReconcilePolicy) -> ReconcilerWorker {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let (reports_tx, reports_rx) = watch::channel(Vec::new());
    let interval = policy.interval();
    let mode = if policy.repair {
        RepairMode::Repair
    } else {
        RepairMode::ReportOnly
    };

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    let pass = detector
                        .reconcile_all(mode)
                        .instrument(info_span!("reconcile.pass", ?mode));
                    match pass.await {
                        Ok(reports) => {
                            let mismatches: usize =
                                reports.iter().map(|r| r.mismatches.len()).sum();
                            event!(
                                Level::INFO,
                                counters = reports.len(),
                                mismatches,
                                "reconciliation pass finished"
                            );
                            reports_tx.send_replace(reports);
                        }
                        Err(err) => {
                            event!(Level::ERROR, error = %err, "reconciliation pass failed");
                        }
                    }
                }
            }
        }
    });

    ReconcilerWorker {
        reports: reports_rx,
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}
