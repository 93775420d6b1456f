use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::workflow::{ScanError, ScanReport, WorkflowEngine};

/// Periodic pass over overdue approvals, due delays and scheduled edges.
///
/// Only one scan runs at a time; an overlapping call returns a report with `skipped` set.
pub struct DeadlineScanner {
    engine: Arc<WorkflowEngine>,
    running: Mutex<()>,
    interval: Duration,
    timeout: Duration,
}

impl DeadlineScanner {
    pub fn new(engine: Arc<WorkflowEngine>, config: &SchedulerConfig) -> Self {
        Self {
            engine,
            running: Mutex::new(()),
            interval: Duration::from_secs(config.scan_interval_secs.max(1)),
            timeout: Duration::from_secs(config.scan_timeout_secs.max(1)),
        }
    }

    pub async fn scan(&self, now: DateTime<Utc>) -> ScanReport {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("Deadline scan already running, skipping");
            return ScanReport {
                skipped: true,
                ..Default::default()
            };
        };

        match tokio::time::timeout(self.timeout, self.engine.process_scheduled_transitions(now)).await {
            Ok(report) => {
                for failure in &report.errors {
                    warn!(
                        "Scan error (instance {:?}, approval {:?}, node {:?}): {}",
                        failure.instance_id, failure.approval_id, failure.node_id, failure.message
                    );
                }
                report
            }
            Err(_) => {
                error!("Deadline scan exceeded {:?}", self.timeout);
                ScanReport {
                    errors: vec![ScanError {
                        message: format!("scan timed out after {:?}", self.timeout),
                        ..Default::default()
                    }],
                    ..Default::default()
                }
            }
        }
    }

    /// Scans every `interval` until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Deadline scanner running every {:?}", self.interval);
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let report = self.scan(Utc::now()).await;
                if !report.skipped && (report.processed > 0 || !report.errors.is_empty()) {
                    info!(
                        "Deadline scan: {} processed, {} error(s)",
                        report.processed,
                        report.errors.len()
                    );
                }
            }
        })
    }
}
