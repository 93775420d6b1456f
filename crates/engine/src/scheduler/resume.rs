use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::RESUME_JOBS_FAILED_TOTAL;
use crate::workflow::WorkflowEngine;
use crate::{Error, Result};

/// A request to re-enter an instance waiting at `node_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeJob {
    pub instance_id: Uuid,
    pub node_id: String,
    #[serde(default)]
    pub output_port: Option<String>,
    #[serde(default)]
    pub additional_data: Value,
}

impl ResumeJob {
    pub fn new(instance_id: Uuid, node_id: &str, output_port: Option<String>, additional_data: Value) -> Self {
        Self {
            instance_id,
            node_id: node_id.to_string(),
            output_port,
            additional_data,
        }
    }

    /// The job queued for an asynchronous action node.
    pub fn async_action(instance_id: Uuid, node_id: &str, node_config: &Value) -> Self {
        Self::new(
            instance_id,
            node_id,
            Some("default".to_string()),
            json!({"asyncAction": true, "nodeConfig": node_config}),
        )
    }

    pub fn is_async_action(&self) -> bool {
        self.additional_data
            .get("asyncAction")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Identity used to drop duplicates while a job is still queued.
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.instance_id.as_bytes());
        hasher.update(self.node_id.as_bytes());
        hasher.update(self.output_port.as_deref().unwrap_or_default().as_bytes());
        hasher.update(self.additional_data.to_string().as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResumeQueue: Send + Sync {
    async fn enqueue(&self, job: ResumeJob) -> Result<()>;
}

/// State shared by both ends of the channel.
#[derive(Default)]
struct Shared {
    /// Keys of jobs sent but not yet picked up.
    queued: Mutex<HashSet<String>>,
    /// Jobs accepted and not yet finished.
    outstanding: AtomicUsize,
    idle: Notify,
}

impl Shared {
    fn release(&self, key: &str) {
        if let Ok(mut keys) = self.queued.lock() {
            keys.remove(key);
        }
    }

    fn finish(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Bounded in-process queue. Identical jobs are accepted once until the worker picks them up.
#[derive(Clone)]
pub struct ChannelQueue {
    sender: mpsc::Sender<ResumeJob>,
    shared: Arc<Shared>,
}

/// Receiving end of a [`ChannelQueue`].
pub struct ResumeWorker {
    receiver: mpsc::Receiver<ResumeJob>,
    shared: Arc<Shared>,
}

pub fn resume_channel(capacity: usize) -> (ChannelQueue, ResumeWorker) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared::default());
    (
        ChannelQueue {
            sender,
            shared: shared.clone(),
        },
        ResumeWorker { receiver, shared },
    )
}

impl ChannelQueue {
    /// Jobs accepted that the worker has not finished yet.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Resolves once every accepted job has run, including jobs those jobs queued.
    ///
    /// Never resolves while jobs are queued and no worker is running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.shared.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            idle.await;
        }
    }
}

#[async_trait]
impl ResumeQueue for ChannelQueue {
    async fn enqueue(&self, job: ResumeJob) -> Result<()> {
        let key = job.key();
        {
            let mut keys = self
                .shared
                .queued
                .lock()
                .map_err(|_| Error::Internal("resume queue state poisoned".to_string()))?;
            if !keys.insert(key.clone()) {
                debug!("Resume job for instance {} at {} already queued", job.instance_id, job.node_id);
                return Ok(());
            }
        }

        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.sender.send(job).await {
            self.shared.release(&key);
            self.shared.finish();
            return Err(Error::Internal(format!(
                "resume queue closed, dropped job for instance {}",
                e.0.instance_id
            )));
        }
        Ok(())
    }
}

impl ResumeWorker {
    /// Consumes jobs until every sender is dropped.
    pub fn spawn(mut self, task: ResumeTask) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Resume worker started");
            while let Some(job) = self.receiver.recv().await {
                self.shared.release(&job.key());
                if let Err(e) = task.run(&job).await {
                    error!(
                        "Resume job for instance {} at {} failed: {}",
                        job.instance_id, job.node_id, e
                    );
                }
                self.shared.finish();
            }
            info!("Resume worker stopped");
        })
    }
}

/// Hands one job to the engine, retrying transient failures a bounded number of times.
pub struct ResumeTask {
    engine: Arc<WorkflowEngine>,
    max_retries: u32,
    backoff: Duration,
}

impl ResumeTask {
    pub fn new(engine: Arc<WorkflowEngine>, max_retries: u32) -> Self {
        Self {
            engine,
            max_retries,
            backoff: Duration::from_millis(500),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delivers the job. A retry hands the job to the instance again, or re-runs the step
    /// the previous attempt failed at.
    pub async fn run(&self, job: &ResumeJob) -> Result<()> {
        let mut last_error: Option<Error> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff * attempt).await;
            }
            match self.engine.deliver(job, attempt > 0).await {
                Ok(()) => {
                    debug!("Resumed instance {} at {}", job.instance_id, job.node_id);
                    return Ok(());
                }
                // A copy queued by the scan finds its action already run.
                Err(Error::NodeMismatch { .. }) | Err(Error::InstanceAlreadyCompleted(_))
                    if attempt == 0 && job.is_async_action() =>
                {
                    debug!(
                        "Async action of instance {} at {} already ran",
                        job.instance_id, job.node_id
                    );
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    warn!(
                        "Resume of instance {} at {} failed (attempt {}/{}): {}",
                        job.instance_id,
                        job.node_id,
                        attempt + 1,
                        self.max_retries + 1,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    RESUME_JOBS_FAILED_TOTAL.inc();
                    return Err(e);
                }
            }
        }
        RESUME_JOBS_FAILED_TOTAL.inc();
        Err(last_error.unwrap_or_else(|| Error::Internal("resume job was never attempted".to_string())))
    }
}
