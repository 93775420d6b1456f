//! Wires the store, registries, approval manager, engine and background workers from a
//! [`Config`].

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::approval::{ApprovalManager, LogNotifier, MembershipDirectory, Notifier, StaticDirectory};
use crate::config::Config;
use crate::registry::{CorePlugin, Plugin, Registry};
use crate::scheduler::{resume_channel, ChannelQueue, DeadlineScanner, ResumeQueue, ResumeTask, ResumeWorker};
use crate::server::Server;
use crate::store::{create_store, Store};
use crate::visibility::VisibilityEvaluator;
use crate::workflow::{VersionManager, WorkflowEngine};
use crate::Result;

pub struct Services {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub registry: Arc<Registry>,
    pub directory: Arc<dyn MembershipDirectory>,
    pub approvals: Arc<ApprovalManager>,
    pub engine: Arc<WorkflowEngine>,
    pub versions: Arc<VersionManager>,
    pub visibility: Arc<VisibilityEvaluator>,
    pub queue: Arc<ChannelQueue>,
    worker: Option<ResumeWorker>,
}

impl Services {
    pub async fn build(config: &Config) -> Result<Self> {
        Self::build_with_plugins(config, &[]).await
    }

    /// Builds the services with the core plugin plus `plugins` registered after it.
    pub async fn build_with_plugins(config: &Config, plugins: &[&dyn Plugin]) -> Result<Self> {
        let store = create_store(&config.database).await?;

        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let core = CorePlugin::new(notifier.clone());
        let mut all: Vec<&dyn Plugin> = vec![&core];
        all.extend_from_slice(plugins);
        let registry = Arc::new(Registry::from_plugins(&all)?);

        let directory: Arc<dyn MembershipDirectory> = match &config.directory_path {
            Some(path) => Arc::new(StaticDirectory::load(path).await?),
            None => Arc::new(StaticDirectory::default()),
        };

        let approvals = Arc::new(ApprovalManager::new(
            store.clone(),
            registry.clone(),
            directory.clone(),
            notifier,
        ));
        let (queue, worker) = resume_channel(config.scheduler.queue_capacity);
        let queue = Arc::new(queue);
        let engine = Arc::new(WorkflowEngine::new(
            store.clone(),
            registry.clone(),
            approvals.clone(),
            directory.clone(),
            queue.clone(),
            config,
        ));
        let versions = Arc::new(VersionManager::new(
            store.clone(),
            registry.clone(),
            approvals.clone(),
            engine.instance_locks(),
        ));
        let visibility = Arc::new(VisibilityEvaluator::new(
            store.clone(),
            registry.clone(),
            directory.clone(),
        ));

        info!("Services ready with plugins {:?}", registry.plugins());
        Ok(Self {
            config: config.clone(),
            store,
            registry,
            directory,
            approvals,
            engine,
            versions,
            visibility,
            queue,
            worker: Some(worker),
        })
    }

    pub fn scanner(&self) -> Arc<DeadlineScanner> {
        Arc::new(DeadlineScanner::new(self.engine.clone(), &self.config.scheduler))
    }

    pub fn server(&self) -> Server {
        let queue: Arc<dyn ResumeQueue> = self.queue.clone();
        Server::new(self.engine.clone(), queue)
    }

    /// Spawns the resume worker. Only the first call starts one.
    pub fn spawn_resume_worker(&mut self) -> Option<JoinHandle<()>> {
        let worker = self.worker.take()?;
        let task = ResumeTask::new(self.engine.clone(), self.config.scheduler.resume_max_retries);
        Some(worker.spawn(task))
    }
}
