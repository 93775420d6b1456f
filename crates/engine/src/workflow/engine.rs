use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::context::WorkflowContext;
use super::executor::StepExecutor;
use super::graph::{normalize_port, CompiledAction, ConditionCheck, DelaySpec, Edge, Graph, Node, NodeKind, DEFAULT_PORT};
use super::lock::KeyedLocks;
use crate::approval::{ApprovalManager, GateOutcome, GateResolution, GateSettings, MemberProfile, MembershipDirectory};
use crate::conditions::{all_pass, resolve_path, value_to_datetime};
use crate::config::Config;
use crate::metrics::{INSTANCES_COMPLETED_TOTAL, INSTANCES_STARTED_TOTAL};
use crate::registry::{ActionResult, Registry};
use crate::scheduler::{ResumeJob, ResumeQueue};
use crate::store::{
    ApprovalStatus, Decision, ExecutionStatus, InstanceStatus, Store, TriggerType, VersionStatus, WorkflowApproval,
    WorkflowDefinition, WorkflowInstance, WorkflowTransitionLog, WorkflowVersion,
};
use crate::{Error, MemberId, Result};

const AUTOMATIC: &[TriggerType] = &[TriggerType::Automatic];
const SUBWORKFLOW_EVENT: &str = "subworkflow";

/// One record that failed during a scan; the scan itself carries on.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanError {
    pub instance_id: Option<Uuid>,
    pub approval_id: Option<Uuid>,
    pub node_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub processed: usize,
    pub errors: Vec<ScanError>,
    /// Set when another scan was already running.
    pub skipped: bool,
}

impl ScanReport {
    fn merge(&mut self, other: ScanReport) {
        self.processed += other.processed;
        self.errors.extend(other.errors);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub started: Vec<Uuid>,
    pub errors: Vec<String>,
}

/// Summary returned by [`WorkflowEngine::get_instance_state`].
#[derive(Debug, Clone, Serialize)]
pub struct InstanceState {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub version_id: Uuid,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub status: InstanceStatus,
    pub current_state_id: Option<String>,
    pub previous_state_id: Option<String>,
    pub active_nodes: Vec<String>,
    pub context: Value,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub pending_approvals: Vec<WorkflowApproval>,
}

/// Work that must happen after the instance lock is released.
#[derive(Debug)]
enum FollowUp {
    Enqueue(ResumeJob),
    StartChild {
        slug: String,
        payload: Value,
        parent_id: Uuid,
        node_id: String,
        triggered_by: Option<MemberId>,
        wait: bool,
    },
    ResumeParent {
        parent_id: Uuid,
        node_id: String,
        data: Value,
    },
}

enum ReEntry {
    Signal {
        port: String,
        data: Value,
        gate: Option<(bool, String)>,
        trigger_type: TriggerType,
    },
    AsyncAction,
    Scheduled {
        now: DateTime<Utc>,
    },
}

/// What the scheduled scan found to do at one waiting node.
enum DueWork {
    /// A due delay or a scheduled edge whose conditions pass.
    Transition,
    /// An async action still waiting for a worker to run it.
    Dispatch(ResumeJob),
    /// A gate that resolved without the instance moving on.
    Gate(WorkflowApproval),
}

enum NodeOutcome {
    Next(String),
    Fork,
    Wait,
    End,
}

#[derive(Clone, Copy)]
enum Selection {
    First,
    All,
}

struct Step {
    node_id: String,
    from: Option<String>,
    port: Option<String>,
    trigger_type: TriggerType,
    /// False when re-running a node in place (no transition, no enter actions).
    fresh: bool,
}

impl Step {
    fn enter(node_id: String, from: Option<String>, port: Option<String>, trigger_type: TriggerType) -> Self {
        Self {
            node_id,
            from,
            port,
            trigger_type,
            fresh: true,
        }
    }

    fn retry(node_id: String) -> Self {
        Self {
            node_id,
            from: None,
            port: None,
            trigger_type: TriggerType::Manual,
            fresh: false,
        }
    }
}

/// State of one drive call, persisted on the way out.
struct Run {
    instance: WorkflowInstance,
    context: WorkflowContext,
    graph: Arc<Graph>,
    actor: Option<MemberProfile>,
    cursor: Option<String>,
    steps: usize,
    reached_end: bool,
    follow_ups: Vec<FollowUp>,
}

impl Run {
    fn new(instance: WorkflowInstance, context: WorkflowContext, graph: Arc<Graph>, actor: Option<MemberProfile>) -> Self {
        Self {
            instance,
            context,
            graph,
            actor,
            cursor: None,
            steps: 0,
            reached_end: false,
            follow_ups: Vec::new(),
        }
    }

    fn view(&self, node_id: &str) -> Value {
        self.context
            .evaluation_view(&self.instance, Some(node_id), self.actor.as_ref())
    }

    fn actor_id(&self) -> Option<MemberId> {
        self.actor.as_ref().map(|p| p.member_id)
    }

    fn park(&mut self, node_id: &str) {
        if !self.instance.active_nodes.iter().any(|n| n == node_id) {
            self.instance.active_nodes.push(node_id.to_string());
        }
    }

    fn unpark(&mut self, node_id: &str) {
        self.instance.active_nodes.retain(|n| n != node_id);
    }
}

/// Drives workflow instances through their version's graph.
///
/// Every drive runs under the instance's lock and ends at a suspend point, a terminal
/// node or a failure. Nothing inside a drive waits for an external party.
pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    approvals: Arc<ApprovalManager>,
    directory: Arc<dyn MembershipDirectory>,
    executor: StepExecutor,
    queue: Arc<dyn ResumeQueue>,
    locks: Arc<KeyedLocks<Uuid>>,
    max_steps: usize,
    scan_page_size: i64,
    graphs: RwLock<HashMap<Uuid, Arc<Graph>>>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        approvals: Arc<ApprovalManager>,
        directory: Arc<dyn MembershipDirectory>,
        queue: Arc<dyn ResumeQueue>,
        config: &Config,
    ) -> Self {
        let executor = StepExecutor::new(
            store.clone(),
            registry.clone(),
            config.settings.clone(),
            config.engine.retry_backoff_ms,
        );
        Self {
            store,
            registry,
            approvals,
            directory,
            executor,
            queue,
            locks: Arc::new(KeyedLocks::new()),
            max_steps: config.engine.max_steps.max(1),
            scan_page_size: config.engine.scan_page_size.max(1),
            graphs: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn approvals(&self) -> &Arc<ApprovalManager> {
        &self.approvals
    }

    /// The per-instance lock table, shared with the version manager for migrations.
    pub fn instance_locks(&self) -> Arc<KeyedLocks<Uuid>> {
        self.locks.clone()
    }

    /// Starts an instance of the definition's published version and drives it to its first
    /// suspend point.
    pub async fn start_workflow(
        &self,
        slug: &str,
        event: &str,
        payload: Value,
        triggered_by: Option<MemberId>,
    ) -> Result<Uuid> {
        let (instance_id, follow_ups) = self.start_instance(slug, event, payload, triggered_by, None).await?;
        self.run_follow_ups(follow_ups).await;
        Ok(instance_id)
    }

    /// Re-enters an instance waiting at `node_id` and follows the edge bound to `output_port`.
    pub async fn resume_workflow(
        &self,
        instance_id: Uuid,
        node_id: &str,
        output_port: Option<&str>,
        additional_data: Value,
        actor: Option<MemberId>,
    ) -> Result<()> {
        let trigger_type = if actor.is_some() {
            TriggerType::Manual
        } else {
            TriggerType::Event
        };
        let entry = ReEntry::Signal {
            port: normalize_port(output_port),
            data: additional_data,
            gate: None,
            trigger_type,
        };
        let follow_ups = self.re_enter(instance_id, node_id, entry, actor, false).await?;
        self.run_follow_ups(follow_ups.unwrap_or_default()).await;
        Ok(())
    }

    /// Runs a queued async action and continues the instance past it.
    pub async fn complete_async_action(&self, instance_id: Uuid, node_id: &str) -> Result<()> {
        let follow_ups = self
            .re_enter(instance_id, node_id, ReEntry::AsyncAction, None, false)
            .await?;
        self.run_follow_ups(follow_ups.unwrap_or_default()).await;
        Ok(())
    }

    /// Hands a queued job to its instance.
    ///
    /// With `retrying` set, an instance that failed at the job's node takes the job again,
    /// and one that failed further on re-runs the node it failed at.
    pub async fn deliver(&self, job: &ResumeJob, retrying: bool) -> Result<()> {
        if retrying {
            let instance = self
                .store
                .get_instance(job.instance_id)
                .await?
                .ok_or(Error::InstanceNotFound(job.instance_id))?;
            let failed_elsewhere = instance.status == InstanceStatus::Failed
                && instance.current_state_id.as_deref() != Some(job.node_id.as_str());
            if failed_elsewhere {
                return self.retry_failed(job.instance_id).await;
            }
        }

        let entry = if job.is_async_action() {
            ReEntry::AsyncAction
        } else {
            ReEntry::Signal {
                port: normalize_port(job.output_port.as_deref()),
                data: job.additional_data.clone(),
                gate: None,
                trigger_type: TriggerType::Event,
            }
        };
        let follow_ups = self
            .re_enter(job.instance_id, &job.node_id, entry, None, retrying)
            .await?;
        self.run_follow_ups(follow_ups.unwrap_or_default()).await;
        Ok(())
    }

    /// Records a response and, when the gate resolves, resumes the instance on the gate's port.
    pub async fn respond_to_approval(
        &self,
        approval_id: Uuid,
        member_id: MemberId,
        decision: Decision,
        comment: Option<String>,
        next_approver_id: Option<MemberId>,
    ) -> Result<GateResolution> {
        let resolution = self
            .approvals
            .record_response(approval_id, member_id, decision, comment.clone(), next_approver_id)
            .await?;

        if resolution.outcome != GateOutcome::Pending {
            let data = json!({
                "approvalId": approval_id,
                "approverId": member_id,
                "decision": decision,
                "comment": comment,
            });
            match self
                .resume_gate(&resolution.approval, resolution.port.clone(), data, Some(member_id), TriggerType::Manual)
                .await
            {
                Ok(()) => {}
                Err(Error::NodeMismatch { .. }) | Err(Error::InstanceAlreadyCompleted(_)) => {
                    debug!("Instance {} already moved past approval {}", resolution.approval.instance_id, approval_id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(resolution)
    }

    /// Escalates every overdue approval and resumes instances whose gate resolved.
    pub async fn process_expired_approvals(&self, now: DateTime<Utc>) -> ScanReport {
        let mut report = ScanReport::default();
        let overdue = match self.store.list_overdue_approvals(now).await {
            Ok(overdue) => overdue,
            Err(e) => {
                report.errors.push(ScanError {
                    message: format!("failed to list overdue approvals: {}", e),
                    ..Default::default()
                });
                return report;
            }
        };

        for approval in overdue {
            let scan_error = |message: String| ScanError {
                instance_id: Some(approval.instance_id),
                approval_id: Some(approval.id),
                node_id: Some(approval.node_id.clone()),
                message,
            };

            let context = match self.store.get_instance(approval.instance_id).await {
                Ok(Some(instance)) => WorkflowContext::from_json(instance.context.clone()).evaluation_view(
                    &instance,
                    Some(&approval.node_id),
                    None,
                ),
                Ok(None) => Value::Null,
                Err(e) => {
                    report.errors.push(scan_error(e.to_string()));
                    continue;
                }
            };

            match self.approvals.escalate(approval.id, &context, now).await {
                Ok(outcome) => {
                    report.processed += 1;
                    if let Some(port) = outcome.port {
                        let data = json!({"approvalId": approval.id, "escalation": outcome.action});
                        match self
                            .resume_gate(&outcome.approval, Some(port), data, None, TriggerType::Scheduled)
                            .await
                        {
                            Ok(()) | Err(Error::NodeMismatch { .. }) | Err(Error::InstanceAlreadyCompleted(_)) => {}
                            Err(e) => {
                                warn!("Escalated approval {} but could not resume its instance: {}", approval.id, e);
                                report.errors.push(scan_error(e.to_string()));
                            }
                        }
                    }
                }
                Err(Error::ApprovalNotPending(_)) => {
                    debug!("Approval {} resolved before it could be escalated", approval.id);
                }
                Err(e) => {
                    warn!("Escalation of approval {} failed: {}", approval.id, e);
                    report.errors.push(scan_error(e.to_string()));
                }
            }
        }
        report
    }

    /// One scheduler pass: overdue approvals, due delays, scheduled edges, async actions
    /// whose job was lost and gates whose resolution never reached the instance.
    ///
    /// Waiting instances are read a page at a time. Failures are collected per record; one
    /// bad instance never stops the batch.
    pub async fn process_scheduled_transitions(&self, now: DateTime<Utc>) -> ScanReport {
        let mut report = self.process_expired_approvals(now).await;

        let mut scheduled = ScanReport::default();
        let mut after = None;
        loop {
            let page = match self
                .store
                .list_instances_by_status(InstanceStatus::Waiting, after, self.scan_page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    scheduled.errors.push(ScanError {
                        message: format!("failed to list waiting instances: {}", e),
                        ..Default::default()
                    });
                    break;
                }
            };
            let last_page = (page.len() as i64) < self.scan_page_size;
            after = page.last().map(|instance| instance.id);
            for instance in &page {
                self.scan_instance(instance, now, &mut scheduled).await;
            }
            if last_page {
                break;
            }
        }
        report.merge(scheduled);

        info!(
            "Scheduled scan processed {} record(s) with {} error(s)",
            report.processed,
            report.errors.len()
        );
        report
    }

    async fn scan_instance(&self, instance: &WorkflowInstance, now: DateTime<Utc>, report: &mut ScanReport) {
        let graph = match self.graph_for_version(instance.version_id).await {
            Ok(graph) => graph,
            Err(e) => {
                report.errors.push(ScanError {
                    instance_id: Some(instance.id),
                    message: e.to_string(),
                    ..Default::default()
                });
                return;
            }
        };

        for node_id in &instance.active_nodes {
            let result = match self.due_work(instance, &graph, node_id, now).await {
                Ok(Some(work)) => self.run_due_work(instance.id, node_id, work, now).await,
                Ok(None) => Ok(false),
                Err(e) => Err(e),
            };
            match result {
                Ok(true) => report.processed += 1,
                Ok(false) => {}
                Err(Error::NodeMismatch { .. }) | Err(Error::InstanceAlreadyCompleted(_)) => {
                    debug!("Instance {} moved on before the scan reached node '{}'", instance.id, node_id);
                }
                Err(e) => {
                    warn!("Scheduled work of instance {} at '{}' failed: {}", instance.id, node_id, e);
                    report.errors.push(ScanError {
                        instance_id: Some(instance.id),
                        node_id: Some(node_id.clone()),
                        message: e.to_string(),
                        ..Default::default()
                    });
                }
            }
        }
    }

    /// Runs one piece of scan work. `Ok(false)` means the node turned out to have nothing due.
    async fn run_due_work(&self, instance_id: Uuid, node_id: &str, work: DueWork, now: DateTime<Utc>) -> Result<bool> {
        match work {
            DueWork::Transition => {
                match self
                    .re_enter(instance_id, node_id, ReEntry::Scheduled { now }, None, false)
                    .await?
                {
                    Some(follow_ups) => {
                        self.run_follow_ups(follow_ups).await;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            DueWork::Dispatch(job) => {
                info!("Re-queueing async action of instance {} at '{}'", instance_id, node_id);
                self.queue.enqueue(job).await?;
                Ok(true)
            }
            DueWork::Gate(approval) => {
                info!(
                    "Resuming instance {} at '{}' on approval {} resolved {}",
                    instance_id, node_id, approval.id, approval.status
                );
                let port = GateSettings::from_approval(&approval).port_for(approval.status);
                let trigger_type = if approval.status == ApprovalStatus::Expired {
                    TriggerType::Scheduled
                } else {
                    TriggerType::Manual
                };
                let data = json!({"approvalId": approval.id, "status": approval.status});
                self.resume_gate(&approval, port, data, None, trigger_type).await?;
                Ok(true)
            }
        }
    }

    pub async fn cancel_workflow(
        &self,
        instance_id: Uuid,
        reason: Option<String>,
        actor: Option<MemberId>,
    ) -> Result<WorkflowInstance> {
        let _guard = self.locks.lock(&instance_id).await;
        let mut instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(Error::InstanceNotFound(instance_id))?;
        if instance.status.is_terminal() {
            return Err(Error::InstanceAlreadyCompleted(instance_id));
        }

        let now = Utc::now();
        self.approvals.cancel_for_instance(instance_id).await?;
        let at = instance.current_state_id.clone().unwrap_or_default();
        self.store
            .append_transition_log(&WorkflowTransitionLog {
                id: Uuid::new_v4(),
                instance_id,
                from_state: instance.current_state_id.clone(),
                to_state: at,
                port: Some("cancelled".to_string()),
                trigger_type: TriggerType::Manual,
                triggered_by: actor,
                context_snapshot: instance.context.clone(),
                created_at: now,
            })
            .await?;

        instance.status = InstanceStatus::Cancelled;
        instance.completed_at = Some(now);
        instance.error_message = Some(reason.unwrap_or_else(|| "cancelled".to_string()));
        instance.active_nodes.clear();
        instance.updated_at = now;
        self.store.save_instance(&instance).await?;
        info!("Cancelled instance {}", instance_id);
        Ok(instance)
    }

    pub async fn get_instance_state(&self, instance_id: Uuid) -> Result<InstanceState> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(Error::InstanceNotFound(instance_id))?;
        let pending_approvals = self
            .approvals
            .approvals_for_instance(instance_id)
            .await?
            .into_iter()
            .filter(|a| a.status == ApprovalStatus::Pending)
            .collect();

        Ok(InstanceState {
            id: instance.id,
            definition_id: instance.definition_id,
            version_id: instance.version_id,
            entity_type: instance.entity_type,
            entity_id: instance.entity_id,
            status: instance.status,
            current_state_id: instance.current_state_id,
            previous_state_id: instance.previous_state_id,
            active_nodes: instance.active_nodes,
            context: instance.context,
            error_message: instance.error_message,
            started_at: instance.started_at,
            completed_at: instance.completed_at,
            pending_approvals,
        })
    }

    /// Starts every active definition whose trigger listens for `event`.
    pub async fn dispatch_trigger(&self, event: &str, payload: Value, triggered_by: Option<MemberId>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let definitions = match self.store.list_active_definitions().await {
            Ok(definitions) => definitions,
            Err(e) => {
                report.errors.push(e.to_string());
                return report;
            }
        };

        for definition in definitions {
            let Ok(version) = self.published_version(&definition).await else {
                continue;
            };
            let graph = match self.graph(&version).await {
                Ok(graph) => graph,
                Err(e) => {
                    report.errors.push(format!("{}: {}", definition.slug, e));
                    continue;
                }
            };
            if graph.trigger_event() != Some(event) {
                continue;
            }
            match self
                .start_workflow(&definition.slug, event, payload.clone(), triggered_by)
                .await
            {
                Ok(id) => report.started.push(id),
                Err(e) => report.errors.push(format!("{}: {}", definition.slug, e)),
            }
        }
        debug!("Dispatched {} to {} definition(s)", event, report.started.len());
        report
    }

    /// Re-executes the node a failed instance stopped at.
    pub async fn retry_failed(&self, instance_id: Uuid) -> Result<()> {
        let follow_ups = {
            let _guard = self.locks.lock(&instance_id).await;
            let instance = self
                .store
                .get_instance(instance_id)
                .await?
                .ok_or(Error::InstanceNotFound(instance_id))?;
            if instance.status != InstanceStatus::Failed {
                return Err(Error::Validation(format!("instance {} is not failed", instance_id)));
            }
            let node_id = instance
                .current_state_id
                .clone()
                .ok_or_else(|| Error::Validation(format!("instance {} has no current node", instance_id)))?;

            let graph = self.graph_for_version(instance.version_id).await?;
            let context = WorkflowContext::from_json(instance.context.clone());
            let actor = self.profile(instance.triggered_by).await?;
            let mut run = Run::new(instance, context, graph, actor);
            run.instance.status = InstanceStatus::Running;
            run.instance.error_message = None;
            run.instance.active_nodes.clear();

            info!("Retrying instance {} at node '{}'", instance_id, node_id);
            self.execute(&mut run, VecDeque::from([Step::retry(node_id)])).await?;
            run.follow_ups
        };
        self.run_follow_ups(follow_ups).await;
        Ok(())
    }

    /// Compiled graph of a version, cached for the engine's lifetime.
    pub async fn graph_for_version(&self, version_id: Uuid) -> Result<Arc<Graph>> {
        if let Some(graph) = self.graphs.read().await.get(&version_id) {
            return Ok(graph.clone());
        }
        let version = self
            .store
            .get_version(version_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workflow version {}", version_id)))?;
        self.compile(&version).await
    }

    async fn graph(&self, version: &WorkflowVersion) -> Result<Arc<Graph>> {
        if let Some(graph) = self.graphs.read().await.get(&version.id) {
            return Ok(graph.clone());
        }
        self.compile(version).await
    }

    async fn compile(&self, version: &WorkflowVersion) -> Result<Arc<Graph>> {
        let definition = self.store.get_definition(version.definition_id).await?;
        let entity = definition
            .as_ref()
            .and_then(|d| self.registry.entity(&d.entity_type));
        let graph = Arc::new(Graph::from_value(&version.definition, &self.registry, entity)?);
        self.graphs.write().await.insert(version.id, graph.clone());
        Ok(graph)
    }

    async fn published_version(&self, definition: &WorkflowDefinition) -> Result<WorkflowVersion> {
        let missing = || Error::NoPublishedVersion(definition.slug.clone());
        if !definition.is_active {
            return Err(missing());
        }
        let version_id = definition.current_version_id.ok_or_else(missing)?;
        let version = self.store.get_version(version_id).await?.ok_or_else(missing)?;
        if version.status != VersionStatus::Published {
            return Err(missing());
        }
        Ok(version)
    }

    async fn profile(&self, member: Option<MemberId>) -> Result<Option<MemberProfile>> {
        match member {
            Some(id) => Ok(Some(self.directory.profile(id).await?)),
            None => Ok(None),
        }
    }

    async fn start_instance(
        &self,
        slug: &str,
        event: &str,
        payload: Value,
        triggered_by: Option<MemberId>,
        parent: Option<(Uuid, String)>,
    ) -> Result<(Uuid, Vec<FollowUp>)> {
        let definition = self
            .store
            .get_definition_by_slug(slug)
            .await?
            .ok_or_else(|| Error::DefinitionNotFound(slug.to_string()))?;
        let version = self.published_version(&definition).await?;
        if let Some(trigger) = self.registry.trigger(event) {
            trigger
                .validate_payload(&payload)
                .map_err(|message| Error::InvalidPayload {
                    event: event.to_string(),
                    message,
                })?;
        }
        let graph = self.graph(&version).await?;
        let entity_id = entity_id_of(&graph, &payload);

        let start_guard = self.locks.lock(&definition.id).await;
        if let Some(entity_id) = &entity_id {
            if let Some(existing) = self
                .store
                .find_active_instance(definition.id, &definition.entity_type, entity_id)
                .await?
            {
                return Err(Error::DuplicateInstance { existing: existing.id });
            }
        }

        let now = Utc::now();
        let context = WorkflowContext::new(event, payload, triggered_by);
        let (parent_instance_id, parent_node_id) = match parent {
            Some((id, node)) => (Some(id), Some(node)),
            None => (None, None),
        };
        let instance = WorkflowInstance {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            version_id: version.id,
            entity_type: definition.entity_type.clone(),
            entity_id,
            status: InstanceStatus::Running,
            current_state_id: None,
            previous_state_id: None,
            active_nodes: Vec::new(),
            context: context.as_json().clone(),
            triggered_by,
            parent_instance_id,
            parent_node_id,
            error_message: None,
            started_at: now,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.save_instance(&instance).await?;
        let _guard = self.locks.lock(&instance.id).await;
        drop(start_guard);

        INSTANCES_STARTED_TOTAL.inc();
        info!(
            "Started instance {} of {} (version {}) for {} {:?}",
            instance.id, slug, version.version_number, instance.entity_type, instance.entity_id
        );

        let trigger_type = if triggered_by.is_some() {
            TriggerType::Manual
        } else {
            TriggerType::Event
        };
        let actor = self.profile(triggered_by).await?;
        let mut run = Run::new(instance, context, graph, actor);
        let trigger_id = run.graph.trigger_id().to_string();
        self.execute(
            &mut run,
            VecDeque::from([Step::enter(trigger_id, None, None, trigger_type)]),
        )
        .await?;
        Ok((run.instance.id, run.follow_ups))
    }

    async fn resume_gate(
        &self,
        approval: &WorkflowApproval,
        port: Option<String>,
        data: Value,
        actor: Option<MemberId>,
        trigger_type: TriggerType,
    ) -> Result<()> {
        let port = port.unwrap_or_else(|| approval.status.to_string());
        let entry = ReEntry::Signal {
            port,
            data,
            gate: Some((approval.status == ApprovalStatus::Approved, approval.status.to_string())),
            trigger_type,
        };
        let follow_ups = self
            .re_enter(approval.instance_id, &approval.node_id, entry, actor, false)
            .await?;
        self.run_follow_ups(follow_ups.unwrap_or_default()).await;
        Ok(())
    }

    /// Re-enters a waiting node. `Ok(None)` means there was nothing to do.
    ///
    /// `accept_failed` also admits an instance that failed at `node_id`, for a job that is
    /// being delivered again after its own attempt failed there.
    async fn re_enter(
        &self,
        instance_id: Uuid,
        node_id: &str,
        entry: ReEntry,
        actor: Option<MemberId>,
        accept_failed: bool,
    ) -> Result<Option<Vec<FollowUp>>> {
        let _guard = self.locks.lock(&instance_id).await;
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(Error::InstanceNotFound(instance_id))?;
        if instance.status.is_terminal() {
            return Err(Error::InstanceAlreadyCompleted(instance_id));
        }
        let failed_here = accept_failed
            && instance.status == InstanceStatus::Failed
            && instance.current_state_id.as_deref() == Some(node_id);
        if !failed_here && !instance.is_waiting_at(node_id) {
            return Err(Error::NodeMismatch {
                instance_id,
                node_id: node_id.to_string(),
            });
        }

        let graph = self.graph_for_version(instance.version_id).await?;
        let node = graph.node(node_id).ok_or_else(|| Error::NodeMismatch {
            instance_id,
            node_id: node_id.to_string(),
        })?;
        let context = WorkflowContext::from_json(instance.context.clone());
        let profile = self.profile(actor).await?;
        let mut run = Run::new(instance, context, graph.clone(), profile);
        run.cursor = Some(node_id.to_string());
        if failed_here {
            info!("Delivering to instance {} at '{}' again after a failed attempt", instance_id, node_id);
            run.instance.error_message = None;
        }

        let result = match entry {
            ReEntry::Signal {
                port,
                data,
                gate,
                trigger_type,
            } => {
                run.context.record_resume(node_id, &port, &data);
                if let Some((is_met, status)) = &gate {
                    run.context.record_gate(node_id, *is_met, status);
                }
                let allowed = [TriggerType::Automatic, trigger_type];
                let edges = self
                    .choose(&run, node, &port, &allowed, Selection::First)?
                    .ok_or_else(|| Error::NoMatchingTransition {
                        instance_id,
                        node_id: node_id.to_string(),
                        port: port.clone(),
                    })?;
                info!("Resuming instance {} at '{}' on port {}", instance_id, node_id, port);
                self.close_waiting_log(instance_id, node_id, json!({"port": port, "data": data}))
                    .await?;
                run.unpark(node_id);
                run.instance.status = InstanceStatus::Running;
                self.depart_and_drive(&mut run, node, edges).await
            }
            ReEntry::AsyncAction => {
                let NodeKind::Action { action, params, .. } = &node.kind else {
                    return Err(Error::Validation(format!("node '{}' is not an action node", node_id)));
                };
                run.unpark(node_id);
                run.instance.status = InstanceStatus::Running;
                self.close_waiting_log(instance_id, node_id, json!({"dispatched": action}))
                    .await?;
                let view = run.view(node_id);
                match self.executor.run_action(instance_id, node, action, params, &view).await {
                    Ok(result) => {
                        apply_action_result(&mut run, node, result);
                        match self.choose(&run, node, DEFAULT_PORT, AUTOMATIC, Selection::First) {
                            Ok(Some(edges)) => self.depart_and_drive(&mut run, node, edges).await,
                            Ok(None) => {
                                run.park(node_id);
                                Ok(())
                            }
                            Err(e) => Err(e),
                        }
                    }
                    Err(e) => Err(e),
                }
            }
            ReEntry::Scheduled { now } => {
                let delay_due = matches!(node.kind, NodeKind::Delay { .. }) && delay_is_due(&run.context, node_id, now);
                let edges = if delay_due {
                    run.context.internal_map("delays").remove(node_id);
                    let allowed = [TriggerType::Automatic, TriggerType::Scheduled];
                    self.choose(&run, node, DEFAULT_PORT, &allowed, Selection::First)?
                } else {
                    let view = run.view(node_id);
                    graph
                        .outgoing(node_id)
                        .find(|e| e.trigger_type == TriggerType::Scheduled && all_pass(&e.conditions, &self.registry, &view))
                        .map(|e| vec![e.clone()])
                };
                let Some(edges) = edges else {
                    return Ok(None);
                };
                info!("Scheduled transition of instance {} from '{}'", instance_id, node_id);
                self.close_waiting_log(instance_id, node_id, json!({"scheduled": now.to_rfc3339()}))
                    .await?;
                run.unpark(node_id);
                run.instance.status = InstanceStatus::Running;
                self.depart_and_drive(&mut run, node, edges).await
            }
        };

        self.conclude(&mut run, result).await?;
        Ok(Some(run.follow_ups))
    }

    async fn depart_and_drive(&self, run: &mut Run, node: &Node, edges: Vec<Edge>) -> Result<()> {
        let steps = self.depart(run, node, edges).await?;
        self.drive(run, steps.into()).await
    }

    async fn execute(&self, run: &mut Run, queue: VecDeque<Step>) -> Result<()> {
        let result = self.drive(run, queue).await;
        self.conclude(run, result).await
    }

    /// Persists the outcome of a drive: completed, waiting, parked after a cycle, or failed.
    async fn conclude(&self, run: &mut Run, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => self.settle(run).await,
            Err(e @ Error::WorkflowCycleDetected { .. }) => {
                self.save(run).await?;
                Err(e)
            }
            Err(e) => {
                let node_id = run.cursor.clone().unwrap_or_default();
                let err = step_error(run.instance.id, &node_id, e);
                error!("Instance {} failed at node '{}': {}", run.instance.id, node_id, err);
                run.instance.status = InstanceStatus::Failed;
                run.instance.error_message = Some(err.to_string());
                run.instance.current_state_id = run.cursor.clone();
                run.instance.active_nodes = run.cursor.iter().cloned().collect();
                if let Err(save_err) = self.save(run).await {
                    error!("Could not persist failure of instance {}: {}", run.instance.id, save_err);
                }
                Err(err)
            }
        }
    }

    async fn settle(&self, run: &mut Run) -> Result<()> {
        let now = Utc::now();
        if run.instance.active_nodes.is_empty() && run.reached_end {
            run.instance.status = InstanceStatus::Completed;
            run.instance.completed_at = Some(now);
            run.instance.error_message = None;
            INSTANCES_COMPLETED_TOTAL.inc();
            info!(
                "Instance {} completed at '{}'",
                run.instance.id,
                run.instance.current_state_id.as_deref().unwrap_or_default()
            );
            if let (Some(parent_id), Some(node_id)) =
                (run.instance.parent_instance_id, run.instance.parent_node_id.clone())
            {
                run.follow_ups.push(FollowUp::ResumeParent {
                    parent_id,
                    node_id,
                    data: json!({"childInstanceId": run.instance.id, "childStatus": "completed"}),
                });
            }
        } else {
            if run.instance.active_nodes.is_empty() {
                if let Some(cursor) = run.cursor.clone() {
                    run.park(&cursor);
                }
            }
            run.instance.status = InstanceStatus::Waiting;
            debug!("Instance {} waiting at {:?}", run.instance.id, run.instance.active_nodes);
        }
        self.save(run).await
    }

    async fn save(&self, run: &mut Run) -> Result<()> {
        run.instance.context = run.context.as_json().clone();
        run.instance.updated_at = Utc::now();
        self.store.save_instance(&run.instance).await
    }

    async fn drive(&self, run: &mut Run, mut queue: VecDeque<Step>) -> Result<()> {
        let graph = run.graph.clone();
        while let Some(step) = queue.pop_front() {
            run.steps += 1;
            if run.steps > self.max_steps {
                let parked = step
                    .from
                    .clone()
                    .or_else(|| run.cursor.clone())
                    .unwrap_or_else(|| step.node_id.clone());
                warn!(
                    "Instance {} exceeded {} steps; parking at '{}'",
                    run.instance.id, self.max_steps, parked
                );
                run.instance.current_state_id = Some(parked.clone());
                run.instance.active_nodes = vec![parked.clone()];
                run.instance.status = InstanceStatus::Waiting;
                return Err(Error::WorkflowCycleDetected {
                    instance_id: run.instance.id,
                    node_id: parked,
                    steps: self.max_steps,
                });
            }

            let node = graph
                .node(&step.node_id)
                .ok_or_else(|| Error::InvalidDefinition(format!("node '{}' does not exist", step.node_id)))?;
            run.cursor = Some(node.id.clone());
            if step.fresh {
                self.enter(run, node, &step).await?;
            }

            match self.execute_node(run, node, &step).await? {
                NodeOutcome::Next(port) => match self.choose(run, node, &port, AUTOMATIC, Selection::First)? {
                    Some(edges) => queue.extend(self.depart(run, node, edges).await?),
                    None => run.park(&node.id),
                },
                NodeOutcome::Fork => match self.choose(run, node, DEFAULT_PORT, AUTOMATIC, Selection::All)? {
                    Some(edges) => queue.extend(self.depart(run, node, edges).await?),
                    None => run.park(&node.id),
                },
                NodeOutcome::Wait => run.park(&node.id),
                NodeOutcome::End => run.reached_end = true,
            }
        }
        Ok(())
    }

    async fn enter(&self, run: &mut Run, node: &Node, step: &Step) -> Result<()> {
        let now = Utc::now();
        let previous = step.from.clone().or_else(|| run.instance.current_state_id.clone());
        run.instance.previous_state_id = previous;
        run.instance.current_state_id = Some(node.id.clone());
        run.context.mark_state_entered(&node.id, now);

        self.store
            .append_transition_log(&WorkflowTransitionLog {
                id: Uuid::new_v4(),
                instance_id: run.instance.id,
                from_state: step.from.clone(),
                to_state: node.id.clone(),
                port: step.port.clone(),
                trigger_type: step.trigger_type,
                triggered_by: run.actor_id(),
                context_snapshot: run.context.as_json().clone(),
                created_at: now,
            })
            .await?;
        debug!(
            "Instance {} entered {} node '{}'",
            run.instance.id,
            node.node_type.as_str(),
            node.id
        );

        self.hooks(run, &node.id, &format!("node '{}'", node.id), &node.on_enter)
            .await
    }

    async fn depart(&self, run: &mut Run, node: &Node, edges: Vec<Edge>) -> Result<Vec<Step>> {
        if matches!(node.kind, NodeKind::Approval { .. }) {
            self.approvals.cancel_pending_at(run.instance.id, &node.id).await?;
        }
        self.hooks(run, &node.id, &format!("node '{}'", node.id), &node.on_exit)
            .await?;

        let mut steps = Vec::with_capacity(edges.len());
        for edge in edges {
            self.hooks(run, &node.id, &format!("edge '{}'", edge.id), &edge.actions)
                .await?;
            steps.push(Step::enter(
                edge.target.clone(),
                Some(node.id.clone()),
                Some(edge.port.clone()),
                edge.trigger_type,
            ));
        }
        Ok(steps)
    }

    async fn hooks(&self, run: &mut Run, node_id: &str, owner: &str, hooks: &[CompiledAction]) -> Result<()> {
        if hooks.is_empty() {
            return Ok(());
        }
        let instance = run.instance.clone();
        let actor = run.actor.clone();
        self.executor
            .run_hooks(owner, hooks, &mut run.context, |context| {
                context.evaluation_view(&instance, Some(node_id), actor.as_ref())
            })
            .await
    }

    /// Picks the edges leaving `node` on `port` among those of an allowed trigger type.
    ///
    /// `Ok(None)` means the node should wait: it is a state node, or only edges of other
    /// trigger types leave it.
    fn choose(
        &self,
        run: &Run,
        node: &Node,
        port: &str,
        allowed: &[TriggerType],
        selection: Selection,
    ) -> Result<Option<Vec<Edge>>> {
        let candidates: Vec<&Edge> = run
            .graph
            .outgoing(&node.id)
            .filter(|e| allowed.contains(&e.trigger_type))
            .collect();
        let mut on_port: Vec<&Edge> = candidates.iter().copied().filter(|e| e.port == port).collect();
        if on_port.is_empty() && port != DEFAULT_PORT {
            on_port = candidates.iter().copied().filter(|e| e.port == DEFAULT_PORT).collect();
        }

        let view = run.view(&node.id);
        let passes = |edge: &Edge| all_pass(&edge.conditions, &self.registry, &view);
        let chosen: Vec<Edge> = match selection {
            Selection::All => on_port.iter().copied().filter(|e| passes(e)).cloned().collect(),
            Selection::First => on_port
                .iter()
                .copied()
                .find(|e| !e.is_default && passes(e))
                .or_else(|| on_port.iter().copied().find(|e| e.is_default))
                .map(|e| vec![e.clone()])
                .unwrap_or_default(),
        };

        if !chosen.is_empty() {
            return Ok(Some(chosen));
        }
        let other_triggers = run
            .graph
            .outgoing(&node.id)
            .any(|e| !allowed.contains(&e.trigger_type));
        if matches!(node.kind, NodeKind::State) || other_triggers {
            return Ok(None);
        }
        Err(Error::NoMatchingTransition {
            instance_id: run.instance.id,
            node_id: node.id.clone(),
            port: port.to_string(),
        })
    }

    async fn execute_node(&self, run: &mut Run, node: &Node, step: &Step) -> Result<NodeOutcome> {
        let instance_id = run.instance.id;
        match &node.kind {
            NodeKind::Trigger { .. } => {
                let payload = run.context.get("trigger").clone();
                run.context.record_node(&node.id, json!({"result": payload}));
                self.executor
                    .record(instance_id, node, ExecutionStatus::Completed, Some(payload))
                    .await?;
                Ok(NodeOutcome::Next(DEFAULT_PORT.to_string()))
            }
            NodeKind::Action { action, params, is_async } => {
                if *is_async {
                    self.executor
                        .record(instance_id, node, ExecutionStatus::Waiting, Some(json!({"action": action})))
                        .await?;
                    run.follow_ups
                        .push(FollowUp::Enqueue(ResumeJob::async_action(instance_id, &node.id, &node.config)));
                    info!("Queued async action {} for instance {} at '{}'", action, instance_id, node.id);
                    return Ok(NodeOutcome::Wait);
                }
                let view = run.view(&node.id);
                let result = self
                    .executor
                    .run_action(instance_id, node, action, params, &view)
                    .await?;
                apply_action_result(run, node, result);
                Ok(NodeOutcome::Next(DEFAULT_PORT.to_string()))
            }
            NodeKind::Condition { check } => {
                let Some(check) = check else {
                    self.executor
                        .record(instance_id, node, ExecutionStatus::Completed, None)
                        .await?;
                    return Ok(NodeOutcome::Next(DEFAULT_PORT.to_string()));
                };
                let view = run.view(&node.id);
                let result = match check {
                    ConditionCheck::Named { name, params } => {
                        let resolved = self.executor.resolve_params(params, &view);
                        self.registry
                            .condition(name)
                            .map(|c| c.evaluate(&resolved, &view))
                            .unwrap_or(false)
                    }
                    ConditionCheck::Rule(rule) => rule.evaluate(&self.registry, &view),
                };
                let port = if result { "true" } else { "false" };
                let record = json!({"result": result, "port": port});
                run.context.record_node(&node.id, record.clone());
                self.executor
                    .record(instance_id, node, ExecutionStatus::Completed, Some(record))
                    .await?;
                Ok(NodeOutcome::Next(port.to_string()))
            }
            NodeKind::Approval { gate } => {
                let mut log = self.executor.begin(instance_id, node, None).await?;
                let view = run.view(&node.id);
                let approval = match self
                    .approvals
                    .open_gate(&run.instance, &node.id, gate, &view, Some(log.id))
                    .await
                {
                    Ok(approval) => approval,
                    Err(e) => {
                        self.executor
                            .finish(&mut log, ExecutionStatus::Failed, None, Some(e.to_string()))
                            .await?;
                        return Err(e);
                    }
                };

                if approval.status == ApprovalStatus::Pending {
                    let record = json!({"approvalId": approval.id, "status": approval.status});
                    run.context.record_node(&node.id, record.clone());
                    self.executor
                        .finish(&mut log, ExecutionStatus::Waiting, Some(record), None)
                        .await?;
                    return Ok(NodeOutcome::Wait);
                }

                let port = GateSettings::from_approval(&approval)
                    .port_for(approval.status)
                    .unwrap_or_else(|| DEFAULT_PORT.to_string());
                run.context.record_gate(
                    &node.id,
                    approval.status == ApprovalStatus::Approved,
                    &approval.status.to_string(),
                );
                let record = json!({"approvalId": approval.id, "status": approval.status, "port": port});
                run.context.record_node(&node.id, record.clone());
                self.executor
                    .finish(&mut log, ExecutionStatus::Completed, Some(record), None)
                    .await?;
                Ok(NodeOutcome::Next(port))
            }
            NodeKind::State => {
                self.executor
                    .record(instance_id, node, ExecutionStatus::Completed, None)
                    .await?;
                Ok(NodeOutcome::Next(DEFAULT_PORT.to_string()))
            }
            NodeKind::Fork => {
                self.executor
                    .record(instance_id, node, ExecutionStatus::Completed, None)
                    .await?;
                Ok(NodeOutcome::Fork)
            }
            NodeKind::Join => {
                let required: Vec<String> = run
                    .graph
                    .incoming_sources(&node.id)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                let joins = run.context.internal_map("joinState");
                let mut arrived: Vec<String> = joins
                    .get(&node.id)
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                if let Some(from) = &step.from {
                    if !arrived.contains(from) {
                        arrived.push(from.clone());
                    }
                }

                if required.iter().all(|source| arrived.contains(source)) {
                    joins.remove(&node.id);
                    run.unpark(&node.id);
                    let output = json!({"arrived": arrived});
                    match self.store.find_waiting_log(instance_id, &node.id).await? {
                        Some(mut log) => {
                            self.executor
                                .finish(&mut log, ExecutionStatus::Completed, Some(output), None)
                                .await?
                        }
                        None => {
                            self.executor
                                .record(instance_id, node, ExecutionStatus::Completed, Some(output))
                                .await?;
                        }
                    }
                    return Ok(NodeOutcome::Next(DEFAULT_PORT.to_string()));
                }

                joins.insert(node.id.clone(), json!(arrived));
                if self.store.find_waiting_log(instance_id, &node.id).await?.is_none() {
                    self.executor
                        .record(
                            instance_id,
                            node,
                            ExecutionStatus::Waiting,
                            Some(json!({"arrived": arrived, "required": required})),
                        )
                        .await?;
                }
                Ok(NodeOutcome::Wait)
            }
            NodeKind::Loop {
                max_iterations,
                exit_condition,
            } => {
                let view = run.view(&node.id);
                let exit = exit_condition
                    .as_ref()
                    .map(|rule| rule.evaluate(&self.registry, &view))
                    .unwrap_or(false);
                let loops = run.context.internal_map("loopState");
                let iteration = loops.get(&node.id).and_then(Value::as_u64).unwrap_or(0) as u32;
                let port = if exit || iteration >= *max_iterations {
                    loops.remove(&node.id);
                    "exit"
                } else {
                    loops.insert(node.id.clone(), json!(iteration + 1));
                    "continue"
                };
                let record = json!({"iteration": iteration, "port": port});
                run.context.record_node(&node.id, record.clone());
                self.executor
                    .record(instance_id, node, ExecutionStatus::Completed, Some(record))
                    .await?;
                Ok(NodeOutcome::Next(port.to_string()))
            }
            NodeKind::Delay { wait } => {
                let now = Utc::now();
                let due = match wait {
                    DelaySpec::For(duration) => Some(now + *duration),
                    DelaySpec::Until(path) => {
                        let due = value_to_datetime(run.context.get(path));
                        if due.is_none() {
                            warn!(
                                "Delay '{}' of instance {}: no date at '{}', continuing",
                                node.id, instance_id, path
                            );
                        }
                        due
                    }
                };
                match due {
                    Some(due) if due > now => {
                        run.context
                            .internal_map("delays")
                            .insert(node.id.clone(), json!(due.to_rfc3339()));
                        self.executor
                            .record(instance_id, node, ExecutionStatus::Waiting, Some(json!({"until": due})))
                            .await?;
                        Ok(NodeOutcome::Wait)
                    }
                    _ => {
                        self.executor
                            .record(instance_id, node, ExecutionStatus::Completed, None)
                            .await?;
                        Ok(NodeOutcome::Next(DEFAULT_PORT.to_string()))
                    }
                }
            }
            NodeKind::Subworkflow {
                definition,
                params,
                wait,
            } => {
                let view = run.view(&node.id);
                let payload = match self.executor.resolve_params(params, &view) {
                    Value::Null => json!({}),
                    other => other,
                };
                run.follow_ups.push(FollowUp::StartChild {
                    slug: definition.clone(),
                    payload,
                    parent_id: instance_id,
                    node_id: node.id.clone(),
                    triggered_by: run.instance.triggered_by,
                    wait: *wait,
                });
                let (status, outcome) = if *wait {
                    (ExecutionStatus::Waiting, NodeOutcome::Wait)
                } else {
                    (ExecutionStatus::Completed, NodeOutcome::Next(DEFAULT_PORT.to_string()))
                };
                self.executor
                    .record(instance_id, node, status, Some(json!({"definition": definition})))
                    .await?;
                Ok(outcome)
            }
            NodeKind::End => {
                self.executor
                    .record(instance_id, node, ExecutionStatus::Completed, None)
                    .await?;
                Ok(NodeOutcome::End)
            }
        }
    }

    async fn close_waiting_log(&self, instance_id: Uuid, node_id: &str, output: Value) -> Result<()> {
        if let Some(mut log) = self.store.find_waiting_log(instance_id, node_id).await? {
            self.executor
                .finish(&mut log, ExecutionStatus::Completed, Some(output), None)
                .await?;
        }
        Ok(())
    }

    async fn due_work(
        &self,
        instance: &WorkflowInstance,
        graph: &Graph,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DueWork>> {
        let Some(node) = graph.node(node_id) else {
            return Ok(None);
        };
        match &node.kind {
            // A waiting log means no worker has taken the job yet; the queue drops the
            // copy if the original is still queued.
            NodeKind::Action { is_async: true, .. } => {
                if self.store.find_waiting_log(instance.id, node_id).await?.is_some() {
                    return Ok(Some(DueWork::Dispatch(ResumeJob::async_action(
                        instance.id,
                        node_id,
                        &node.config,
                    ))));
                }
            }
            NodeKind::Approval { .. } => {
                if let Some(approval) = self.approvals.unconsumed_resolution(instance.id, node_id).await? {
                    return Ok(Some(DueWork::Gate(approval)));
                }
            }
            _ => {}
        }

        let context = WorkflowContext::from_json(instance.context.clone());
        if matches!(node.kind, NodeKind::Delay { .. }) && delay_is_due(&context, node_id, now) {
            return Ok(Some(DueWork::Transition));
        }
        let view = context.evaluation_view(instance, Some(node_id), None);
        let scheduled = graph
            .outgoing(node_id)
            .any(|e| e.trigger_type == TriggerType::Scheduled && all_pass(&e.conditions, &self.registry, &view));
        Ok(scheduled.then_some(DueWork::Transition))
    }

    async fn run_follow_ups(&self, follow_ups: Vec<FollowUp>) {
        let mut pending: VecDeque<FollowUp> = follow_ups.into();
        while let Some(follow_up) = pending.pop_front() {
            match follow_up {
                FollowUp::Enqueue(job) => {
                    let instance_id = job.instance_id;
                    if let Err(e) = self.queue.enqueue(job).await {
                        error!("Could not queue resume job for instance {}: {}", instance_id, e);
                    }
                }
                FollowUp::StartChild {
                    slug,
                    payload,
                    parent_id,
                    node_id,
                    triggered_by,
                    wait,
                } => {
                    let parent = wait.then(|| (parent_id, node_id.clone()));
                    match self
                        .start_instance(&slug, SUBWORKFLOW_EVENT, payload, triggered_by, parent)
                        .await
                    {
                        Ok((child_id, more)) => {
                            info!("Instance {} started child {} ({}) at '{}'", parent_id, child_id, slug, node_id);
                            pending.extend(more);
                        }
                        Err(e) => error!(
                            "Instance {} could not start subworkflow {} at '{}': {}",
                            parent_id, slug, node_id, e
                        ),
                    }
                }
                FollowUp::ResumeParent {
                    parent_id,
                    node_id,
                    data,
                } => {
                    let entry = ReEntry::Signal {
                        port: DEFAULT_PORT.to_string(),
                        data,
                        gate: None,
                        trigger_type: TriggerType::Automatic,
                    };
                    match self.re_enter(parent_id, &node_id, entry, None, false).await {
                        Ok(more) => pending.extend(more.unwrap_or_default()),
                        Err(e) => warn!("Could not resume parent instance {} at '{}': {}", parent_id, node_id, e),
                    }
                }
            }
        }
    }
}

fn apply_action_result(run: &mut Run, node: &Node, result: ActionResult) {
    run.context.merge_updates(&result.context_updates);
    run.context.record_node(&node.id, json!({"result": result.output}));
}

fn delay_is_due(context: &WorkflowContext, node_id: &str, now: DateTime<Utc>) -> bool {
    context
        .internal("delays")
        .get(node_id)
        .and_then(value_to_datetime)
        .map(|due| due <= now)
        .unwrap_or(true)
}

/// Entity id of a new instance: the trigger's `entity_id_field`, else a conventional key.
fn entity_id_of(graph: &Graph, payload: &Value) -> Option<String> {
    let field = match graph.node(graph.trigger_id()).map(|n| &n.kind) {
        Some(NodeKind::Trigger {
            entity_id_field: Some(field),
            ..
        }) => Some(field.as_str()),
        _ => None,
    };
    let value = match field {
        Some(path) => resolve_path(payload, path),
        None => ["entity_id", "entityId", "entity.id"]
            .iter()
            .map(|path| resolve_path(payload, path))
            .find(|v| !v.is_null())
            .unwrap_or(&Value::Null),
    };
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Wraps action and hook failures with the instance and node they happened at.
fn step_error(instance_id: Uuid, node_id: &str, e: Error) -> Error {
    match e {
        Error::NoMatchingTransition { .. }
        | Error::StepFailed { .. }
        | Error::WorkflowCycleDetected { .. }
        | Error::InvalidDefinition(_)
        | Error::Sqlx(_)
        | Error::Io(_) => e,
        other => Error::StepFailed {
            instance_id,
            node_id: node_id.to_string(),
            message: other.to_string(),
        },
    }
}
