use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{hours_to_duration, ApprovalGateConfig, ApproverConfig, ApproverRule, ChainStep, Delegation, EscalationConfig, GateSettings};
use super::directory::MembershipDirectory;
use super::gate::{evaluate_gate, next_chain_approver, GateOutcome, Tally};
use super::notifier::{Notification, Notifier};
use crate::metrics::{APPROVALS_RESOLVED_TOTAL, ESCALATIONS_TOTAL};
use crate::registry::Registry;
use crate::store::{
    ApprovalStatus, ApprovalType, Decision, Store, WorkflowApproval, WorkflowApprovalResponse, WorkflowInstance,
};
use crate::workflow::KeyedLocks;
use crate::{Error, MemberId, Result};

const DEFAULT_REASSIGN_HOURS: f64 = 24.0;

/// Result of recording a response.
#[derive(Debug, Clone)]
pub struct GateResolution {
    pub approval: WorkflowApproval,
    pub outcome: GateOutcome,
    /// Port to resume on, set once the gate resolved.
    pub port: Option<String>,
}

/// Result of escalating an overdue gate.
#[derive(Debug, Clone)]
pub struct EscalationOutcome {
    pub approval: WorkflowApproval,
    pub action: &'static str,
    /// `None` when the gate stays pending (reassign).
    pub port: Option<String>,
}

/// Opens, tracks and resolves approval gates. Every mutation of one approval runs under
/// that approval's lock.
pub struct ApprovalManager {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    directory: Arc<dyn MembershipDirectory>,
    notifier: Arc<dyn Notifier>,
    locks: KeyedLocks<Uuid>,
}

impl ApprovalManager {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        directory: Arc<dyn MembershipDirectory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            registry,
            directory,
            notifier,
            locks: KeyedLocks::new(),
        }
    }

    /// Opens the gate for `node_id`, or returns the pending one already open there.
    ///
    /// Callers hold the instance lock, which makes the find-or-create atomic.
    pub async fn open_gate(
        &self,
        instance: &WorkflowInstance,
        node_id: &str,
        config: &ApprovalGateConfig,
        context: &Value,
        execution_log_id: Option<Uuid>,
    ) -> Result<WorkflowApproval> {
        if let Some(existing) = self.store.find_pending_approval(instance.id, node_id).await? {
            debug!("Approval {} already open for instance {} at {}", existing.id, instance.id, node_id);
            return Ok(existing);
        }
        if let Some(resolved) = self.unconsumed_resolution(instance.id, node_id).await? {
            info!(
                "Approval {} at {} already resolved {}; instance {} has not moved on yet",
                resolved.id, node_id, resolved.status, instance.id
            );
            return Ok(resolved);
        }

        let pool = self.resolve_pool(&config.approver, context).await?;
        let required = config.required_count(pool.len());
        let mut approver_config = ApproverConfig::new(config.approver.clone());
        if config.approval_type == ApprovalType::Chain {
            approver_config.current_approver_id = pool.first().copied();
        }

        let now = Utc::now();
        let mut approval = WorkflowApproval {
            id: Uuid::new_v4(),
            instance_id: instance.id,
            node_id: node_id.to_string(),
            execution_log_id,
            approval_type: config.approval_type,
            approver_type: config.approver.approver_type(),
            approver_config: approver_config.to_value(),
            approver_pool: pool,
            required_count: required as i32,
            approved_count: 0,
            rejected_count: 0,
            abstained_count: 0,
            status: ApprovalStatus::Pending,
            gate_config: serde_json::to_value(config.settings())?,
            escalation_config: config.escalation.clone(),
            deadline: config.deadline_from(now),
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };

        let outcome = evaluate_gate(approval.approval_type, &Tally::of(&approval));
        if outcome != GateOutcome::Pending {
            warn!(
                "Approval gate at {} for instance {} resolved on open ({:?}); approver pool has {} members",
                node_id,
                instance.id,
                outcome,
                approval.approver_pool.len()
            );
            resolve(&mut approval, outcome.status(), now);
        }

        self.store.save_approval(&approval).await?;
        info!(
            "Opened {} approval {} for instance {} at {} ({} of {} required)",
            approval.approval_type,
            approval.id,
            instance.id,
            node_id,
            approval.required_count,
            approval.approver_pool.len()
        );
        Ok(approval)
    }

    /// Resolves the approver pool; order is preserved and duplicates dropped.
    pub async fn resolve_pool(&self, rule: &ApproverRule, context: &Value) -> Result<Vec<MemberId>> {
        let members = match rule {
            ApproverRule::Static { member_ids } => member_ids.clone(),
            ApproverRule::Permission { permission } => self.directory.members_with_permission(permission).await?,
            ApproverRule::Role { role } => self.directory.members_with_role(role).await?,
            ApproverRule::Dynamic { resolver, config } => {
                let resolver_impl = self
                    .registry
                    .resolver(resolver)
                    .ok_or_else(|| Error::InvalidDefinition(format!("unknown approver resolver '{}'", resolver)))?;
                resolver_impl.resolve(config, context).await?
            }
        };

        let mut pool = Vec::with_capacity(members.len());
        for member in members {
            if !pool.contains(&member) {
                pool.push(member);
            }
        }
        Ok(pool)
    }

    pub async fn record_response(
        &self,
        approval_id: Uuid,
        member_id: MemberId,
        decision: Decision,
        comment: Option<String>,
        next_approver_id: Option<MemberId>,
    ) -> Result<GateResolution> {
        let _guard = self.locks.lock(&approval_id).await;

        let mut approval = self.pending_approval(approval_id).await?;
        let mut approver_config = ApproverConfig::from_approval(&approval)?;
        if !is_eligible(&approval, &approver_config, member_id) {
            return Err(Error::NotEligible { approval_id, member_id });
        }

        let responses = self.store.list_responses(approval_id).await?;
        if responses.iter().any(|r| r.member_id == member_id) {
            return Err(Error::DuplicateResponse { approval_id, member_id });
        }

        let now = Utc::now();
        match decision {
            Decision::Approve => approval.approved_count += 1,
            Decision::Reject => approval.rejected_count += 1,
            Decision::Abstain | Decision::RequestChanges => approval.abstained_count += 1,
        }

        let outcome = evaluate_gate(approval.approval_type, &Tally::of(&approval));
        if approval.approval_type == ApprovalType::Chain && decision != Decision::Reject {
            let mut responded: Vec<MemberId> = responses.iter().map(|r| r.member_id).collect();
            responded.push(member_id);
            approver_config.approval_chain.push(ChainStep {
                approver_id: member_id,
                responded_at: now,
                next_picked: next_approver_id,
            });
            approver_config.current_approver_id = if outcome == GateOutcome::Pending {
                next_chain_approver(&approval.approver_pool, &responded, next_approver_id)
            } else {
                None
            };
            approval.approver_config = approver_config.to_value();
        }

        if outcome != GateOutcome::Pending {
            resolve(&mut approval, outcome.status(), now);
        }
        approval.updated_at = now;

        let response = WorkflowApprovalResponse {
            id: Uuid::new_v4(),
            approval_id,
            member_id,
            decision,
            comment,
            responded_at: now,
        };
        self.store.record_response(&response, &approval).await?;

        info!(
            "Member {} responded {} to approval {} ({} approved, {} rejected, {:?})",
            member_id, decision, approval_id, approval.approved_count, approval.rejected_count, outcome
        );
        let port = GateSettings::from_approval(&approval).port_for(approval.status);
        Ok(GateResolution { approval, outcome, port })
    }

    /// Hands `from`'s slot to `to` when the gate allows delegation.
    pub async fn delegate(&self, approval_id: Uuid, from: MemberId, to: MemberId) -> Result<WorkflowApproval> {
        let _guard = self.locks.lock(&approval_id).await;

        let mut approval = self.pending_approval(approval_id).await?;
        if !GateSettings::from_approval(&approval).allow_delegation {
            return Err(Error::Validation(format!("approval {} does not allow delegation", approval_id)));
        }
        let mut approver_config = ApproverConfig::from_approval(&approval)?;
        if !is_eligible(&approval, &approver_config, from) {
            return Err(Error::NotEligible {
                approval_id,
                member_id: from,
            });
        }

        let responses = self.store.list_responses(approval_id).await?;
        if responses.iter().any(|r| r.member_id == from) {
            return Err(Error::DuplicateResponse {
                approval_id,
                member_id: from,
            });
        }
        if approval.approver_pool.contains(&to) || responses.iter().any(|r| r.member_id == to) {
            return Err(Error::Validation(format!(
                "member {} is already an approver on {}",
                to, approval_id
            )));
        }

        for member in approval.approver_pool.iter_mut() {
            if *member == from {
                *member = to;
            }
        }
        if approver_config.current_approver_id == Some(from) {
            approver_config.current_approver_id = Some(to);
        }
        let now = Utc::now();
        approver_config.delegations.push(Delegation {
            from,
            to,
            delegated_at: now,
        });
        approval.approver_config = approver_config.to_value();
        approval.updated_at = now;
        self.store.save_approval(&approval).await?;

        info!("Approval {} delegated from {} to {}", approval_id, from, to);
        Ok(approval)
    }

    /// Applies the gate's escalation after its deadline lapsed.
    ///
    /// `context` is the owning instance's evaluation context, used when a reassignment
    /// re-resolves a dynamic pool.
    pub async fn escalate(&self, approval_id: Uuid, context: &Value, now: DateTime<Utc>) -> Result<EscalationOutcome> {
        let _guard = self.locks.lock(&approval_id).await;

        let mut approval = self.pending_approval(approval_id).await?;
        match approval.deadline {
            Some(deadline) if deadline < now => {}
            _ => {
                return Err(Error::Validation(format!("approval {} is not overdue", approval_id)));
            }
        }

        let escalation = match &approval.escalation_config {
            Some(value) => EscalationConfig::decode(value).unwrap_or_else(|e| {
                warn!("Approval {}: {}; expiring", approval_id, e);
                EscalationConfig::Expire
            }),
            None => EscalationConfig::Expire,
        };
        let settings = GateSettings::from_approval(&approval);
        let action = escalation.label();

        match escalation {
            EscalationConfig::AutoApprove => resolve(&mut approval, ApprovalStatus::Approved, now),
            EscalationConfig::AutoReject => resolve(&mut approval, ApprovalStatus::Rejected, now),
            EscalationConfig::Reassign { approver, extend_hours } => {
                let mut approver_config = ApproverConfig::from_approval(&approval)?;
                if let Some(rule) = approver {
                    approval.approver_type = rule.approver_type();
                    approver_config.rule = rule;
                }
                approval.approver_pool = self.resolve_pool(&approver_config.rule, context).await?;
                if approval.approval_type == ApprovalType::Chain {
                    approver_config.current_approver_id = approval.approver_pool.first().copied();
                }
                let hours = extend_hours
                    .or(settings.timeout_hours)
                    .unwrap_or(DEFAULT_REASSIGN_HOURS);
                approval.deadline = Some(now + hours_to_duration(hours));
                approval.escalation_config = None;
                approval.approver_config = approver_config.to_value();
                info!(
                    "Approval {} reassigned to {} members, new deadline {:?}",
                    approval_id,
                    approval.approver_pool.len(),
                    approval.deadline
                );
            }
            EscalationConfig::Notify {
                recipients,
                subject,
                message,
            } => {
                let notification = Notification {
                    recipients,
                    subject: subject.unwrap_or_else(|| "Workflow approval overdue".to_string()),
                    body: message.unwrap_or_else(|| {
                        format!(
                            "Approval {} for instance {} at node '{}' passed its deadline.",
                            approval.id, approval.instance_id, approval.node_id
                        )
                    }),
                    metadata: json!({"approvalId": approval.id, "instanceId": approval.instance_id}),
                };
                if let Err(e) = self.notifier.notify(&notification).await {
                    warn!("Escalation notice for approval {} failed: {}", approval_id, e);
                }
                resolve(&mut approval, ApprovalStatus::Expired, now);
            }
            EscalationConfig::Expire => resolve(&mut approval, ApprovalStatus::Expired, now),
        }

        approval.updated_at = now;
        self.store.save_approval(&approval).await?;
        ESCALATIONS_TOTAL.with_label_values(&[action]).inc();

        let port = settings.port_for(approval.status);
        info!("Escalated approval {} with {} (port {:?})", approval_id, action, port);
        Ok(EscalationOutcome { approval, action, port })
    }

    /// Pending approvals `member_id` may still answer.
    pub async fn pending_for_member(&self, member_id: MemberId) -> Result<Vec<WorkflowApproval>> {
        let mut eligible = Vec::new();
        for approval in self.store.list_pending_approvals().await? {
            let config = match ApproverConfig::from_approval(&approval) {
                Ok(config) => config,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };
            if !is_eligible(&approval, &config, member_id) {
                continue;
            }
            let responses = self.store.list_responses(approval.id).await?;
            if responses.iter().all(|r| r.member_id != member_id) {
                eligible.push(approval);
            }
        }
        Ok(eligible)
    }

    pub async fn approvals_for_instance(&self, instance_id: Uuid) -> Result<Vec<WorkflowApproval>> {
        self.store.list_approvals_for_instance(instance_id).await
    }

    /// Members who can still respond.
    pub async fn eligible_approvers(&self, approval_id: Uuid) -> Result<Vec<MemberId>> {
        let approval = self
            .store
            .get_approval(approval_id)
            .await?
            .ok_or(Error::ApprovalNotFound(approval_id))?;
        if approval.status != ApprovalStatus::Pending {
            return Ok(Vec::new());
        }
        let config = ApproverConfig::from_approval(&approval)?;
        if let (ApprovalType::Chain, Some(current)) = (approval.approval_type, config.current_approver_id) {
            return Ok(vec![current]);
        }
        let responded: Vec<MemberId> = self
            .store
            .list_responses(approval_id)
            .await?
            .iter()
            .map(|r| r.member_id)
            .collect();
        Ok(approval
            .approver_pool
            .iter()
            .copied()
            .filter(|m| !responded.contains(m))
            .collect())
    }

    pub async fn is_resolved(&self, approval_id: Uuid) -> Result<bool> {
        Ok(self
            .store
            .get_approval(approval_id)
            .await?
            .map(|a| a.status != ApprovalStatus::Pending)
            .unwrap_or(false))
    }

    /// Marks every pending approval of an instance cancelled.
    pub async fn cancel_for_instance(&self, instance_id: Uuid) -> Result<usize> {
        let now = Utc::now();
        let mut cancelled = 0;
        for listed in self.store.list_approvals_for_instance(instance_id).await? {
            if listed.status != ApprovalStatus::Pending {
                continue;
            }
            let _guard = self.locks.lock(&listed.id).await;
            let mut approval = match self.pending_approval(listed.id).await {
                Ok(approval) => approval,
                Err(Error::ApprovalNotPending(_)) => continue,
                Err(e) => return Err(e),
            };
            resolve(&mut approval, ApprovalStatus::Cancelled, now);
            approval.updated_at = now;
            self.store.save_approval(&approval).await?;
            cancelled += 1;
        }
        if cancelled > 0 {
            info!("Cancelled {} pending approvals of instance {}", cancelled, instance_id);
        }
        Ok(cancelled)
    }

    /// Cancels the pending gate at one node, if any. Used when an instance leaves an
    /// approval node by another route than the gate's own resolution.
    pub async fn cancel_pending_at(&self, instance_id: Uuid, node_id: &str) -> Result<bool> {
        let Some(pending) = self.store.find_pending_approval(instance_id, node_id).await? else {
            return Ok(false);
        };
        let _guard = self.locks.lock(&pending.id).await;
        let mut approval = match self.pending_approval(pending.id).await {
            Ok(approval) => approval,
            Err(Error::ApprovalNotPending(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let now = Utc::now();
        resolve(&mut approval, ApprovalStatus::Cancelled, now);
        approval.updated_at = now;
        self.store.save_approval(&approval).await?;
        info!("Cancelled approval {} at node {} of instance {}", approval.id, node_id, instance_id);
        Ok(true)
    }

    /// Moves a pending gate to `node_id`. Returns `None` when the gate resolved first.
    pub async fn repoint(&self, approval_id: Uuid, node_id: &str) -> Result<Option<WorkflowApproval>> {
        let _guard = self.locks.lock(&approval_id).await;
        let mut approval = match self.pending_approval(approval_id).await {
            Ok(approval) => approval,
            Err(Error::ApprovalNotPending(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if approval.node_id != node_id {
            debug!("Approval {} moves from {} to {}", approval.id, approval.node_id, node_id);
            approval.node_id = node_id.to_string();
            approval.updated_at = Utc::now();
            self.store.save_approval(&approval).await?;
        }
        Ok(Some(approval))
    }

    /// The newest gate at `node_id` when it resolved and the instance has not left the node
    /// since. A resumption that failed after the decision was recorded leaves one behind.
    pub async fn unconsumed_resolution(&self, instance_id: Uuid, node_id: &str) -> Result<Option<WorkflowApproval>> {
        let latest = self
            .store
            .list_approvals_for_instance(instance_id)
            .await?
            .into_iter()
            .filter(|a| a.node_id == node_id)
            .max_by_key(|a| a.created_at);
        let Some(approval) = latest else {
            return Ok(None);
        };
        if !matches!(
            approval.status,
            ApprovalStatus::Approved | ApprovalStatus::Rejected | ApprovalStatus::Expired
        ) {
            return Ok(None);
        }

        let resolved_at = approval.resolved_at.unwrap_or(approval.created_at);
        let departed = self
            .store
            .list_transition_logs(instance_id)
            .await?
            .iter()
            .any(|log| log.from_state.as_deref() == Some(node_id) && log.to_state != node_id && log.created_at >= resolved_at);
        Ok((!departed).then_some(approval))
    }

    async fn pending_approval(&self, approval_id: Uuid) -> Result<WorkflowApproval> {
        let approval = self
            .store
            .get_approval(approval_id)
            .await?
            .ok_or(Error::ApprovalNotFound(approval_id))?;
        if approval.status != ApprovalStatus::Pending {
            return Err(Error::ApprovalNotPending(approval_id));
        }
        Ok(approval)
    }
}

fn resolve(approval: &mut WorkflowApproval, status: ApprovalStatus, now: DateTime<Utc>) {
    approval.status = status;
    approval.resolved_at = Some(now);
    APPROVALS_RESOLVED_TOTAL.with_label_values(&[&status.to_string()]).inc();
}

/// Chain gates accept only the current approver; every other gate accepts its pool.
fn is_eligible(approval: &WorkflowApproval, config: &ApproverConfig, member_id: MemberId) -> bool {
    if approval.approval_type == ApprovalType::Chain {
        if let Some(current) = config.current_approver_id {
            return current == member_id;
        }
    }
    approval.approver_pool.contains(&member_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{LogNotifier, MockMembershipDirectory, MockNotifier, StaticDirectory};
    use crate::registry::{CorePlugin, MockApproverResolver, Plugin, RegistryBuilder};
    use crate::store::{
        create_store, DatabaseConfig, InstanceStatus, TriggerType, VersionStatus, WorkflowDefinition,
        WorkflowTransitionLog, WorkflowVersion,
    };
    use chrono::Duration;

    async fn store() -> Arc<dyn Store> {
        create_store(&DatabaseConfig::in_memory()).await.unwrap()
    }

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::from_plugins(&[&CorePlugin::new(Arc::new(LogNotifier))]).unwrap())
    }

    fn manager(store: Arc<dyn Store>) -> ApprovalManager {
        ApprovalManager::new(store, registry(), Arc::new(StaticDirectory::default()), Arc::new(LogNotifier))
    }

    async fn instance(store: &Arc<dyn Store>) -> WorkflowInstance {
        let definition = WorkflowDefinition::new("Warrant", &format!("warrant-{}", Uuid::new_v4()), "warrant");
        store.save_definition(&definition).await.unwrap();
        let now = Utc::now();
        let version = WorkflowVersion {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            version_number: 1,
            definition: json!({"nodes": {}, "edges": []}),
            canvas_layout: None,
            status: VersionStatus::Published,
            change_notes: None,
            published_at: Some(now),
            published_by: None,
            created_at: now,
            updated_at: now,
        };
        store.save_version(&version).await.unwrap();
        let instance = WorkflowInstance {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            version_id: version.id,
            entity_type: "warrant".into(),
            entity_id: Some("17".into()),
            status: InstanceStatus::Running,
            current_state_id: Some("approval".into()),
            previous_state_id: None,
            active_nodes: vec!["approval".into()],
            context: json!({}),
            triggered_by: None,
            parent_instance_id: None,
            parent_node_id: None,
            error_message: None,
            started_at: now,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        store.save_instance(&instance).await.unwrap();
        instance
    }

    fn gate(config: Value) -> ApprovalGateConfig {
        ApprovalGateConfig::from_node_config(&config).unwrap()
    }

    #[tokio::test]
    async fn open_gate_is_idempotent() {
        let store = store().await;
        let manager = manager(store.clone());
        let instance = instance(&store).await;
        let config = gate(json!({"approver": {"type": "static", "member_ids": [1, 2, 2, 3]}, "required_count": 2}));

        let first = manager.open_gate(&instance, "approval", &config, &json!({}), None).await.unwrap();
        let second = manager.open_gate(&instance, "approval", &config, &json!({}), None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.approver_pool, vec![1, 2, 3]);
        assert_eq!(first.required_count, 2);
    }

    #[tokio::test]
    async fn two_of_three_in_any_order() {
        for order in [[1, 2], [3, 1], [2, 3]] {
            let store = store().await;
            let manager = manager(store.clone());
            let config = gate(json!({"approver": {"type": "static", "member_ids": [1, 2, 3]}, "required_count": 2}));
            let approval = manager.open_gate(&instance(&store).await, "approval", &config, &json!({}), None).await.unwrap();

            let first = manager
                .record_response(approval.id, order[0], Decision::Approve, None, None)
                .await
                .unwrap();
            assert_eq!(first.outcome, GateOutcome::Pending);
            assert_eq!(first.port, None);

            let second = manager
                .record_response(approval.id, order[1], Decision::Approve, None, None)
                .await
                .unwrap();
            assert_eq!(second.outcome, GateOutcome::Satisfied);
            assert_eq!(second.port.as_deref(), Some("approved"));
            assert!(manager.is_resolved(approval.id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn duplicates_and_strangers_are_refused() {
        let store = store().await;
        let manager = manager(store.clone());
        let config = gate(json!({"approver": {"type": "static", "member_ids": [1, 2, 3]}, "required_count": 2}));
        let approval = manager.open_gate(&instance(&store).await, "approval", &config, &json!({}), None).await.unwrap();

        manager
            .record_response(approval.id, 1, Decision::Reject, Some("no".into()), None)
            .await
            .unwrap();
        let err = manager
            .record_response(approval.id, 1, Decision::Approve, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateResponse { member_id: 1, .. }));

        let err = manager
            .record_response(approval.id, 99, Decision::Approve, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotEligible { member_id: 99, .. }));

        let stored = store.get_approval(approval.id).await.unwrap().unwrap();
        assert_eq!((stored.approved_count, stored.rejected_count), (0, 1));
        assert_eq!(manager.eligible_approvers(approval.id).await.unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn chain_moves_to_the_picked_approver_and_denies_on_reject() {
        let store = store().await;
        let manager = manager(store.clone());
        let config = gate(json!({
            "approval_type": "chain",
            "approver": {"type": "static", "member_ids": [10, 20, 30]},
            "required_count": 2,
        }));
        let approval = manager.open_gate(&instance(&store).await, "approval", &config, &json!({}), None).await.unwrap();
        assert_eq!(manager.eligible_approvers(approval.id).await.unwrap(), vec![10]);

        let err = manager
            .record_response(approval.id, 20, Decision::Approve, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotEligible { .. }));

        let step = manager
            .record_response(approval.id, 10, Decision::Approve, None, Some(30))
            .await
            .unwrap();
        assert_eq!(step.outcome, GateOutcome::Pending);
        assert_eq!(manager.eligible_approvers(approval.id).await.unwrap(), vec![30]);
        let audit = ApproverConfig::from_approval(&step.approval).unwrap();
        assert_eq!(audit.approval_chain.len(), 1);

        let denied = manager
            .record_response(approval.id, 30, Decision::Reject, None, None)
            .await
            .unwrap();
        assert_eq!(denied.outcome, GateOutcome::Denied);
        assert_eq!(denied.port.as_deref(), Some("rejected"));
    }

    #[tokio::test]
    async fn chain_moves_on_when_the_pick_already_answered() {
        let store = store().await;
        let manager = manager(store.clone());
        let config = gate(json!({
            "approval_type": "chain",
            "approver": {"type": "static", "member_ids": [10, 20, 30]},
            "required_count": 3,
        }));
        let approval = manager.open_gate(&instance(&store).await, "approval", &config, &json!({}), None).await.unwrap();

        manager
            .record_response(approval.id, 10, Decision::Approve, None, Some(20))
            .await
            .unwrap();
        let step = manager
            .record_response(approval.id, 20, Decision::Approve, None, Some(10))
            .await
            .unwrap();
        assert_eq!(step.outcome, GateOutcome::Pending);
        assert_eq!(manager.eligible_approvers(approval.id).await.unwrap(), vec![30]);

        let done = manager
            .record_response(approval.id, 30, Decision::Approve, None, None)
            .await
            .unwrap();
        assert_eq!(done.outcome, GateOutcome::Satisfied);
    }

    #[tokio::test]
    async fn delegation_swaps_the_pool_member() {
        let store = store().await;
        let manager = manager(store.clone());
        let config = gate(json!({
            "approver": {"type": "static", "member_ids": [1, 2]},
            "allow_delegation": true,
        }));
        let approval = manager.open_gate(&instance(&store).await, "approval", &config, &json!({}), None).await.unwrap();

        let delegated = manager.delegate(approval.id, 2, 5).await.unwrap();
        assert_eq!(delegated.approver_pool, vec![1, 5]);
        assert!(manager.delegate(approval.id, 2, 6).await.is_err());

        let resolved = manager
            .record_response(approval.id, 5, Decision::Approve, None, None)
            .await
            .unwrap();
        assert_eq!(resolved.outcome, GateOutcome::Satisfied);
        assert!(matches!(
            manager.delegate(approval.id, 1, 7).await.unwrap_err(),
            Error::ApprovalNotPending(_)
        ));
    }

    #[tokio::test]
    async fn permission_pools_come_from_the_directory() {
        let mut directory = MockMembershipDirectory::new();
        directory
            .expect_members_with_permission()
            .withf(|p: &str| p == "Warrants.approve")
            .returning(|_| Ok(vec![4, 5]));
        let store = store().await;
        let manager = ApprovalManager::new(store.clone(), registry(), Arc::new(directory), Arc::new(LogNotifier));

        let config = gate(json!({"approver": {"type": "permission", "permission": "Warrants.approve"}}));
        let approval = manager.open_gate(&instance(&store).await, "approval", &config, &json!({}), None).await.unwrap();
        assert_eq!(approval.approver_pool, vec![4, 5]);
        assert_eq!(manager.pending_for_member(5).await.unwrap().len(), 1);
        assert!(manager.pending_for_member(6).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dynamic_pools_use_registered_resolvers() {
        struct Offices;
        impl Plugin for Offices {
            fn name(&self) -> &str {
                "offices"
            }
            fn register(&self, registry: &mut RegistryBuilder) -> Result<()> {
                let mut resolver = MockApproverResolver::new();
                resolver
                    .expect_resolve()
                    .returning(|config: &Value, _| Ok(vec![config["officer"].as_i64().unwrap_or_default()]));
                registry.resolver("reports_to", Arc::new(resolver))?;
                Ok(())
            }
        }
        let registry = Arc::new(Registry::from_plugins(&[&Offices]).unwrap());
        let store = store().await;
        let manager = ApprovalManager::new(
            store.clone(),
            registry,
            Arc::new(StaticDirectory::default()),
            Arc::new(LogNotifier),
        );

        let config = gate(json!({"approver": {"type": "dynamic", "resolver": "reports_to", "config": {"officer": 8}}}));
        let approval = manager.open_gate(&instance(&store).await, "approval", &config, &json!({}), None).await.unwrap();
        assert_eq!(approval.approver_pool, vec![8]);

        let config = gate(json!({"approver": {"type": "dynamic", "resolver": "missing"}}));
        let other = instance(&store).await;
        assert!(matches!(
            manager.open_gate(&other, "approval", &config, &json!({}), None).await.unwrap_err(),
            Error::InvalidDefinition(_)
        ));
    }

    #[tokio::test]
    async fn escalations_follow_their_action() {
        let store = store().await;
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(1).returning(|_| Ok(()));
        let manager = ApprovalManager::new(
            store.clone(),
            registry(),
            Arc::new(StaticDirectory::default()),
            Arc::new(notifier),
        );
        let later = Utc::now() + Duration::hours(2);

        let cases = [
            (json!({"action": "auto_approve"}), ApprovalStatus::Approved, Some("approved")),
            (json!({"action": "auto_reject"}), ApprovalStatus::Rejected, Some("rejected")),
            (json!({"action": "notify", "recipients": ["seneschal@example.org"]}), ApprovalStatus::Expired, Some("expired")),
            (json!({"action": "dance"}), ApprovalStatus::Expired, Some("expired")),
            (json!({"action": "reassign", "approver": {"type": "static", "member_ids": [9]}, "extend_hours": 48}), ApprovalStatus::Pending, None),
        ];

        for (escalation, status, port) in cases {
            let config = gate(json!({
                "approver": {"type": "static", "member_ids": [1]},
                "timeout_hours": 1,
                "escalation": escalation,
            }));
            let approval = manager.open_gate(&instance(&store).await, "approval", &config, &json!({}), None).await.unwrap();

            let outcome = manager.escalate(approval.id, &json!({}), later).await.unwrap();
            assert_eq!(outcome.approval.status, status);
            assert_eq!(outcome.port.as_deref(), port);

            if status == ApprovalStatus::Pending {
                assert_eq!(outcome.approval.approver_pool, vec![9]);
                assert!(outcome.approval.deadline.unwrap() > later);
                assert!(outcome.approval.escalation_config.is_none());
                let expired = manager
                    .escalate(approval.id, &json!({}), later + Duration::hours(49))
                    .await
                    .unwrap();
                assert_eq!(expired.approval.status, ApprovalStatus::Expired);
            }
        }
    }

    #[tokio::test]
    async fn cannot_escalate_before_the_deadline() {
        let store = store().await;
        let manager = manager(store.clone());
        let config = gate(json!({"approver": {"type": "static", "member_ids": [1]}, "timeout_hours": 1}));
        let approval = manager.open_gate(&instance(&store).await, "approval", &config, &json!({}), None).await.unwrap();
        assert!(matches!(
            manager.escalate(approval.id, &json!({}), Utc::now()).await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test]
    async fn cancel_for_instance_closes_pending_gates() {
        let store = store().await;
        let manager = manager(store.clone());
        let instance = instance(&store).await;
        let config = gate(json!({"approver": {"type": "static", "member_ids": [1]}}));
        let approval = manager.open_gate(&instance, "approval", &config, &json!({}), None).await.unwrap();

        assert_eq!(manager.cancel_for_instance(instance.id).await.unwrap(), 1);
        let approvals = manager.approvals_for_instance(instance.id).await.unwrap();
        assert_eq!(approvals[0].status, ApprovalStatus::Cancelled);
        assert!(matches!(
            manager.record_response(approval.id, 1, Decision::Approve, None, None).await.unwrap_err(),
            Error::ApprovalNotPending(_)
        ));
    }

    #[tokio::test]
    async fn empty_pools_deny_on_open() {
        let store = store().await;
        let manager = manager(store.clone());
        let config = gate(json!({"approver": {"type": "role", "role": "Nobody"}}));
        let approval = manager.open_gate(&instance(&store).await, "approval", &config, &json!({}), None).await.unwrap();
        assert_eq!(approval.status, ApprovalStatus::Rejected);
    }

    #[tokio::test]
    async fn resolved_gate_is_reused_until_the_instance_leaves_the_node() {
        let store = store().await;
        let manager = manager(store.clone());
        let instance = instance(&store).await;
        let config = gate(json!({"approval_type": "any_one", "approver": {"type": "static", "member_ids": [1]}}));

        let first = manager.open_gate(&instance, "approval", &config, &json!({}), None).await.unwrap();
        manager.record_response(first.id, 1, Decision::Approve, None, None).await.unwrap();

        let reopened = manager.open_gate(&instance, "approval", &config, &json!({}), None).await.unwrap();
        assert_eq!(reopened.id, first.id);
        assert_eq!(reopened.status, ApprovalStatus::Approved);
        assert_eq!(reopened.approved_count, 1);

        store
            .append_transition_log(&WorkflowTransitionLog {
                id: Uuid::new_v4(),
                instance_id: instance.id,
                from_state: Some("approval".into()),
                to_state: "done".into(),
                port: Some("approved".into()),
                trigger_type: TriggerType::Manual,
                triggered_by: Some(1),
                context_snapshot: json!({}),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(manager.unconsumed_resolution(instance.id, "approval").await.unwrap().is_none());
        let fresh = manager.open_gate(&instance, "approval", &config, &json!({}), None).await.unwrap();
        assert_ne!(fresh.id, first.id);
        assert_eq!(fresh.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn repoint_moves_only_pending_gates() {
        let store = store().await;
        let manager = manager(store.clone());
        let instance = instance(&store).await;
        let config = gate(json!({"approval_type": "any_one", "approver": {"type": "static", "member_ids": [1]}}));
        let approval = manager.open_gate(&instance, "approval", &config, &json!({}), None).await.unwrap();

        let moved = manager.repoint(approval.id, "review").await.unwrap().unwrap();
        assert_eq!(moved.node_id, "review");

        let resolution = manager.record_response(approval.id, 1, Decision::Approve, None, None).await.unwrap();
        assert_eq!(resolution.approval.node_id, "review");
        assert!(manager.repoint(approval.id, "approval").await.unwrap().is_none());
        let stored = store.get_approval(approval.id).await.unwrap().unwrap();
        assert_eq!(stored.node_id, "review");
        assert_eq!(stored.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn cancelling_never_overwrites_a_decision_recorded_first() {
        let store = store().await;
        let manager = manager(store.clone());
        let instance = instance(&store).await;
        let config = gate(json!({"approval_type": "any_one", "approver": {"type": "static", "member_ids": [1]}}));
        let approval = manager.open_gate(&instance, "approval", &config, &json!({}), None).await.unwrap();

        let (response, cancelled) = tokio::join!(
            manager.record_response(approval.id, 1, Decision::Approve, None, None),
            manager.cancel_for_instance(instance.id),
        );
        let stored = store.get_approval(approval.id).await.unwrap().unwrap();
        match response {
            Ok(_) => {
                assert_eq!(cancelled.unwrap(), 0);
                assert_eq!(stored.status, ApprovalStatus::Approved);
            }
            Err(e) => {
                assert!(matches!(e, Error::ApprovalNotPending(_)));
                assert_eq!(cancelled.unwrap(), 1);
                assert_eq!(stored.status, ApprovalStatus::Cancelled);
            }
        }
    }
}
