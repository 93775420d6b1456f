//! Gate satisfaction rules. Pure functions over counts, no storage.

use serde::Serialize;

use crate::store::{ApprovalStatus, ApprovalType, WorkflowApproval};
use crate::MemberId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateOutcome {
    Pending,
    Satisfied,
    Denied,
}

impl GateOutcome {
    pub fn status(&self) -> ApprovalStatus {
        match self {
            GateOutcome::Pending => ApprovalStatus::Pending,
            GateOutcome::Satisfied => ApprovalStatus::Approved,
            GateOutcome::Denied => ApprovalStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub pool_size: usize,
    pub required: usize,
    pub approved: usize,
    pub rejected: usize,
    /// Abstentions and change requests: the member has answered without approving.
    pub abstained: usize,
}

impl Tally {
    pub fn of(approval: &WorkflowApproval) -> Self {
        Self {
            pool_size: approval.approver_pool.len(),
            required: approval.required_count.max(0) as usize,
            approved: approval.approved_count.max(0) as usize,
            rejected: approval.rejected_count.max(0) as usize,
            abstained: approval.abstained_count.max(0) as usize,
        }
    }

    /// Approvals still obtainable if every silent approver approves.
    fn reachable(&self) -> usize {
        self.pool_size.saturating_sub(self.rejected + self.abstained)
    }
}

pub fn evaluate_gate(approval_type: ApprovalType, tally: &Tally) -> GateOutcome {
    match approval_type {
        ApprovalType::Threshold => {
            if tally.approved >= tally.required {
                GateOutcome::Satisfied
            } else if tally.reachable() < tally.required {
                GateOutcome::Denied
            } else {
                GateOutcome::Pending
            }
        }
        ApprovalType::Unanimous => {
            if tally.rejected > 0 || tally.reachable() < tally.pool_size || tally.pool_size == 0 {
                GateOutcome::Denied
            } else if tally.approved >= tally.pool_size {
                GateOutcome::Satisfied
            } else {
                GateOutcome::Pending
            }
        }
        ApprovalType::AnyOne => {
            if tally.approved > 0 {
                GateOutcome::Satisfied
            } else if tally.rejected + tally.abstained >= tally.pool_size {
                GateOutcome::Denied
            } else {
                GateOutcome::Pending
            }
        }
        ApprovalType::Chain => {
            if tally.rejected > 0 {
                GateOutcome::Denied
            } else if tally.approved >= tally.required {
                GateOutcome::Satisfied
            } else if tally.reachable() < tally.required {
                GateOutcome::Denied
            } else {
                GateOutcome::Pending
            }
        }
    }
}

/// Next approver of a chain: the responder's pick, otherwise the first pool member who
/// has not answered yet. A pick who already answered is ignored.
pub fn next_chain_approver(
    pool: &[MemberId],
    responded: &[MemberId],
    picked: Option<MemberId>,
) -> Option<MemberId> {
    picked
        .filter(|member| !responded.contains(member))
        .or_else(|| pool.iter().copied().find(|member| !responded.contains(member)))
}
