//! Approval gates: configuration, the pure gate rules and the manager that persists them.

mod config;
mod directory;
mod gate;
mod manager;
mod notifier;

pub use config::{
    ApprovalGateConfig, ApproverConfig, ApproverRule, ChainStep, Delegation, EscalationConfig, GateSettings,
    ThresholdConfig,
};
#[cfg(test)]
pub use directory::MockMembershipDirectory;
pub use directory::{MemberProfile, MembershipDirectory, StaticDirectory};
pub use gate::{evaluate_gate, next_chain_approver, GateOutcome, Tally};
pub use manager::{ApprovalManager, EscalationOutcome, GateResolution};
#[cfg(test)]
pub use notifier::MockNotifier;
pub use notifier::{LogNotifier, Notification, Notifier};
