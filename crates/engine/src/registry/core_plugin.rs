use std::sync::Arc;

use super::{Plugin, RegistryBuilder};
use crate::actions::{SendEmailAction, SetContextAction, SetFieldAction, SetVariableAction, WebhookAction};
use crate::approval::Notifier;
use crate::conditions::{
    ApprovalGateCondition, FieldCondition, OwnershipCondition, PermissionCondition, RoleCondition,
    TimeCondition, WorkflowContextCondition,
};
use crate::Result;

/// Actions and conditions every deployment gets.
pub struct CorePlugin {
    notifier: Arc<dyn Notifier>,
}

impl CorePlugin {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

impl Plugin for CorePlugin {
    fn name(&self) -> &str {
        "core"
    }

    fn register(&self, registry: &mut RegistryBuilder) -> Result<()> {
        registry
            .action(Arc::new(SetContextAction))?
            .action(Arc::new(SetVariableAction))?
            .action(Arc::new(SetFieldAction))?
            .action(Arc::new(SendEmailAction::new(self.notifier.clone())))?
            .action(Arc::new(WebhookAction::new()))?;

        registry
            .condition(Arc::new(FieldCondition))?
            .condition(Arc::new(OwnershipCondition))?
            .condition(Arc::new(PermissionCondition))?
            .condition(Arc::new(RoleCondition))?
            .condition(Arc::new(ApprovalGateCondition))?
            .condition(Arc::new(TimeCondition))?
            .condition(Arc::new(WorkflowContextCondition))?;
        Ok(())
    }
}
