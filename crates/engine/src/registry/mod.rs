//! Vocabulary registries for workflow graphs.
//!
//! Plugins register triggers, actions, conditions, entity schemas and approver resolvers
//! into a [`RegistryBuilder`] once at startup. The resulting [`Registry`] is immutable and
//! shared by reference with the engine, approval manager and graph validation.

mod action;
mod condition;
mod core_plugin;
mod entity;
mod resolver;
mod trigger;

pub use action::{Action, ActionResult};
pub use condition::Condition;
pub use core_plugin::CorePlugin;
pub use entity::EntityDefinition;
#[cfg(test)]
pub use resolver::MockApproverResolver;
pub use resolver::ApproverResolver;
pub use trigger::{FieldSpec, FieldType, TriggerDefinition};

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::{Error, Result};

/// A bundle of registrations contributed by one module.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn register(&self, registry: &mut RegistryBuilder) -> Result<()>;
}

#[derive(Default)]
pub struct RegistryBuilder {
    current_plugin: Option<String>,
    plugins: Vec<String>,
    triggers: BTreeMap<String, TriggerDefinition>,
    actions: BTreeMap<String, Arc<dyn Action>>,
    conditions: BTreeMap<String, Arc<dyn Condition>>,
    entities: BTreeMap<String, EntityDefinition>,
    resolvers: BTreeMap<String, Arc<dyn ApproverResolver>>,
}

fn duplicate(kind: &str, key: &str, plugin: &Option<String>) -> Error {
    Error::Config(format!(
        "{} '{}' is already registered (while loading plugin {})",
        kind,
        key,
        plugin.as_deref().unwrap_or("<none>")
    ))
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plugin(&mut self, plugin: &dyn Plugin) -> Result<&mut Self> {
        debug!("Registering workflow plugin: {}", plugin.name());
        self.current_plugin = Some(plugin.name().to_string());
        plugin.register(self)?;
        self.plugins.push(plugin.name().to_string());
        self.current_plugin = None;
        Ok(self)
    }

    pub fn trigger(&mut self, trigger: TriggerDefinition) -> Result<&mut Self> {
        if self.triggers.contains_key(&trigger.event) {
            return Err(duplicate("Trigger", &trigger.event, &self.current_plugin));
        }
        self.triggers.insert(trigger.event.clone(), trigger);
        Ok(self)
    }

    pub fn action(&mut self, action: Arc<dyn Action>) -> Result<&mut Self> {
        let name = action.name().to_string();
        if self.actions.contains_key(&name) {
            return Err(duplicate("Action", &name, &self.current_plugin));
        }
        self.actions.insert(name, action);
        Ok(self)
    }

    pub fn condition(&mut self, condition: Arc<dyn Condition>) -> Result<&mut Self> {
        let name = condition.name().to_string();
        if self.conditions.contains_key(&name) {
            return Err(duplicate("Condition", &name, &self.current_plugin));
        }
        self.conditions.insert(name, condition);
        Ok(self)
    }

    pub fn entity(&mut self, entity: EntityDefinition) -> Result<&mut Self> {
        if self.entities.contains_key(&entity.entity_type) {
            return Err(duplicate("Entity", &entity.entity_type, &self.current_plugin));
        }
        self.entities.insert(entity.entity_type.clone(), entity);
        Ok(self)
    }

    pub fn resolver(&mut self, key: &str, resolver: Arc<dyn ApproverResolver>) -> Result<&mut Self> {
        if self.resolvers.contains_key(key) {
            return Err(duplicate("Approver resolver", key, &self.current_plugin));
        }
        self.resolvers.insert(key.to_string(), resolver);
        Ok(self)
    }

    pub fn build(self) -> Registry {
        Registry {
            plugins: self.plugins,
            triggers: self.triggers,
            actions: self.actions,
            conditions: self.conditions,
            entities: self.entities,
            resolvers: self.resolvers,
        }
    }
}

pub struct Registry {
    plugins: Vec<String>,
    triggers: BTreeMap<String, TriggerDefinition>,
    actions: BTreeMap<String, Arc<dyn Action>>,
    conditions: BTreeMap<String, Arc<dyn Condition>>,
    entities: BTreeMap<String, EntityDefinition>,
    resolvers: BTreeMap<String, Arc<dyn ApproverResolver>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Builds a registry from plugins, in order.
    pub fn from_plugins(plugins: &[&dyn Plugin]) -> Result<Self> {
        let mut builder = RegistryBuilder::new();
        for plugin in plugins {
            builder.plugin(*plugin)?;
        }
        Ok(builder.build())
    }

    pub fn plugins(&self) -> &[String] {
        &self.plugins
    }

    pub fn trigger(&self, event: &str) -> Option<&TriggerDefinition> {
        self.triggers.get(event)
    }

    pub fn action(&self, name: &str) -> Option<&Arc<dyn Action>> {
        self.actions.get(name)
    }

    pub fn condition(&self, name: &str) -> Option<&Arc<dyn Condition>> {
        self.conditions.get(name)
    }

    pub fn entity(&self, entity_type: &str) -> Option<&EntityDefinition> {
        self.entities.get(entity_type)
    }

    pub fn resolver(&self, key: &str) -> Option<&Arc<dyn ApproverResolver>> {
        self.resolvers.get(key)
    }

    /// Everything a designer needs to build graphs against this registry.
    pub fn describe(&self) -> Value {
        json!({
            "plugins": self.plugins,
            "triggers": self.triggers.values().collect::<Vec<_>>(),
            "actions": self.actions.values().map(|a| json!({
                "name": a.name(),
                "description": a.description(),
                "isAsync": a.is_async(),
                "inputSchema": a.input_schema(),
            })).collect::<Vec<_>>(),
            "conditions": self.conditions.values().map(|c| json!({
                "name": c.name(),
                "description": c.description(),
                "paramsSchema": c.params_schema(),
            })).collect::<Vec<_>>(),
            "entities": self.entities.values().collect::<Vec<_>>(),
            "resolvers": self.resolvers.keys().collect::<Vec<_>>(),
        })
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("plugins", &self.plugins)
            .field("triggers", &self.triggers.keys().collect::<Vec<_>>())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("conditions", &self.conditions.keys().collect::<Vec<_>>())
            .field("entities", &self.entities.keys().collect::<Vec<_>>())
            .field("resolvers", &self.resolvers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::LogNotifier;

    struct Officers;

    impl Plugin for Officers {
        fn name(&self) -> &str {
            "officers"
        }

        fn register(&self, registry: &mut RegistryBuilder) -> Result<()> {
            registry
                .trigger(
                    TriggerDefinition::new("Officers.HireRequested", "Hire requested")
                        .with_field("officeId", FieldSpec::required(FieldType::Integer)),
                )?
                .entity(
                    EntityDefinition::new("officer", "Officer")
                        .with_field("status", FieldSpec::optional(FieldType::String)),
                )?
                .resolver("office_reports_to", Arc::new(MockApproverResolver::new()))?;
            Ok(())
        }
    }

    #[test]
    fn plugins_contribute_vocabulary() {
        let core = CorePlugin::new(Arc::new(LogNotifier));
        let registry = Registry::from_plugins(&[&core, &Officers]).unwrap();

        assert_eq!(registry.plugins(), &["core".to_string(), "officers".to_string()]);
        assert!(registry.trigger("Officers.HireRequested").is_some());
        assert!(registry.action("set_context").is_some());
        assert!(registry.condition("field").is_some());
        assert!(registry.resolver("office_reports_to").is_some());
        assert!(registry.entity("officer").unwrap().has_field("status"));

        let description = registry.describe();
        assert!(description["actions"].as_array().unwrap().len() >= 5);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let err = Registry::from_plugins(&[&Officers, &Officers]).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("Officers.HireRequested")));
    }
}
