use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::trigger::FieldSpec;

/// Field schema of a business entity type, used by the designer and by `set_field`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub entity_type: String,
    pub label: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

impl EntityDefinition {
    pub fn new(entity_type: &str, label: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            label: label.to_string(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, spec: FieldSpec) -> Self {
        self.fields.insert(name.to_string(), spec);
        self
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}
