use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted classification of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateType {
    Initial,
    Intermediate,
    Approval,
    Terminal,
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateType::Initial => write!(f, "initial"),
            StateType::Intermediate => write!(f, "intermediate"),
            StateType::Approval => write!(f, "approval"),
            StateType::Terminal => write!(f, "terminal"),
        }
    }
}

impl From<&str> for StateType {
    fn from(s: &str) -> Self {
        match s {
            "initial" => StateType::Initial,
            "approval" => StateType::Approval,
            "terminal" => StateType::Terminal,
            _ => StateType::Intermediate,
        }
    }
}
