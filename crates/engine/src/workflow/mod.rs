pub mod context;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod lock;
pub mod state;
pub mod version;

pub use context::WorkflowContext;
pub use engine::{DispatchReport, InstanceState, ScanError, ScanReport, WorkflowEngine};
pub use executor::StepExecutor;
pub use graph::{
    normalize_port, ConditionCheck, DelaySpec, Edge, EdgeDefinition, Graph, GraphDefinition, Node, NodeDefinition,
    NodeKind, NodeType, DEFAULT_PORT,
};
pub use lock::KeyedLocks;
pub use state::StateType;
pub use version::{VersionDiff, VersionManager};
