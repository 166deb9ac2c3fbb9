//! Configuration types and loading for flowd

mod loader;
mod value;
mod workflow;

pub use loader::{
    EngineConfig, ExecutorConfig, LoggingConfig, OperatorsConfig, QueueBackend, QueueConfig,
    StoreBackend, StoreConfig, TriggerConfig, load_workflow,
};
pub use value::{ConfigError, ConfigMap, ConfigValue};
pub use workflow::{RetryPolicy, TaskDefinition, WorkflowDefinition};
