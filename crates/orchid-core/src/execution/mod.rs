//! Plan/step definitions, the Step Executor, the Plan Executor, and Kafka
//! emission.

pub mod context;
pub mod emission;
pub mod plan;
pub mod step;
pub mod types;

pub use context::ExecutionContext;
pub use types::{BackoffKind, FanoutEmitMode, PlanDefinition, RetryConfig, Step};
