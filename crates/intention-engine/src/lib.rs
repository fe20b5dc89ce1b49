//! Saga execution engine for multi-step tool plans.
//!
//! An [`Orchestrator`] runs a [`Plan`] (a DAG of tool calls produced by an
//! upstream [`Planner`]) against a [`ToolExecutor`], with batch
//! parallelism, confirmation gating, self-repair, compensation of completed
//! side effects, circuit breakers, a cost guard and checkpoint/resume with
//! drift detection.

pub mod breaker;
pub mod checkpoint;
pub mod compensation;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod idempotency;
pub mod plan;
pub mod planner;
pub mod repair;
pub mod resolver;
pub mod state;
pub mod stateful;
pub mod telemetry;
pub mod testing;
pub mod tools;

pub use config::EngineConfig;
pub use coordinator::{ExecutionRequest, ExecutionResult, Orchestrator};
pub use error::{EngineError, ErrorCode, StepError};
pub use plan::{ParamValue, Plan, PlanStep};
pub use planner::Planner;
pub use state::{ExecutionState, ExecutionStatus, StepStatus};
pub use tools::{ToolExecutor, ToolRegistry};
