//! Central error types for the orchestration engine.
//!
//! Each control loop has its own error enum; store and serialization
//! failures convert into them via `#[from]` so call sites can use `?`.

use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::store::StoreError;

/// Errors raised by the task scheduler.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// No registered agent can accept the task right now.
    #[error("No available agent for task {task_id}: {reason}")]
    NoAvailableAgent { task_id: String, reason: String },

    /// An operation referenced an agent the registry does not know.
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the auto-scaler and process supervisor.
#[derive(Debug, Error)]
pub enum ScalingError {
    /// Both the preferred and fallback launch scripts failed.
    #[error("Failed to spawn {agent_type} agent: {reason}")]
    SpawnFailure { agent_type: String, reason: String },

    /// An agent process could not be stopped cleanly.
    #[error("Failed to terminate agent {agent_id}: {reason}")]
    TerminationFailure { agent_id: String, reason: String },

    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the workload balancer.
#[derive(Debug, Error)]
pub enum BalanceError {
    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A scaling operation issued on behalf of the balancer failed.
    #[error("Scaling error: {0}")]
    Scaling(#[from] ScalingError),

    /// A classification pattern failed to compile.
    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

/// Errors raised by the priority manager.
#[derive(Debug, Error)]
pub enum PriorityError {
    /// The referenced task is not tracked.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
