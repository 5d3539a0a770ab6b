//! agentpool: adaptive task orchestration for heterogeneous agent pools.
//!
//! This library provides four coupled control loops over a shared redis
//! store: an adaptive scheduler, an auto-scaler, a priority manager, and
//! a workload balancer.

// Core modules
pub mod balancer;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod priority;
pub mod registry;
pub mod runtime;
pub mod scaler;
pub mod scheduler;
pub mod store;
pub mod task;

// Re-export commonly used error types
pub use error::{BalanceError, PriorityError, ScalingError, ScheduleError, StoreError};
pub use runtime::{Orchestrator, RuntimeError};
