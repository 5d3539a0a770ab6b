//! Auto-scaling of agent worker processes.
//!
//! A periodic cycle reads per-type queue depth and fleet health,
//! classifies pressure, and scales the fleet up or down within the
//! configured bounds, subject to a cooldown window:
//!
//! - **AutoScaler**: workload analysis, decision making, lifecycle
//!   execution, health monitoring, and stuck-task recovery
//! - **ProcessSupervisor**: spawn/terminate of worker OS processes with
//!   fallback launch scripts and grace-period termination
//!
//! Spawned workers consume `queue:<type>` and park in-flight tasks in
//! `processing:<type>` on their own; the engine never executes task
//! payloads.

pub mod engine;
pub mod process;

pub use engine::{
    AutoScaler, ScalerStats, ScalingAction, ScalingDecision, TypeWorkload, WorkloadStatus,
};
pub use process::ProcessSupervisor;
