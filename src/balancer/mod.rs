//! Workload balancing across agent types.
//!
//! Four independent cycles keep per-type queues fair and well-fitted:
//!
//! - **Routing**: migrates pending tasks to the type whose capability
//!   tiers fit them best, when the combined score clears a threshold
//! - **Cross-type balancing**: evens out large deviations from the mean
//!   total load
//! - **Emergency relief**: drains types over the emergency threshold to
//!   the lightest suitable alternative
//! - **Retry**: requeues failed tasks with boosted priority until their
//!   retry budget runs out, skipping deterministic failures
//!
//! The balancer owns the [`AutoScaler`](crate::scaler::AutoScaler):
//! capacity and placement decisions share one workload picture.

pub mod classify;
pub mod engine;

pub use classify::{
    capability_score, ComplexityTag, TaskAnalysis, TaskClassifier, UrgencyTag,
};
pub use engine::{BalancerStats, WorkloadBalancer};
