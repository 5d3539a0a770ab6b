//! Adaptive task scheduler.
//!
//! Scores tasks for complexity, predicts completion times from learned
//! history, and places tasks in per-agent priority queues:
//!
//! - **SchedulingModel**: learned per-bucket completion times and agent
//!   weights, updated by exponential moving average and snapshotted to
//!   the store
//! - **TaskScheduler**: complexity scoring, agent selection, placement,
//!   completion feedback, and the periodic workload rebalance pass
//!
//! # Architecture
//!
//! ```text
//!      ┌────────────┐   schedule_task    ┌─────────────────────┐
//!      │  Submitter │ ─────────────────▶ │   TaskScheduler     │
//!      └────────────┘                    │ score → predict →   │
//!                                        │ select → enqueue    │
//!                                        └─────────┬───────────┘
//!                                                  │
//!                               queue:<agent>:p:<priority> (store)
//!                                                  │
//!                                        ┌─────────▼───────────┐
//!                                        │   Worker agents     │
//!                                        └─────────────────────┘
//! ```
//!
//! Completion reports flow back through `update_task_completion`, which
//! feeds the model so future predictions track observed behavior.

pub mod engine;
pub mod model;

pub use engine::{SchedulerStats, TaskScheduler};
pub use model::{ModelWeights, SchedulingModel};
