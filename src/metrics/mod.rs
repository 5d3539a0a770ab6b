//! Prometheus metrics for the orchestration engine.
//!
//! All metrics live in `OnceLock` statics registered once at startup via
//! [`init_metrics`]. Recording helpers are no-ops until initialization so
//! library consumers and tests never have to set up a registry.
//!
//! # Example
//!
//! ```ignore
//! use agentpool::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... control loops record as they run ...
//! let text = export_metrics();
//! ```

use prometheus::{
    CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

use crate::task::Priority;

/// Global Prometheus registry for all agentpool metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks placed by the scheduler, labeled by agent type and priority.
pub static TASKS_SCHEDULED: OnceLock<CounterVec> = OnceLock::new();

/// Completion reports processed, labeled by task type and outcome.
pub static TASKS_COMPLETED: OnceLock<CounterVec> = OnceLock::new();

/// Pending + processing depth per agent type.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Registered agents per type.
pub static ACTIVE_AGENTS: OnceLock<GaugeVec> = OnceLock::new();

/// Healthy agents per type.
pub static HEALTHY_AGENTS: OnceLock<GaugeVec> = OnceLock::new();

/// Scaling actions executed, labeled by action and agent type.
pub static SCALING_ACTIONS: OnceLock<CounterVec> = OnceLock::new();

/// Priority escalations applied, labeled by rule.
pub static ESCALATIONS: OnceLock<CounterVec> = OnceLock::new();

/// Queue-to-queue task migrations, labeled by cause.
pub static MIGRATIONS: OnceLock<CounterVec> = OnceLock::new();

/// Stuck tasks moved back from processing to pending.
pub static STUCK_RECOVERIES: OnceLock<CounterVec> = OnceLock::new();

/// Relative prediction error |predicted - actual| / actual.
pub static PREDICTION_ERROR: OnceLock<Histogram> = OnceLock::new();

/// Agent spawn failures, labeled by agent type.
pub static SPAWN_FAILURES: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at application startup. Calling twice returns an error from
/// the second registration attempt.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_scheduled = CounterVec::new(
        Opts::new("agentpool_tasks_scheduled_total", "Tasks placed by the scheduler"),
        &["agent_type", "priority"],
    )?;

    let tasks_completed = CounterVec::new(
        Opts::new("agentpool_tasks_completed_total", "Completion reports processed"),
        &["task_type", "outcome"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("agentpool_queue_depth", "Pending plus processing depth"),
        &["agent_type"],
    )?;

    let active_agents = GaugeVec::new(
        Opts::new("agentpool_active_agents", "Registered agents"),
        &["agent_type"],
    )?;

    let healthy_agents = GaugeVec::new(
        Opts::new("agentpool_healthy_agents", "Healthy agents"),
        &["agent_type"],
    )?;

    let scaling_actions = CounterVec::new(
        Opts::new("agentpool_scaling_actions_total", "Scaling actions executed"),
        &["action", "agent_type"],
    )?;

    let escalations = CounterVec::new(
        Opts::new("agentpool_escalations_total", "Priority escalations applied"),
        &["rule"],
    )?;

    let migrations = CounterVec::new(
        Opts::new("agentpool_migrations_total", "Queue-to-queue task migrations"),
        &["cause"],
    )?;

    let stuck_recoveries = CounterVec::new(
        Opts::new("agentpool_stuck_recoveries_total", "Stuck tasks requeued"),
        &["agent_type"],
    )?;

    let prediction_error = Histogram::with_opts(
        HistogramOpts::new(
            "agentpool_prediction_error_ratio",
            "Relative completion-time prediction error",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]),
    )?;

    let spawn_failures = CounterVec::new(
        Opts::new("agentpool_spawn_failures_total", "Agent spawn failures"),
        &["agent_type"],
    )?;

    registry.register(Box::new(tasks_scheduled.clone()))?;
    registry.register(Box::new(tasks_completed.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_agents.clone()))?;
    registry.register(Box::new(healthy_agents.clone()))?;
    registry.register(Box::new(scaling_actions.clone()))?;
    registry.register(Box::new(escalations.clone()))?;
    registry.register(Box::new(migrations.clone()))?;
    registry.register(Box::new(stuck_recoveries.clone()))?;
    registry.register(Box::new(prediction_error.clone()))?;
    registry.register(Box::new(spawn_failures.clone()))?;

    let _ = TASKS_SCHEDULED.set(tasks_scheduled);
    let _ = TASKS_COMPLETED.set(tasks_completed);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_AGENTS.set(active_agents);
    let _ = HEALTHY_AGENTS.set(healthy_agents);
    let _ = SCALING_ACTIONS.set(scaling_actions);
    let _ = ESCALATIONS.set(escalations);
    let _ = MIGRATIONS.set(migrations);
    let _ = STUCK_RECOVERIES.set(stuck_recoveries);
    let _ = PREDICTION_ERROR.set(prediction_error);
    let _ = SPAWN_FAILURES.set(spawn_failures);
    let _ = REGISTRY.set(registry);

    Ok(())
}

/// Export all metrics in Prometheus text format.
///
/// Returns an empty string if metrics were never initialized.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return String::new();
    };
    let encoder = TextEncoder::new();
    let families = registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Recording helpers. Each is a no-op before init_metrics so the library
// can be used without a registry.

pub fn record_task_scheduled(agent_type: &str, priority: Priority) {
    if let Some(counter) = TASKS_SCHEDULED.get() {
        counter
            .with_label_values(&[agent_type, &priority.to_string()])
            .inc();
    }
}

pub fn record_task_completed(task_type: &str, success: bool) {
    if let Some(counter) = TASKS_COMPLETED.get() {
        let outcome = if success { "success" } else { "failure" };
        counter.with_label_values(&[task_type, outcome]).inc();
    }
}

pub fn set_queue_depth(agent_type: &str, depth: usize) {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.with_label_values(&[agent_type]).set(depth as f64);
    }
}

pub fn set_agent_counts(agent_type: &str, active: usize, healthy: usize) {
    if let Some(gauge) = ACTIVE_AGENTS.get() {
        gauge.with_label_values(&[agent_type]).set(active as f64);
    }
    if let Some(gauge) = HEALTHY_AGENTS.get() {
        gauge.with_label_values(&[agent_type]).set(healthy as f64);
    }
}

pub fn record_scaling_action(action: &str, agent_type: &str) {
    if let Some(counter) = SCALING_ACTIONS.get() {
        counter.with_label_values(&[action, agent_type]).inc();
    }
}

pub fn record_escalation(rule: &str) {
    if let Some(counter) = ESCALATIONS.get() {
        counter.with_label_values(&[rule]).inc();
    }
}

pub fn record_migration(cause: &str) {
    if let Some(counter) = MIGRATIONS.get() {
        counter.with_label_values(&[cause]).inc();
    }
}

pub fn record_stuck_recovery(agent_type: &str) {
    if let Some(counter) = STUCK_RECOVERIES.get() {
        counter.with_label_values(&[agent_type]).inc();
    }
}

pub fn record_prediction_error(ratio: f64) {
    if let Some(histogram) = PREDICTION_ERROR.get() {
        histogram.observe(ratio);
    }
}

pub fn record_spawn_failure(agent_type: &str) {
    if let Some(counter) = SPAWN_FAILURES.get() {
        counter.with_label_values(&[agent_type]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_are_noops_before_init() {
        // Must not panic with no registry in place.
        record_task_scheduled("claude", Priority::Normal);
        record_task_completed("backend", true);
        set_queue_depth("gpt", 3);
        record_prediction_error(0.2);
    }

    #[test]
    fn test_export_without_init_is_empty() {
        // REGISTRY may be set by a concurrently-run test; only assert
        // that export never panics.
        let _ = export_metrics();
    }
}
