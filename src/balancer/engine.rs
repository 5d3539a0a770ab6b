//! Workload balancing: fit-based routing, cross-type fairness,
//! emergency pressure relief, and failed-task retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::balancer::classify::{
    capability_score, TaskClassifier, UrgencyTag, SUITABILITY_FLOOR, TRANSFER_SUITABILITY,
};
use crate::config::OrchestratorConfig;
use crate::error::BalanceError;
use crate::metrics;
use crate::scaler::AutoScaler;
use crate::store::QueueStore;
use crate::task::Task;

/// Combined routing score above which a migration is worth executing.
const ROUTING_THRESHOLD: f64 = 0.7;
/// Extra routing credit when the destination is urgently less loaded.
const URGENCY_BONUS: f64 = 0.15;

/// Aggregate balancing statistics for dashboards and the CLI.
#[derive(Debug, Clone, Default)]
pub struct BalancerStats {
    pub total_routed: u64,
    pub total_cross_moves: u64,
    pub total_emergency_moves: u64,
    pub total_retries: u64,
    pub total_dropped: u64,
}

/// One planned pending-queue migration.
struct PlannedMove {
    raw: String,
    task: Task,
    from_type: String,
    to_type: String,
    score: f64,
}

/// Moves queued work between agent-type queues for fit and fairness.
///
/// Owns the auto-scaler: the scaler adjusts capacity, the balancer
/// adjusts placement, and both read the same workload picture.
pub struct WorkloadBalancer {
    store: QueueStore,
    config: OrchestratorConfig,
    scaler: Arc<AutoScaler>,
    classifier: TaskClassifier,
    routing: AtomicBool,
    cross: AtomicBool,
    emergency: AtomicBool,
    retrying: AtomicBool,
    stats: Mutex<BalancerStats>,
}

impl WorkloadBalancer {
    pub fn new(
        store: QueueStore,
        config: OrchestratorConfig,
        scaler: Arc<AutoScaler>,
    ) -> Result<Self, BalanceError> {
        Ok(Self {
            store,
            config,
            scaler,
            classifier: TaskClassifier::new()?,
            routing: AtomicBool::new(false),
            cross: AtomicBool::new(false),
            emergency: AtomicBool::new(false),
            retrying: AtomicBool::new(false),
            stats: Mutex::new(BalancerStats::default()),
        })
    }

    pub fn scaler(&self) -> &Arc<AutoScaler> {
        &self.scaler
    }

    pub async fn stats(&self) -> BalancerStats {
        self.stats.lock().await.clone()
    }

    /// Combined pending+processing depth per configured type.
    async fn type_loads(&self) -> Result<HashMap<String, usize>, BalanceError> {
        let mut loads = HashMap::new();
        for type_config in &self.config.agent_types {
            let agent_type = &type_config.agent_type;
            let depth = self.store.pending_len(agent_type).await?
                + self.store.processing_len(agent_type).await?;
            loads.insert(agent_type.clone(), depth);
        }
        Ok(loads)
    }

    // ---- Routing ----

    /// Re-routes pending tasks whose current type is a poor capability
    /// fit. Migrations execute highest score first and only above the
    /// routing threshold.
    pub async fn run_routing_cycle(&self) -> Result<usize, BalanceError> {
        if self
            .routing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(0);
        }
        let result = self.routing_inner().await;
        self.routing.store(false, Ordering::SeqCst);
        result
    }

    async fn routing_inner(&self) -> Result<usize, BalanceError> {
        let loads = self.type_loads().await?;
        let max_load = loads.values().copied().max().unwrap_or(0).max(1);
        let mut planned: Vec<PlannedMove> = Vec::new();

        for type_config in &self.config.agent_types {
            let from_type = &type_config.agent_type;
            let from_load = *loads.get(from_type).unwrap_or(&0);

            for (raw, task) in self.store.pending_entries(from_type).await? {
                let analysis = self.classifier.analyze(&task);
                let current_fit = capability_score(
                    &analysis,
                    type_config,
                    from_load,
                    self.config.max_tasks_per_agent,
                );

                let best = self
                    .config
                    .agent_types
                    .iter()
                    .filter(|t| t.agent_type != *from_type)
                    .map(|t| {
                        let load = *loads.get(&t.agent_type).unwrap_or(&0);
                        let fit = capability_score(
                            &analysis,
                            t,
                            load,
                            self.config.max_tasks_per_agent,
                        );
                        (t, load, fit)
                    })
                    .filter(|(_, _, fit)| *fit > SUITABILITY_FLOOR)
                    .max_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

                let Some((target, target_load, target_fit)) = best else {
                    continue;
                };
                if target_fit <= current_fit {
                    continue;
                }

                let workload_diff =
                    (from_load as f64 - target_load as f64).max(0.0) / max_load as f64;
                let fit_improvement = target_fit - current_fit;
                let urgency_bonus = if analysis.urgency == UrgencyTag::Urgent
                    && target_load < from_load
                {
                    URGENCY_BONUS
                } else {
                    0.0
                };
                let score = 0.4 * workload_diff + 0.6 * fit_improvement + urgency_bonus;

                if score > ROUTING_THRESHOLD {
                    planned.push(PlannedMove {
                        raw,
                        task,
                        from_type: from_type.clone(),
                        to_type: target.agent_type.clone(),
                        score,
                    });
                }
            }
        }

        planned.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut moved = 0;
        for plan in planned {
            if self.execute_move(&plan, "routing").await? {
                moved += 1;
            }
        }
        if moved > 0 {
            let mut stats = self.stats.lock().await;
            stats.total_routed += moved as u64;
        }
        Ok(moved)
    }

    /// Removes the exact raw entry from the source queue and inserts the
    /// task into the destination. A removal miss means another loop (or a
    /// worker) already took the task, which is fine. The scheduler's
    /// placement ledger entry for the old agent is cleared along the way;
    /// the moved copy belongs to the destination type, not to any agent.
    async fn execute_move(&self, plan: &PlannedMove, cause: &str) -> Result<bool, BalanceError> {
        if !self.store.remove_pending(&plan.from_type, &plan.raw).await? {
            debug!(task_id = %plan.task.id, "Planned move raced with another consumer");
            return Ok(false);
        }

        if let Some(agent_id) = plan.task.assigned_agent.as_deref() {
            if self
                .store
                .remove_assigned(agent_id, &plan.task.id)
                .await?
                .is_some()
            {
                self.scaler.registry().decrement_load(agent_id).await;
            }
            self.store.update_task_agent(&plan.task.id, "").await?;
        }

        let mut task = plan.task.clone();
        task.assigned_agent = None;
        self.store.push_pending(&plan.to_type, &task).await?;
        metrics::record_migration(cause);
        info!(
            task_id = %plan.task.id,
            from = %plan.from_type,
            to = %plan.to_type,
            score = plan.score,
            cause = %cause,
            "Migrated pending task"
        );
        Ok(true)
    }

    // ---- Cross-type fairness ----

    /// Transfers work from types far above the mean load to types far
    /// below it, moving at most half the deviation per overloaded type
    /// and only tasks that pass the transfer suitability gate.
    pub async fn run_cross_type_cycle(&self) -> Result<usize, BalanceError> {
        if self
            .cross
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(0);
        }
        let result = self.cross_inner().await;
        self.cross.store(false, Ordering::SeqCst);
        result
    }

    async fn cross_inner(&self) -> Result<usize, BalanceError> {
        let loads = self.type_loads().await?;
        if loads.is_empty() {
            return Ok(0);
        }
        let mean = loads.values().sum::<usize>() as f64 / loads.len() as f64;
        let threshold = self.config.cross_queue_threshold;

        let overloaded: Vec<(String, f64)> = loads
            .iter()
            .filter(|(_, &load)| load as f64 - mean > threshold)
            .map(|(t, &load)| (t.clone(), load as f64 - mean))
            .collect();
        let mut under: HashMap<String, f64> = loads
            .iter()
            .filter(|(_, &load)| mean - load as f64 > threshold)
            .map(|(t, &load)| (t.clone(), mean - load as f64))
            .collect();

        if overloaded.is_empty() || under.is_empty() {
            return Ok(0);
        }

        let mut moved = 0;
        for (from_type, deviation) in overloaded {
            let budget = (deviation / 2.0).floor() as usize;
            if budget == 0 {
                continue;
            }
            let mut transferred = 0;

            for (raw, task) in self.store.pending_entries(&from_type).await? {
                if transferred >= budget {
                    break;
                }
                let analysis = self.classifier.analyze(&task);

                let candidate = under
                    .iter()
                    .filter(|(_, &capacity)| capacity >= 1.0)
                    .filter_map(|(to_type, _)| {
                        let cfg = self.config.agent_type(to_type)?;
                        let load = *loads.get(to_type).unwrap_or(&0);
                        let fit = capability_score(
                            &analysis,
                            cfg,
                            load,
                            self.config.max_tasks_per_agent,
                        );
                        (fit > TRANSFER_SUITABILITY).then(|| (to_type.clone(), fit))
                    })
                    .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

                let Some((to_type, fit)) = candidate else {
                    continue;
                };
                let plan = PlannedMove {
                    raw,
                    task,
                    from_type: from_type.clone(),
                    to_type: to_type.clone(),
                    score: fit,
                };
                if self.execute_move(&plan, "cross_type").await? {
                    transferred += 1;
                    moved += 1;
                    if let Some(capacity) = under.get_mut(&to_type) {
                        *capacity -= 1.0;
                    }
                }
            }
        }

        if moved > 0 {
            let mut stats = self.stats.lock().await;
            stats.total_cross_moves += moved as u64;
        }
        Ok(moved)
    }

    // ---- Emergency relief ----

    /// Drains any type whose combined load exceeds the emergency
    /// threshold, sending each pending task to the lightest-loaded other
    /// type that is at all suitable for it.
    pub async fn run_emergency_cycle(&self) -> Result<usize, BalanceError> {
        if self
            .emergency
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(0);
        }
        let result = self.emergency_inner().await;
        self.emergency.store(false, Ordering::SeqCst);
        result
    }

    async fn emergency_inner(&self) -> Result<usize, BalanceError> {
        let mut loads = self.type_loads().await?;
        let hot: Vec<String> = loads
            .iter()
            .filter(|(_, &load)| load > self.config.emergency_threshold)
            .map(|(t, _)| t.clone())
            .collect();
        if hot.is_empty() {
            return Ok(0);
        }

        let mut moved = 0;
        for from_type in hot {
            warn!(agent_type = %from_type, "Emergency rebalancing triggered");
            for (raw, task) in self.store.pending_entries(&from_type).await? {
                let analysis = self.classifier.analyze(&task);

                let lightest = self
                    .config
                    .agent_types
                    .iter()
                    .filter(|t| t.agent_type != from_type)
                    .filter_map(|t| {
                        let load = *loads.get(&t.agent_type).unwrap_or(&0);
                        let fit = capability_score(
                            &analysis,
                            t,
                            load,
                            self.config.max_tasks_per_agent,
                        );
                        (fit > SUITABILITY_FLOOR).then_some((t.agent_type.clone(), load))
                    })
                    .min_by_key(|(_, load)| *load);

                let Some((to_type, _)) = lightest else {
                    continue;
                };
                let plan = PlannedMove {
                    raw,
                    task,
                    from_type: from_type.clone(),
                    to_type: to_type.clone(),
                    score: 0.0,
                };
                if self.execute_move(&plan, "emergency").await? {
                    moved += 1;
                    *loads.entry(to_type).or_insert(0) += 1;
                    if let Some(load) = loads.get_mut(&from_type) {
                        *load = load.saturating_sub(1);
                    }
                }
            }
        }

        if moved > 0 {
            let mut stats = self.stats.lock().await;
            stats.total_emergency_moves += moved as u64;
        }
        Ok(moved)
    }

    // ---- Failed-task retry ----

    /// Classifies an error message as worth retrying. Syntax, parse, and
    /// validation failures are deterministic and never retried.
    pub fn is_retryable(error: &str) -> bool {
        let lowered = error.to_lowercase();
        !["syntax error", "parse error", "validation", "invalid input"]
            .iter()
            .any(|marker| lowered.contains(marker))
    }

    /// Requeues failed tasks with boosted priority until their retry
    /// budget runs out. Exhausted and non-retryable tasks stay in (or
    /// are dropped to) the failure list permanently.
    pub async fn run_retry_cycle(&self) -> Result<usize, BalanceError> {
        if self
            .retrying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(0);
        }
        let result = self.retry_inner().await;
        self.retrying.store(false, Ordering::SeqCst);
        result
    }

    async fn retry_inner(&self) -> Result<usize, BalanceError> {
        let mut retried = 0;
        let mut dropped = 0;

        for (raw, task) in self.store.failure_entries().await? {
            let error = task.last_failure.as_deref().unwrap_or("");
            if !Self::is_retryable(error) {
                debug!(task_id = %task.id, error = %error, "Non-retryable failure, leaving in place");
                dropped += 1;
                continue;
            }
            if task.retry_count >= self.config.max_retries {
                debug!(task_id = %task.id, retries = task.retry_count, "Retry budget exhausted");
                dropped += 1;
                continue;
            }

            if !self.store.remove_failure(&raw).await? {
                continue;
            }
            let mut retry = task.clone();
            retry.retry_count += 1;
            retry.priority = retry.priority.escalated();
            retry.assigned_agent = None;

            let analysis = self.classifier.analyze(&retry);
            let target_type = if self.config.agent_type(&analysis.primary_type).is_some() {
                analysis.primary_type.clone()
            } else {
                self.lightest_type().await?
            };
            self.store.push_pending_front(&target_type, &retry).await?;
            retried += 1;
            info!(
                task_id = %retry.id,
                attempt = retry.retry_count,
                priority = %retry.priority,
                target = %target_type,
                "Requeued failed task"
            );
        }

        let mut stats = self.stats.lock().await;
        stats.total_retries += retried as u64;
        stats.total_dropped += dropped as u64;
        Ok(retried)
    }

    async fn lightest_type(&self) -> Result<String, BalanceError> {
        let loads = self.type_loads().await?;
        Ok(loads
            .into_iter()
            .min_by_key(|(_, load)| *load)
            .map(|(t, _)| t)
            .unwrap_or_else(|| "claude".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_errors_never_retryable() {
        assert!(!WorkloadBalancer::is_retryable(
            "syntax error: unexpected token"
        ));
        assert!(!WorkloadBalancer::is_retryable("Parse error at line 3"));
        assert!(!WorkloadBalancer::is_retryable("validation failed: bad schema"));
    }

    #[test]
    fn test_transient_errors_retryable() {
        assert!(WorkloadBalancer::is_retryable("connection reset by peer"));
        assert!(WorkloadBalancer::is_retryable("timed out waiting for response"));
        assert!(WorkloadBalancer::is_retryable(""));
    }
}
