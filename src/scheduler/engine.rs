//! Scheduling engine: complexity scoring, agent selection, placement,
//! completion feedback, and the periodic rebalance pass.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::ScheduleError;
use crate::metrics;
use crate::registry::{Agent, AgentRegistry, PerformanceRecord};
use crate::scheduler::model::SchedulingModel;
use crate::store::QueueStore;
use crate::task::{CompletionResult, Priority, RecentIds, SchedulePlacement, Task};

/// Baseline milliseconds per complexity point.
const BASELINE_MS_PER_COMPLEXITY: f64 = 60_000.0;
/// Minimum prediction ever returned.
const PREDICTION_FLOOR_MS: f64 = 30_000.0;
/// Prediction for an agent the model knows nothing about.
const UNKNOWN_AGENT_PREDICTION_MS: f64 = 300_000.0;
/// Heartbeats older than this disqualify an agent from selection.
const SELECTION_HEARTBEAT_MAX_SECS: i64 = 60;
/// Score gap below which predicted time breaks the tie.
const SCORE_TIE_MARGIN: f64 = 5.0;
/// How many queued tasks the rebalancer examines per overloaded agent.
const REBALANCE_PEEK_LIMIT: usize = 3;
/// EMA smoothing for the running completion-time average.
const STATS_EMA_ALPHA: f64 = 0.1;
/// How many processed completion ids are remembered for deduplication.
const COMPLETION_CACHE_CAP: usize = 10_000;

/// Aggregate scheduling statistics for dashboards and the CLI.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub total_scheduled: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    /// EMA of observed completion times.
    pub average_completion_ms: f64,
    pub rebalance_migrations: u64,
}

/// One scored candidate during selection.
struct Candidate {
    agent: Agent,
    score: f64,
    predicted_ms: f64,
}

/// Assigns tasks to agents and learns from their outcomes.
pub struct TaskScheduler {
    store: QueueStore,
    registry: AgentRegistry,
    model: Arc<RwLock<SchedulingModel>>,
    config: OrchestratorConfig,
    /// Recently processed completion ids, so duplicate reports cannot
    /// double-decrement load or double-train the model.
    completed: Mutex<RecentIds>,
    rebalancing: AtomicBool,
    stats: Mutex<SchedulerStats>,
}

impl TaskScheduler {
    pub fn new(store: QueueStore, registry: AgentRegistry, config: OrchestratorConfig) -> Self {
        let model = SchedulingModel::new(config.learning_rate);
        Self {
            store,
            registry,
            model: Arc::new(RwLock::new(model)),
            config,
            completed: Mutex::new(RecentIds::new(COMPLETION_CACHE_CAP)),
            rebalancing: AtomicBool::new(false),
            stats: Mutex::new(SchedulerStats::default()),
        }
    }

    /// Replaces the learned model, used at startup to resume from a
    /// persisted snapshot.
    pub async fn restore_model(&self, model: SchedulingModel) {
        *self.model.write().await = model;
    }

    pub async fn model_snapshot(&self) -> SchedulingModel {
        self.model.read().await.clone()
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.stats.lock().await.clone()
    }

    // ---- Pure scoring functions ----

    /// Complexity in [1.0, 5.0] from file attachments, content length,
    /// task type, and priority.
    pub fn calculate_task_complexity(task: &Task) -> f64 {
        let mut complexity = 1.0;
        for file in &task.files {
            complexity += 0.1;
            if file.is_large() {
                complexity += 0.2;
            }
            if file.is_code() {
                complexity += 0.3;
            }
            if file.is_test() {
                complexity += 0.1;
            }
        }
        complexity += (task.content_lines() as f64 / 1000.0).min(1.0);
        complexity *= Self::type_factor(&task.task_type);
        complexity *= Self::priority_factor(task.priority);
        complexity.clamp(1.0, 5.0)
    }

    fn type_factor(task_type: &str) -> f64 {
        match task_type {
            "architecture" => 2.0,
            "refactoring" => 1.8,
            "security" => 1.6,
            "performance" => 1.5,
            "debugging" => 1.4,
            "api" => 1.3,
            "backend" | "devops" => 1.2,
            "frontend" => 1.1,
            "testing" => 1.0,
            "documentation" => 0.8,
            _ => 1.0,
        }
    }

    fn priority_factor(priority: Priority) -> f64 {
        match priority {
            Priority::Critical => 1.5,
            Priority::High => 1.2,
            Priority::Normal => 1.0,
            Priority::Low => 0.8,
            Priority::Deferred => 0.6,
        }
    }

    /// Agent fitness for a task in [0, 100]: capability match (40),
    /// load-balance credit (25), health (20), track record (15).
    pub fn calculate_agent_score(task: &Task, agent: &Agent) -> f64 {
        let capability_fraction = if task.required_capabilities.is_empty() {
            1.0
        } else {
            let matched = task
                .required_capabilities
                .iter()
                .filter(|c| agent.capabilities.contains(*c))
                .count();
            matched as f64 / task.required_capabilities.len() as f64
        };

        let load_credit = if agent.max_capacity == 0 {
            0.0
        } else {
            (25.0 - 25.0 * agent.current_load as f64 / agent.max_capacity as f64).max(0.0)
        };

        let history_credit = match agent.success_rate() {
            Some(rate) => rate * 15.0,
            None => 10.0,
        };

        capability_fraction * 40.0 + load_credit + agent.health_score * 20.0 + history_credit
    }

    /// Predicted completion time for a task on a specific agent, blending
    /// the complexity baseline, the agent's own history, and the learned
    /// bucket average, then scaling for load and health. The blend is
    /// finally divided by the agent's learned performance weight, so
    /// agents that consistently beat their predictions predict faster.
    pub fn predict_completion_time(
        task: &Task,
        agent: Option<&Agent>,
        model: &SchedulingModel,
    ) -> f64 {
        let Some(agent) = agent else {
            return UNKNOWN_AGENT_PREDICTION_MS;
        };

        let baseline = task.complexity * BASELINE_MS_PER_COMPLEXITY;
        let agent_history = agent
            .average_completion_ms_for(&task.task_type)
            .or_else(|| agent.average_completion_ms())
            .unwrap_or(baseline);
        let learned = model
            .bucket_average(&task.task_type, task.complexity)
            .unwrap_or(baseline);

        let blended = baseline * model.weights.baseline
            + agent_history * model.weights.agent_history
            + learned * model.weights.learned;

        let load_factor = 1.0 + 0.5 * agent.load_fraction();
        let health_factor = 2.0 - agent.health_score;
        let weight = model.agent_weight(&agent.id).max(0.1);

        (blended * load_factor * health_factor / weight).max(PREDICTION_FLOOR_MS)
    }

    /// Picks the best agent for a task from a fleet snapshot.
    ///
    /// Candidates must have spare capacity, health above 0.3, and a
    /// heartbeat within the last 60 seconds. Ties within 5 score points
    /// go to the lower predicted completion time.
    ///
    /// # Errors
    ///
    /// Returns `ScheduleError::NoAvailableAgent` if no agent qualifies.
    pub fn choose_agent(
        task: &Task,
        agents: &[Agent],
        model: &SchedulingModel,
    ) -> Result<(Agent, f64, f64), ScheduleError> {
        let mut candidates: Vec<Candidate> = agents
            .iter()
            .filter(|a| {
                a.has_spare_capacity()
                    && a.health_score > 0.3
                    && a.heartbeat_age_secs() < SELECTION_HEARTBEAT_MAX_SECS
            })
            .map(|a| Candidate {
                score: Self::calculate_agent_score(task, a),
                predicted_ms: Self::predict_completion_time(task, Some(a), model),
                agent: a.clone(),
            })
            .collect();

        if candidates.is_empty() {
            return Err(ScheduleError::NoAvailableAgent {
                task_id: task.id.clone(),
                reason: "no agent passes load/health/heartbeat filters".to_string(),
            });
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let top_score = candidates[0].score;
        let best = candidates
            .into_iter()
            .take_while(|c| top_score - c.score < SCORE_TIE_MARGIN)
            .min_by(|a, b| {
                a.predicted_ms
                    .partial_cmp(&b.predicted_ms)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

        match best {
            Some(c) => Ok((c.agent, c.score, c.predicted_ms)),
            None => Err(ScheduleError::NoAvailableAgent {
                task_id: task.id.clone(),
                reason: "candidate set emptied during tie-break".to_string(),
            }),
        }
    }

    // ---- Placement ----

    /// Schedules one task: scores it, picks an agent, enqueues it, and
    /// records the placement.
    pub async fn schedule_task(&self, mut task: Task) -> Result<SchedulePlacement, ScheduleError> {
        task.ensure_id();
        task.scheduled_at = Some(chrono::Utc::now());
        task.complexity = Self::calculate_task_complexity(&task);

        let agents = self.registry.snapshot().await;
        let (agent, score, predicted_ms) = {
            let model = self.model.read().await;
            Self::choose_agent(&task, &agents, &model)?
        };

        task.assigned_agent = Some(agent.id.clone());
        task.scheduling_score = Some(score);
        task.predicted_completion_ms = Some(predicted_ms as u64);

        self.registry.increment_load(&agent.id).await;
        if let Some(updated) = self.registry.get(&agent.id).await {
            self.store.save_agent(&updated).await?;
        }

        let queue_position = self.store.enqueue_assigned(&agent.id, &task).await?;
        self.store.set_task_priority(&task.id, task.priority).await?;
        self.store
            .set_task_metrics(
                &task.id,
                &serde_json::json!({
                    "agent": agent.id,
                    "task_type": task.task_type,
                    "complexity": task.complexity,
                    "predicted_ms": predicted_ms,
                }),
            )
            .await?;

        metrics::record_task_scheduled(&agent.agent_type, task.priority);
        {
            let mut stats = self.stats.lock().await;
            stats.total_scheduled += 1;
        }

        info!(
            task_id = %task.id,
            agent = %agent.id,
            score = score,
            predicted_ms = predicted_ms,
            "Task scheduled"
        );

        Ok(SchedulePlacement {
            task_id: task.id,
            assigned_agent: agent.id,
            queue_position,
            predicted_completion_ms: predicted_ms as u64,
        })
    }

    // ---- Completion feedback ----

    /// Processes a completion report: clears the placement ledger entry,
    /// releases the agent's load slot, records performance, and trains
    /// the model. Duplicate reports for the same task are ignored.
    pub async fn update_task_completion(
        &self,
        task_id: &str,
        result: &CompletionResult,
    ) -> Result<(), ScheduleError> {
        {
            let mut completed = self.completed.lock().await;
            if !completed.insert(task_id) {
                debug!(task_id = %task_id, "Ignoring duplicate completion report");
                return Ok(());
            }
        }

        let Some(placement) = self.store.get_task_metrics(task_id).await? else {
            warn!(task_id = %task_id, "Completion for task with no placement record");
            return Ok(());
        };
        // An empty agent means the task was re-homed across type queues
        // and no longer counts toward any agent's load or history.
        let agent_id = placement["agent"].as_str().unwrap_or_default().to_string();
        let task_type = placement["task_type"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let complexity = placement["complexity"].as_f64().unwrap_or(1.0);
        let predicted_ms = placement["predicted_ms"].as_f64().unwrap_or(0.0);

        if !agent_id.is_empty() {
            if self.store.remove_assigned(&agent_id, task_id).await?.is_none() {
                debug!(task_id = %task_id, "No ledger entry at completion; task had migrated");
            }
            self.registry.decrement_load(&agent_id).await;
            self.registry
                .update(&agent_id, |a| {
                    a.record_performance(PerformanceRecord {
                        task_id: task_id.to_string(),
                        task_type: task_type.clone(),
                        success: result.success,
                        completion_time_ms: result.completion_time_ms,
                        recorded_at: chrono::Utc::now(),
                    });
                })
                .await;
            if let Some(agent) = self.registry.get(&agent_id).await {
                self.store.save_agent(&agent).await?;
            }
        }

        let actual_ms = result.completion_time_ms as f64;
        {
            let mut model = self.model.write().await;
            if result.success && actual_ms > 0.0 {
                model.observe_completion(&task_type, complexity, actual_ms);
            }
            if !agent_id.is_empty() {
                let performance_score = if result.success && actual_ms > 0.0 {
                    (predicted_ms / actual_ms).min(2.0)
                } else {
                    0.5
                };
                model.observe_agent_performance(&agent_id, performance_score);
            }
        }

        {
            let mut stats = self.stats.lock().await;
            if result.success {
                stats.total_completed += 1;
                if stats.average_completion_ms == 0.0 {
                    stats.average_completion_ms = actual_ms;
                } else {
                    stats.average_completion_ms = stats.average_completion_ms
                        * (1.0 - STATS_EMA_ALPHA)
                        + actual_ms * STATS_EMA_ALPHA;
                }
            } else {
                stats.total_failed += 1;
            }
        }

        metrics::record_task_completed(&task_type, result.success);
        if result.success && predicted_ms > 0.0 && actual_ms > 0.0 {
            metrics::record_prediction_error((predicted_ms - actual_ms).abs() / actual_ms);
        }

        Ok(())
    }

    // ---- Rebalancing ----

    /// Moves queued work from overloaded agents (>80% capacity) to
    /// underloaded ones (<30%), at most `max_migrations_per_agent` moves
    /// per overloaded agent per cycle. Returns the migration count.
    pub async fn rebalance_workload(&self) -> Result<usize, ScheduleError> {
        if self
            .rebalancing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Rebalance cycle already in flight, skipping");
            return Ok(0);
        }
        let result = self.rebalance_inner().await;
        self.rebalancing.store(false, Ordering::SeqCst);
        result
    }

    async fn rebalance_inner(&self) -> Result<usize, ScheduleError> {
        let agents = self.registry.snapshot().await;
        let overloaded: Vec<&Agent> = agents
            .iter()
            .filter(|a| a.current_load as f64 > 0.8 * a.max_capacity as f64)
            .collect();
        let underloaded: Vec<&Agent> = agents
            .iter()
            .filter(|a| (a.current_load as f64) < 0.3 * a.max_capacity as f64)
            .collect();

        if overloaded.is_empty() || underloaded.is_empty() {
            return Ok(0);
        }

        let mut migrations = 0;

        for source in overloaded {
            let queued = self.store.assigned_tasks(&source.id).await?;
            let mut moved_from_source = 0;

            for task in queued.into_iter().take(REBALANCE_PEEK_LIMIT) {
                if moved_from_source >= self.config.max_migrations_per_agent {
                    break;
                }
                let source_score = Self::calculate_agent_score(&task, source);

                let best_target = underloaded
                    .iter()
                    .filter(|t| {
                        t.id != source.id
                            && (t.current_load as f64) < 0.7 * t.max_capacity as f64
                            && t.has_spare_capacity()
                    })
                    .map(|t| (*t, Self::calculate_agent_score(&task, t)))
                    .filter(|(_, score)| *score > source_score)
                    .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

                let Some((target, target_score)) = best_target else {
                    continue;
                };

                // The task may have been consumed or moved since the peek.
                if self.store.move_assigned(&source.id, &target.id, &task).await? {
                    self.registry.decrement_load(&source.id).await;
                    self.registry.increment_load(&target.id).await;
                    self.store.update_task_agent(&task.id, &target.id).await?;
                    // When the new owner is a different type, the
                    // executable copy moves to that type's queue too.
                    if source.agent_type != target.agent_type {
                        self.store
                            .reroute_pending(
                                &source.agent_type,
                                &target.agent_type,
                                &task.id,
                                &target.id,
                            )
                            .await?;
                    }
                    moved_from_source += 1;
                    migrations += 1;
                    metrics::record_migration("rebalance");
                    info!(
                        task_id = %task.id,
                        from = %source.id,
                        to = %target.id,
                        from_score = source_score,
                        to_score = target_score,
                        "Rebalanced queued task"
                    );
                }
            }
        }

        if migrations > 0 {
            let mut stats = self.stats.lock().await;
            stats.rebalance_migrations += migrations as u64;
        }
        Ok(migrations)
    }

    /// Persists the learned model and prunes weights for departed agents.
    pub async fn snapshot_model(&self) -> Result<(), ScheduleError> {
        let live: HashSet<String> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .map(|a| a.id)
            .collect();
        let snapshot = {
            let mut model = self.model.write().await;
            model.retain_agents(&live);
            model.clone()
        };
        self.store.save_model(&snapshot).await?;
        debug!(
            buckets = snapshot.completion_times_ms.len(),
            agents = snapshot.agent_weights.len(),
            "Scheduling model persisted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskFile;
    use std::collections::HashSet as StdHashSet;

    fn agent(id: &str, load: usize, max: usize, health: f64, caps: &[&str]) -> Agent {
        let capabilities: StdHashSet<String> = caps.iter().map(|c| c.to_string()).collect();
        let mut a = Agent::new(id, "claude", capabilities, max);
        a.current_load = load;
        a.health_score = health;
        a
    }

    fn task(task_type: &str, caps: &[&str]) -> Task {
        Task::new(task_type).with_capabilities(caps.iter().copied())
    }

    #[test]
    fn test_complexity_bounds() {
        let minimal = task("documentation", &[]);
        let c = TaskScheduler::calculate_task_complexity(&minimal);
        assert!((1.0..=5.0).contains(&c));

        let mut heavy = task("architecture", &[]).with_priority(Priority::Critical);
        heavy.files = (0..30)
            .map(|i| TaskFile {
                path: format!("src/mod{i}.rs"),
                size_bytes: 100_000,
            })
            .collect();
        heavy.content = "line\n".repeat(2000);
        let c = TaskScheduler::calculate_task_complexity(&heavy);
        assert!((c - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_complexity_monotonic_in_files() {
        let mut t = task("backend", &[]);
        let base = TaskScheduler::calculate_task_complexity(&t);
        t.files.push(TaskFile {
            path: "src/api.rs".to_string(),
            size_bytes: 1000,
        });
        let one_file = TaskScheduler::calculate_task_complexity(&t);
        assert!(one_file >= base);
        t.files.push(TaskFile {
            path: "tests/api_test.rs".to_string(),
            size_bytes: 60 * 1024,
        });
        assert!(TaskScheduler::calculate_task_complexity(&t) >= one_file);
    }

    #[test]
    fn test_agent_score_components() {
        let t = task("backend", &["backend"]);
        let idle = agent("a1", 0, 5, 1.0, &["backend"]);
        // Full capability match + full load credit + full health + fresh default.
        let score = TaskScheduler::calculate_agent_score(&t, &idle);
        assert!((score - 95.0).abs() < 1e-9);

        let no_caps = agent("a2", 0, 5, 1.0, &["frontend"]);
        let score = TaskScheduler::calculate_agent_score(&t, &no_caps);
        assert!((score - 55.0).abs() < 1e-9);
    }

    #[test]
    fn test_prediction_unknown_agent() {
        let model = SchedulingModel::new(0.3);
        let t = task("backend", &[]);
        let ms = TaskScheduler::predict_completion_time(&t, None, &model);
        assert!((ms - UNKNOWN_AGENT_PREDICTION_MS).abs() < 1e-9);
    }

    #[test]
    fn test_prediction_floor() {
        let model = SchedulingModel::new(0.3);
        let mut t = task("documentation", &[]);
        t.complexity = 0.1; // below any realistic value, forces the floor
        let a = agent("a1", 0, 5, 1.0, &[]);
        let ms = TaskScheduler::predict_completion_time(&t, Some(&a), &model);
        assert!(ms >= PREDICTION_FLOOR_MS);
    }

    #[test]
    fn test_selection_prefers_less_loaded_agent() {
        let model = SchedulingModel::new(0.3);
        let mut t = task("architecture", &["architecture"]);
        t.complexity = TaskScheduler::calculate_task_complexity(&t);
        let a1 = agent("a1", 0, 5, 1.0, &["architecture"]);
        let a2 = agent("a2", 4, 5, 1.0, &["architecture"]);

        let (chosen, score, _) =
            TaskScheduler::choose_agent(&t, &[a1, a2], &model).unwrap();
        assert_eq!(chosen.id, "a1");
        // Load credit difference alone is 20 points, beyond the tie margin.
        assert!(score > 90.0);
    }

    #[test]
    fn test_selection_filters_unhealthy_and_full() {
        let model = SchedulingModel::new(0.3);
        let t = task("backend", &[]);
        let full = agent("full", 5, 5, 1.0, &[]);
        let sick = agent("sick", 0, 5, 0.2, &[]);
        let result = TaskScheduler::choose_agent(&t, &[full, sick], &model);
        assert!(matches!(
            result,
            Err(ScheduleError::NoAvailableAgent { .. })
        ));
    }

    #[test]
    fn test_selection_filters_stale_heartbeat() {
        let model = SchedulingModel::new(0.3);
        let t = task("backend", &[]);
        let mut stale = agent("stale", 0, 5, 1.0, &[]);
        stale.last_heartbeat = chrono::Utc::now() - chrono::Duration::seconds(120);
        let result = TaskScheduler::choose_agent(&t, &[stale], &model);
        assert!(result.is_err());
    }

    #[test]
    fn test_tie_break_uses_predicted_time() {
        let mut model = SchedulingModel::new(0.3);
        // Two equally-scored agents; a2 has a strong performance weight so
        // its prediction is lower.
        model.observe_agent_performance("a2", 2.0);
        let mut t = task("backend", &["backend"]);
        t.complexity = 2.0;
        let a1 = agent("a1", 0, 5, 1.0, &["backend"]);
        let a2 = agent("a2", 0, 5, 1.0, &["backend"]);

        let (chosen, _, _) = TaskScheduler::choose_agent(&t, &[a1, a2], &model).unwrap();
        assert_eq!(chosen.id, "a2");
    }
}
