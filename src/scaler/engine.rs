//! Auto-scaling engine: workload analysis, scaling decisions, agent
//! lifecycle, health monitoring, and stuck-task recovery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{AgentTypeConfig, OrchestratorConfig, TypePriority};
use crate::error::ScalingError;
use crate::metrics;
use crate::registry::{Agent, AgentRegistry};
use crate::scaler::process::ProcessSupervisor;
use crate::store::QueueStore;
use crate::task::Priority;

/// Queue pressure classification for one agent type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadStatus {
    Healthy,
    Overloaded,
    Underutilized,
    /// Severe pressure or no live agents at all.
    Critical,
}

/// Observed state of one agent type at the start of a cycle.
#[derive(Debug, Clone)]
pub struct TypeWorkload {
    pub agent_type: String,
    pub pending: usize,
    pub processing: usize,
    pub active_agents: usize,
    pub healthy_agents: usize,
    pub status: WorkloadStatus,
}

impl TypeWorkload {
    pub fn depth(&self) -> usize {
        self.pending + self.processing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    LoadBalance,
}

impl ScalingAction {
    fn label(&self) -> &'static str {
        match self {
            ScalingAction::ScaleUp => "scale_up",
            ScalingAction::ScaleDown => "scale_down",
            ScalingAction::LoadBalance => "load_balance",
        }
    }
}

/// One recommendation produced and consumed within a single cycle.
#[derive(Debug, Clone)]
pub struct ScalingDecision {
    pub action: ScalingAction,
    pub agent_type: String,
    pub target_instances: usize,
    pub reason: String,
    pub priority: TypePriority,
}

/// Aggregate scaling statistics for dashboards and the CLI.
#[derive(Debug, Clone, Default)]
pub struct ScalerStats {
    pub total_scale_ups: u64,
    pub total_scale_downs: u64,
    pub total_stuck_recovered: u64,
    pub total_replacements: u64,
}

/// Watches queue pressure and manages the agent fleet to match it.
pub struct AutoScaler {
    store: QueueStore,
    registry: AgentRegistry,
    config: OrchestratorConfig,
    supervisor: ProcessSupervisor,
    cycling: AtomicBool,
    last_scaling_action: Mutex<Option<Instant>>,
    /// First time each in-flight task was seen in a processing list, so a
    /// stuck task is recovered exactly once per incident.
    stuck_seen: Mutex<HashMap<String, Instant>>,
    stats: Mutex<ScalerStats>,
}

impl AutoScaler {
    pub fn new(store: QueueStore, registry: AgentRegistry, config: OrchestratorConfig) -> Self {
        let supervisor = ProcessSupervisor::new(
            config.redis_url.clone(),
            config.spawn_retry_backoff,
            config.termination_grace,
        );
        Self {
            store,
            registry,
            config,
            supervisor,
            cycling: AtomicBool::new(false),
            last_scaling_action: Mutex::new(None),
            stuck_seen: Mutex::new(HashMap::new()),
            stats: Mutex::new(ScalerStats::default()),
        }
    }

    pub async fn stats(&self) -> ScalerStats {
        self.stats.lock().await.clone()
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    // ---- Analysis ----

    /// Reads per-type queue depth and fleet state, refreshing the depth
    /// and agent-count gauges as a side effect.
    pub async fn get_system_state(&self) -> Result<Vec<TypeWorkload>, ScalingError> {
        let mut workloads = Vec::with_capacity(self.config.agent_types.len());
        for type_config in &self.config.agent_types {
            let agent_type = &type_config.agent_type;
            let pending = self.store.pending_len(agent_type).await?;
            let processing = self.store.processing_len(agent_type).await?;
            let agents = self.registry.agents_of_type(agent_type).await;
            let healthy = agents.iter().filter(|a| self.is_healthy(a)).count();

            metrics::set_queue_depth(agent_type, pending + processing);
            metrics::set_agent_counts(agent_type, agents.len(), healthy);

            let status = Self::classify(
                pending + processing,
                healthy,
                type_config.min_instances,
                type_config.max_instances,
                self.config.scale_up_threshold,
                self.config.scale_down_threshold,
            );
            workloads.push(TypeWorkload {
                agent_type: agent_type.clone(),
                pending,
                processing,
                active_agents: agents.len(),
                healthy_agents: healthy,
                status,
            });
        }
        Ok(workloads)
    }

    fn is_healthy(&self, agent: &Agent) -> bool {
        agent.health_score > 0.3
            && agent.heartbeat_age_secs() < self.config.heartbeat_timeout.as_secs() as i64
    }

    /// Classifies one type's pressure from queue depth and fleet counts.
    pub fn classify(
        depth: usize,
        healthy: usize,
        min: usize,
        max: usize,
        up_threshold: usize,
        down_threshold: usize,
    ) -> WorkloadStatus {
        if depth > 2 * up_threshold || healthy == 0 {
            WorkloadStatus::Critical
        } else if depth > up_threshold && healthy < max {
            WorkloadStatus::Overloaded
        } else if depth < down_threshold && healthy > min {
            WorkloadStatus::Underutilized
        } else {
            WorkloadStatus::Healthy
        }
    }

    /// Turns classified workloads into an ordered decision list.
    pub fn generate_recommendations(&self, workloads: &[TypeWorkload]) -> Vec<ScalingDecision> {
        let mut decisions = Vec::new();
        let up_threshold = self.config.scale_up_threshold;

        for workload in workloads {
            let Some(type_config) = self.config.agent_type(&workload.agent_type) else {
                continue;
            };
            match workload.status {
                WorkloadStatus::Critical => decisions.push(ScalingDecision {
                    action: ScalingAction::ScaleUp,
                    agent_type: workload.agent_type.clone(),
                    target_instances: type_config
                        .max_instances
                        .min(workload.healthy_agents + 2),
                    reason: format!(
                        "critical: depth={} healthy={}",
                        workload.depth(),
                        workload.healthy_agents
                    ),
                    priority: TypePriority::Critical,
                }),
                WorkloadStatus::Overloaded => {
                    let extra = workload.depth().div_ceil(up_threshold);
                    decisions.push(ScalingDecision {
                        action: ScalingAction::ScaleUp,
                        agent_type: workload.agent_type.clone(),
                        target_instances: type_config
                            .max_instances
                            .min(workload.healthy_agents + extra),
                        reason: format!("overloaded: depth={}", workload.depth()),
                        priority: type_config.priority,
                    });
                }
                WorkloadStatus::Underutilized => decisions.push(ScalingDecision {
                    action: ScalingAction::ScaleDown,
                    agent_type: workload.agent_type.clone(),
                    target_instances: type_config
                        .min_instances
                        .max(workload.healthy_agents.saturating_sub(1)),
                    reason: format!("underutilized: depth={}", workload.depth()),
                    priority: TypePriority::Medium,
                }),
                WorkloadStatus::Healthy => {}
            }
        }

        let total_depth: usize = workloads.iter().map(|w| w.depth()).sum();
        if total_depth > 0 {
            decisions.push(ScalingDecision {
                action: ScalingAction::LoadBalance,
                agent_type: "*".to_string(),
                target_instances: 0,
                reason: format!("queued work present: total={total_depth}"),
                priority: TypePriority::Low,
            });
        }

        decisions.sort_by(|a, b| b.priority.cmp(&a.priority));
        decisions
    }

    /// Filters recommendations through the cooldown window. Low-priority
    /// recommendations never survive; everything is suppressed while a
    /// recent scaling action is cooling down.
    pub async fn make_scaling_decisions(
        &self,
        recommendations: Vec<ScalingDecision>,
    ) -> Vec<ScalingDecision> {
        let last = self.last_scaling_action.lock().await;
        if let Some(last) = *last {
            if last.elapsed() < self.config.scaling_cooldown {
                debug!(
                    remaining_secs = (self.config.scaling_cooldown - last.elapsed()).as_secs(),
                    "Scaling suppressed by cooldown"
                );
                return Vec::new();
            }
        }
        recommendations
            .into_iter()
            .filter(|d| d.priority > TypePriority::Low)
            .collect()
    }

    /// One full analysis-and-execution pass. Skipped if a cycle is
    /// already running.
    pub async fn run_scaling_cycle(&self) -> Result<(), ScalingError> {
        if self
            .cycling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Scaling cycle already in flight, skipping");
            return Ok(());
        }
        let result = self.cycle_inner().await;
        self.cycling.store(false, Ordering::SeqCst);
        result
    }

    async fn cycle_inner(&self) -> Result<(), ScalingError> {
        for exited in self.supervisor.reap_exited().await {
            warn!(agent_id = %exited, "Managed agent exited on its own");
            self.deregister_agent(&exited).await?;
        }

        let workloads = self.get_system_state().await?;
        let recommendations = self.generate_recommendations(&workloads);
        let decisions = self.make_scaling_decisions(recommendations).await;
        if decisions.is_empty() {
            return Ok(());
        }

        let mut acted = false;
        for decision in decisions {
            info!(
                action = decision.action.label(),
                agent_type = %decision.agent_type,
                target = decision.target_instances,
                reason = %decision.reason,
                "Executing scaling decision"
            );
            match decision.action {
                ScalingAction::ScaleUp => {
                    self.scale_up(&decision.agent_type, decision.target_instances)
                        .await?;
                    acted = true;
                }
                ScalingAction::ScaleDown => {
                    self.scale_down(&decision.agent_type, decision.target_instances)
                        .await?;
                    acted = true;
                }
                // Fit-based movement belongs to the workload balancer.
                ScalingAction::LoadBalance => {}
            }
            metrics::record_scaling_action(decision.action.label(), &decision.agent_type);
        }

        if acted {
            // Stamped after the whole batch so one cycle's actions share
            // a single cooldown window.
            let mut last = self.last_scaling_action.lock().await;
            *last = Some(Instant::now());
        }
        Ok(())
    }

    // ---- Lifecycle ----

    /// Spawns agents of a type up to the target count, staggering spawns.
    /// A spawn failure aborts the remainder and waits for the next cycle.
    pub async fn scale_up(&self, agent_type: &str, target: usize) -> Result<(), ScalingError> {
        let Some(type_config) = self.config.agent_type(agent_type).cloned() else {
            warn!(agent_type = %agent_type, "Scale-up for unconfigured type ignored");
            return Ok(());
        };
        let current = self.registry.agents_of_type(agent_type).await.len();
        if current >= target {
            return Ok(());
        }

        for i in current..target {
            let agent_id = Self::new_agent_id(agent_type);
            match self.supervisor.spawn_agent(&type_config, &agent_id).await {
                Ok(()) => {
                    self.register_new_agent(&type_config, &agent_id).await?;
                    let mut stats = self.stats.lock().await;
                    stats.total_scale_ups += 1;
                }
                Err(e) => {
                    error!(agent_type = %agent_type, error = %e, "Spawn failed, aborting scale-up");
                    metrics::record_spawn_failure(agent_type);
                    return Err(e);
                }
            }
            if i + 1 < target {
                tokio::time::sleep(self.config.spawn_stagger).await;
            }
        }
        Ok(())
    }

    fn new_agent_id(agent_type: &str) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{agent_type}-{}", &suffix[..8])
    }

    async fn register_new_agent(
        &self,
        type_config: &AgentTypeConfig,
        agent_id: &str,
    ) -> Result<(), ScalingError> {
        let agent = Agent::new(
            agent_id,
            &type_config.agent_type,
            type_config.capabilities.iter().cloned().collect(),
            type_config.max_concurrency as usize,
        );
        self.store.save_agent(&agent).await?;
        self.registry.register(agent).await;
        Ok(())
    }

    /// Terminates agents of a type down to the target count, oldest
    /// first. Work earmarked for a terminated agent stays in the type's
    /// pending list for the survivors.
    pub async fn scale_down(&self, agent_type: &str, target: usize) -> Result<(), ScalingError> {
        let agents = self.registry.agents_of_type(agent_type).await;
        if agents.len() <= target {
            return Ok(());
        }
        let excess = agents.len() - target;

        // Prefer locally-managed processes ordered by spawn time, then
        // fall back to registration order for externally-started agents.
        let mut victims = self.supervisor.oldest_for_type(agent_type).await;
        let mut by_registration: Vec<&Agent> = agents.iter().collect();
        by_registration.sort_by_key(|a| a.registered_at);
        for agent in by_registration {
            if !victims.contains(&agent.id) {
                victims.push(agent.id.clone());
            }
        }

        let mut removed = 0;
        for agent_id in victims {
            if removed >= excess {
                break;
            }
            // Agents holding urgent work are drained last.
            if let Some(priority) = self.most_urgent_assigned(&agent_id).await? {
                if priority > Priority::Low {
                    debug!(agent_id = %agent_id, priority = %priority, "Skipping scale-down of busy agent");
                    continue;
                }
            }
            self.terminate_agent(&agent_id).await?;
            removed += 1;
            let mut stats = self.stats.lock().await;
            stats.total_scale_downs += 1;
        }
        Ok(())
    }

    /// Stops one agent and drops its record and ledger entries.
    async fn terminate_agent(&self, agent_id: &str) -> Result<(), ScalingError> {
        if let Err(e) = self.supervisor.terminate(agent_id).await {
            // Forced kill failed; the tracking entry is already gone, so
            // continue with store cleanup rather than leak the record.
            error!(agent_id = %agent_id, error = %e, "Termination escalation failed");
        }
        self.deregister_agent(agent_id).await
    }

    async fn deregister_agent(&self, agent_id: &str) -> Result<(), ScalingError> {
        let _ = self.registry.unregister(agent_id).await;
        // Executable copies live in the type pending/processing lists, so
        // only the agent's placement ledger is dropped here.
        let orphaned = self.store.drain_assigned(agent_id).await?;
        if !orphaned.is_empty() {
            info!(
                agent_id = %agent_id,
                entries = orphaned.len(),
                "Dropped placement ledger of terminated agent"
            );
        }
        self.store.mark_offline(agent_id).await?;
        self.store.delete_agent(agent_id).await?;
        Ok(())
    }

    // ---- Health monitoring ----

    /// Syncs heartbeat state from the store and replaces agents that have
    /// gone silent past the heartbeat timeout.
    pub async fn run_health_check(&self) -> Result<(), ScalingError> {
        let agents = self.registry.snapshot().await;
        let timeout_secs = self.config.heartbeat_timeout.as_secs() as i64;

        for agent in agents {
            // Workers write heartbeats straight into the store hash.
            if let Some(stored) = self.store.load_agent(&agent.id).await? {
                self.registry
                    .record_heartbeat(
                        &agent.id,
                        stored.health_score,
                        stored.resource_usage.clone(),
                        stored.current_load,
                    )
                    .await;
            }

            let Some(current) = self.registry.get(&agent.id).await else {
                continue;
            };
            if current.heartbeat_age_secs() <= timeout_secs {
                continue;
            }

            warn!(
                agent_id = %current.id,
                silent_secs = current.heartbeat_age_secs(),
                "Agent heartbeat timed out, replacing"
            );
            self.store.mark_unhealthy(&current.id).await?;
            self.terminate_agent(&current.id).await?;

            let Some(type_config) = self.config.agent_type(&current.agent_type) else {
                continue;
            };
            let remaining = self.registry.agents_of_type(&current.agent_type).await;
            let healthy = remaining.iter().filter(|a| self.is_healthy(a)).count();
            if healthy < type_config.min_instances {
                self.scale_up(&current.agent_type, type_config.min_instances)
                    .await?;
                let mut stats = self.stats.lock().await;
                stats.total_replacements += 1;
            }
        }
        Ok(())
    }

    // ---- Stuck-task recovery ----

    /// Moves tasks that have sat in a processing list past the timeout
    /// back to their type's pending list. Each incident is recovered at
    /// most once: the removal from the processing list is the gate, so a
    /// task a worker finishes concurrently is left alone.
    pub async fn recover_stuck_tasks(&self) -> Result<usize, ScalingError> {
        let timeout = self.config.task_processing_timeout;
        let mut recovered = 0;
        let mut live_ids = Vec::new();

        for type_config in &self.config.agent_types {
            let agent_type = &type_config.agent_type;
            let entries = self.store.processing_entries(agent_type).await?;
            let mut seen = self.stuck_seen.lock().await;

            for (raw, task) in entries {
                live_ids.push(task.id.clone());
                let first_seen = *seen.entry(task.id.clone()).or_insert_with(Instant::now);
                if first_seen.elapsed() < timeout {
                    continue;
                }
                if self.store.remove_processing(agent_type, &raw).await? {
                    self.store.push_pending_front(agent_type, &task).await?;
                    seen.remove(&task.id);
                    recovered += 1;
                    metrics::record_stuck_recovery(agent_type);
                    warn!(
                        task_id = %task.id,
                        agent_type = %agent_type,
                        stuck_secs = first_seen.elapsed().as_secs(),
                        "Recovered stuck task"
                    );
                }
            }
        }

        // Forget tasks that left processing normally.
        let mut seen = self.stuck_seen.lock().await;
        seen.retain(|id, _| live_ids.contains(id));
        drop(seen);

        if recovered > 0 {
            let mut stats = self.stats.lock().await;
            stats.total_stuck_recovered += recovered as u64;
        }
        Ok(recovered)
    }

    /// Startup sweep: requeues a type's in-flight tasks only when its
    /// whole fleet has gone silent past the heartbeat timeout. A type
    /// with live workers keeps its in-flight tasks; the periodic
    /// stuck-task check handles any that never finish.
    pub async fn recover_abandoned(&self, agent_type: &str) -> Result<usize, ScalingError> {
        let agents = self.registry.agents_of_type(agent_type).await;
        let timeout_secs = self.config.heartbeat_timeout.as_secs() as i64;
        if !Self::fleet_is_silent(&agents, timeout_secs) {
            debug!(agent_type = %agent_type, "Live workers present, leaving in-flight tasks alone");
            return Ok(0);
        }
        self.recover_processing(agent_type).await
    }

    fn fleet_is_silent(agents: &[Agent], timeout_secs: i64) -> bool {
        agents.iter().all(|a| a.heartbeat_age_secs() >= timeout_secs)
    }

    /// Moves every in-flight task of a type back to pending, regardless
    /// of age. Used from the CLI after a confirmed crash.
    pub async fn recover_processing(&self, agent_type: &str) -> Result<usize, ScalingError> {
        let entries = self.store.processing_entries(agent_type).await?;
        let mut recovered = 0;
        for (raw, task) in entries {
            if self.store.remove_processing(agent_type, &raw).await? {
                self.store.push_pending_front(agent_type, &task).await?;
                recovered += 1;
                metrics::record_stuck_recovery(agent_type);
            }
        }
        if recovered > 0 {
            info!(agent_type = %agent_type, recovered, "Recovered in-flight tasks");
        }
        Ok(recovered)
    }

    /// Brings every type up to its configured minimum. Runs once before
    /// the periodic loops start.
    pub async fn ensure_minimum_agents(&self) -> Result<(), ScalingError> {
        for type_config in self.config.agent_types.clone() {
            let current = self
                .registry
                .agents_of_type(&type_config.agent_type)
                .await
                .len();
            if current < type_config.min_instances {
                self.scale_up(&type_config.agent_type, type_config.min_instances)
                    .await?;
            }
        }
        Ok(())
    }

    /// Picks the priority of the most urgent task assigned to an agent,
    /// used when deciding whether an agent can be drained.
    pub async fn most_urgent_assigned(
        &self,
        agent_id: &str,
    ) -> Result<Option<Priority>, ScalingError> {
        let tasks = self.store.assigned_tasks(agent_id).await?;
        Ok(tasks.iter().map(|t| t.priority).max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_critical_on_deep_queue() {
        // depth > 2 * up_threshold
        let status = AutoScaler::classify(11, 1, 1, 4, 5, 2);
        assert_eq!(status, WorkloadStatus::Critical);
    }

    #[test]
    fn test_classify_critical_on_zero_healthy() {
        let status = AutoScaler::classify(0, 0, 1, 4, 5, 2);
        assert_eq!(status, WorkloadStatus::Critical);
    }

    #[test]
    fn test_classify_overloaded() {
        let status = AutoScaler::classify(7, 2, 1, 4, 5, 2);
        assert_eq!(status, WorkloadStatus::Overloaded);
    }

    #[test]
    fn test_classify_overloaded_at_max_is_healthy() {
        // Above threshold but no headroom to scale into.
        let status = AutoScaler::classify(7, 4, 1, 4, 5, 2);
        assert_eq!(status, WorkloadStatus::Healthy);
    }

    #[test]
    fn test_classify_underutilized() {
        let status = AutoScaler::classify(1, 3, 1, 4, 5, 2);
        assert_eq!(status, WorkloadStatus::Underutilized);
    }

    #[test]
    fn test_classify_at_minimum_is_healthy() {
        let status = AutoScaler::classify(1, 1, 1, 4, 5, 2);
        assert_eq!(status, WorkloadStatus::Healthy);
    }

    #[test]
    fn test_critical_scale_target() {
        // pending=12 processing=3 healthy=1 max=4 => depth 15 > 10,
        // critical, target min(4, 1+2) = 3.
        let status = AutoScaler::classify(15, 1, 1, 4, 5, 2);
        assert_eq!(status, WorkloadStatus::Critical);
        let target = 4usize.min(1 + 2);
        assert_eq!(target, 3);
    }

    #[test]
    fn test_fleet_is_silent() {
        let fresh = Agent::new("a1", "claude", Default::default(), 5);
        let mut stale = Agent::new("a2", "claude", Default::default(), 5);
        stale.last_heartbeat = chrono::Utc::now() - chrono::Duration::seconds(300);

        assert!(!AutoScaler::fleet_is_silent(&[fresh.clone(), stale.clone()], 120));
        assert!(AutoScaler::fleet_is_silent(&[stale], 120));
        // A fleet with no agents at all has nothing alive either.
        assert!(AutoScaler::fleet_is_silent(&[], 120));
    }

    #[test]
    fn test_agent_id_shape() {
        let id = AutoScaler::new_agent_id("gpt");
        assert!(id.starts_with("gpt-"));
        assert_eq!(id.len(), "gpt-".len() + 8);
    }
}
