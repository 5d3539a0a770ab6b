//! In-memory agent registry shared by all control loops.
//!
//! The registry is the authoritative runtime view of the fleet: agent
//! identity, capabilities, load, health, and a rolling performance window.
//! Worker heartbeats land here (and in the store), and the scheduler,
//! scaler, and balancer all read from it when making decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Maximum performance records kept per agent.
const PERFORMANCE_WINDOW: usize = 100;

/// Point-in-time resource usage reported by a worker heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU utilization percentage (0-100).
    pub cpu_percent: f64,
    /// Resident memory in megabytes.
    pub memory_mb: f64,
}

/// One completed task's outcome, kept in the agent's rolling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub task_id: String,
    pub task_type: String,
    pub success: bool,
    pub completion_time_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

/// A registered worker agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub agent_type: String,
    pub capabilities: HashSet<String>,
    /// Tasks currently assigned to this agent.
    pub current_load: usize,
    /// Nominal concurrent-task capacity.
    pub max_capacity: usize,
    /// Health score in [0, 1]; 1.0 is fully healthy.
    pub health_score: f64,
    pub resource_usage: ResourceUsage,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// Rolling window of recent task outcomes, newest last.
    #[serde(default)]
    pub performance_history: Vec<PerformanceRecord>,
}

impl Agent {
    pub fn new(
        id: impl Into<String>,
        agent_type: impl Into<String>,
        capabilities: HashSet<String>,
        max_capacity: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            capabilities,
            current_load: 0,
            max_capacity,
            health_score: 1.0,
            resource_usage: ResourceUsage::default(),
            last_heartbeat: now,
            registered_at: now,
            performance_history: Vec::new(),
        }
    }

    /// Fraction of recent tasks that succeeded, or `None` with no history.
    pub fn success_rate(&self) -> Option<f64> {
        if self.performance_history.is_empty() {
            return None;
        }
        let successes = self
            .performance_history
            .iter()
            .filter(|r| r.success)
            .count();
        Some(successes as f64 / self.performance_history.len() as f64)
    }

    /// Mean completion time over successful recent tasks, in milliseconds.
    pub fn average_completion_ms(&self) -> Option<f64> {
        let successful: Vec<u64> = self
            .performance_history
            .iter()
            .filter(|r| r.success)
            .map(|r| r.completion_time_ms)
            .collect();
        if successful.is_empty() {
            return None;
        }
        Some(successful.iter().sum::<u64>() as f64 / successful.len() as f64)
    }

    /// Mean completion time for one task type, if any samples exist.
    pub fn average_completion_ms_for(&self, task_type: &str) -> Option<f64> {
        let samples: Vec<u64> = self
            .performance_history
            .iter()
            .filter(|r| r.success && r.task_type == task_type)
            .map(|r| r.completion_time_ms)
            .collect();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<u64>() as f64 / samples.len() as f64)
    }

    /// Appends an outcome, trimming the window from the front.
    pub fn record_performance(&mut self, record: PerformanceRecord) {
        self.performance_history.push(record);
        if self.performance_history.len() > PERFORMANCE_WINDOW {
            let excess = self.performance_history.len() - PERFORMANCE_WINDOW;
            self.performance_history.drain(..excess);
        }
    }

    /// Seconds since this agent's last heartbeat.
    pub fn heartbeat_age_secs(&self) -> i64 {
        (Utc::now() - self.last_heartbeat).num_seconds()
    }

    /// Load as a fraction of capacity, clamped to [0, 1].
    pub fn load_fraction(&self) -> f64 {
        if self.max_capacity == 0 {
            return 1.0;
        }
        (self.current_load as f64 / self.max_capacity as f64).min(1.0)
    }

    pub fn has_spare_capacity(&self) -> bool {
        self.current_load < self.max_capacity
    }
}

/// Shared, concurrency-safe map of registered agents.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an agent, replacing any existing entry with the same id.
    pub async fn register(&self, agent: Agent) {
        let mut agents = self.agents.write().await;
        agents.insert(agent.id.clone(), agent);
    }

    /// Removes an agent, returning its final record.
    pub async fn unregister(&self, agent_id: &str) -> Option<Agent> {
        let mut agents = self.agents.write().await;
        agents.remove(agent_id)
    }

    pub async fn get(&self, agent_id: &str) -> Option<Agent> {
        let agents = self.agents.read().await;
        agents.get(agent_id).cloned()
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        let agents = self.agents.read().await;
        agents.contains_key(agent_id)
    }

    /// Clones the whole fleet for decision-making outside the lock.
    pub async fn snapshot(&self) -> Vec<Agent> {
        let agents = self.agents.read().await;
        agents.values().cloned().collect()
    }

    pub async fn agents_of_type(&self, agent_type: &str) -> Vec<Agent> {
        let agents = self.agents.read().await;
        agents
            .values()
            .filter(|a| a.agent_type == agent_type)
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        let agents = self.agents.read().await;
        agents.len()
    }

    pub async fn count_by_type(&self) -> HashMap<String, usize> {
        let agents = self.agents.read().await;
        let mut counts = HashMap::new();
        for agent in agents.values() {
            *counts.entry(agent.agent_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Applies a mutation to one agent under the write lock.
    ///
    /// Returns `false` if the agent is not registered.
    pub async fn update<F>(&self, agent_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Agent),
    {
        let mut agents = self.agents.write().await;
        match agents.get_mut(agent_id) {
            Some(agent) => {
                mutate(agent);
                true
            }
            None => false,
        }
    }

    pub async fn increment_load(&self, agent_id: &str) -> bool {
        self.update(agent_id, |a| a.current_load += 1).await
    }

    /// Decrements load, flooring at zero so duplicate completions
    /// cannot drive it negative.
    pub async fn decrement_load(&self, agent_id: &str) -> bool {
        self.update(agent_id, |a| {
            a.current_load = a.current_load.saturating_sub(1)
        })
        .await
    }

    pub async fn record_heartbeat(
        &self,
        agent_id: &str,
        health_score: f64,
        resource_usage: ResourceUsage,
        current_load: usize,
    ) -> bool {
        self.update(agent_id, |a| {
            a.last_heartbeat = Utc::now();
            a.health_score = health_score.clamp(0.0, 1.0);
            a.resource_usage = resource_usage;
            a.current_load = current_load;
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agent(id: &str) -> Agent {
        Agent::new(
            id,
            "claude",
            ["backend".to_string()].into_iter().collect(),
            5,
        )
    }

    fn record(success: bool, ms: u64) -> PerformanceRecord {
        PerformanceRecord {
            task_id: "t".to_string(),
            task_type: "backend".to_string(),
            success,
            completion_time_ms: ms,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_success_rate_empty_history() {
        let agent = test_agent("a1");
        assert!(agent.success_rate().is_none());
    }

    #[test]
    fn test_success_rate_mixed() {
        let mut agent = test_agent("a1");
        agent.record_performance(record(true, 100));
        agent.record_performance(record(true, 200));
        agent.record_performance(record(false, 0));
        let rate = agent.success_rate().unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_average_completion_skips_failures() {
        let mut agent = test_agent("a1");
        agent.record_performance(record(true, 100));
        agent.record_performance(record(false, 9999));
        agent.record_performance(record(true, 300));
        assert_eq!(agent.average_completion_ms(), Some(200.0));
    }

    #[test]
    fn test_performance_window_trims() {
        let mut agent = test_agent("a1");
        for i in 0..150 {
            agent.record_performance(record(true, i));
        }
        assert_eq!(agent.performance_history.len(), PERFORMANCE_WINDOW);
        // Oldest entries are dropped first.
        assert_eq!(agent.performance_history[0].completion_time_ms, 50);
    }

    #[test]
    fn test_load_fraction_clamped() {
        let mut agent = test_agent("a1");
        agent.current_load = 8;
        assert!((agent.load_fraction() - 1.0).abs() < 1e-9);
        agent.current_load = 2;
        assert!((agent.load_fraction() - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_register_and_snapshot() {
        let registry = AgentRegistry::new();
        registry.register(test_agent("a1")).await;
        registry.register(test_agent("a2")).await;
        assert_eq!(registry.count().await, 2);
        assert!(registry.get("a1").await.is_some());
        assert!(registry.get("missing").await.is_none());

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_decrement_load_floors_at_zero() {
        let registry = AgentRegistry::new();
        registry.register(test_agent("a1")).await;
        assert!(registry.decrement_load("a1").await);
        let agent = registry.get("a1").await.unwrap();
        assert_eq!(agent.current_load, 0);
    }

    #[tokio::test]
    async fn test_update_unknown_agent() {
        let registry = AgentRegistry::new();
        assert!(!registry.increment_load("ghost").await);
    }

    #[tokio::test]
    async fn test_count_by_type() {
        let registry = AgentRegistry::new();
        registry.register(test_agent("a1")).await;
        registry.register(test_agent("a2")).await;
        let mut gpt = test_agent("g1");
        gpt.agent_type = "gpt".to_string();
        registry.register(gpt).await;

        let counts = registry.count_by_type().await;
        assert_eq!(counts.get("claude"), Some(&2));
        assert_eq!(counts.get("gpt"), Some(&1));
    }
}
