//! Priority manager: initial scoring, dependency bookkeeping, and the
//! periodic escalation loop.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::PriorityError;
use crate::metrics;
use crate::priority::rules::{
    default_rules, EscalationContext, EscalationOutcome, EscalationRule, PriorityRules,
};
use crate::store::QueueStore;
use crate::task::{Priority, RecentIds, Task};

/// Starting score before any rule applies; maps to Normal.
const BASE_SCORE: f64 = 60.0;
/// Bonus per dependent waiting on this task.
const DEPENDENT_BONUS: f64 = 5.0;
/// Bonus per critical-priority dependency.
const CRITICAL_DEPENDENCY_BONUS: f64 = 15.0;
/// Cap on the combined dependency bonus.
const DEPENDENCY_BONUS_CAP: f64 = 30.0;
/// Cap on the combined business-impact bonus.
const BUSINESS_BONUS_CAP: f64 = 25.0;
/// How many completed task ids are remembered for dependency checks.
const COMPLETION_CACHE_CAP: usize = 10_000;

/// Aggregate priority statistics for dashboards and the CLI.
#[derive(Debug, Clone, Default)]
pub struct PriorityStats {
    pub tracked_tasks: usize,
    pub total_escalations: u64,
    pub total_priority_changes: u64,
}

/// Scores tasks, tracks dependencies, and escalates over time.
pub struct PriorityManager {
    store: QueueStore,
    rules: PriorityRules,
    escalation_rules: Vec<EscalationRule>,
    /// Tasks not yet completed or permanently failed.
    active: RwLock<HashMap<String, Task>>,
    /// Recently completed task ids, consulted by the dependency checks.
    completed: RwLock<RecentIds>,
    /// Forward adjacency: dependency id -> ids of tasks waiting on it.
    dependents: RwLock<HashMap<String, HashSet<String>>>,
    escalating: AtomicBool,
    stats: Mutex<PriorityStats>,
}

impl PriorityManager {
    pub fn new(store: QueueStore) -> Self {
        Self {
            store,
            rules: PriorityRules::default(),
            escalation_rules: default_rules(),
            active: RwLock::new(HashMap::new()),
            completed: RwLock::new(RecentIds::new(COMPLETION_CACHE_CAP)),
            dependents: RwLock::new(HashMap::new()),
            escalating: AtomicBool::new(false),
            stats: Mutex::new(PriorityStats::default()),
        }
    }

    pub fn with_rules(mut self, rules: PriorityRules, escalation: Vec<EscalationRule>) -> Self {
        self.rules = rules;
        self.escalation_rules = escalation;
        self
    }

    pub async fn stats(&self) -> PriorityStats {
        let mut stats = self.stats.lock().await.clone();
        stats.tracked_tasks = self.active.read().await.len();
        stats
    }

    // ---- Initial scoring ----

    /// Computes a task's priority score from the rule tables plus
    /// dependency and business-impact bonuses, then maps it to a level.
    ///
    /// Rules only ever raise the running score within one pass.
    pub async fn analyze_task_priority(&self, task: &Task) -> (Priority, f64) {
        let mut score = BASE_SCORE;

        for file in &task.files {
            for (prefix, rule_score) in &self.rules.path_rules {
                if file.path.starts_with(prefix.as_str()) && *rule_score > score {
                    score = *rule_score;
                }
            }
        }

        let content = task.content.to_lowercase();
        for (keyword, rule_score) in &self.rules.keyword_rules {
            if content.contains(keyword.as_str()) && *rule_score > score {
                score = *rule_score;
            }
        }

        for (task_type, rule_score) in &self.rules.type_rules {
            if task.task_type == *task_type && *rule_score > score {
                score = *rule_score;
            }
        }

        // An explicit priority on the submission acts as another rule.
        let explicit = task.priority.value();
        if explicit > score {
            score = explicit;
        }

        score += self.dependency_bonus(task).await;
        score += Self::business_bonus(&content);

        (Priority::from_score(score), score)
    }

    async fn dependency_bonus(&self, task: &Task) -> f64 {
        let dependents = self.dependents.read().await;
        let blocked = dependents
            .get(&task.id)
            .map(|d| d.len())
            .unwrap_or(0);
        let mut bonus = DEPENDENT_BONUS * blocked as f64;

        let active = self.active.read().await;
        for dep_id in &task.dependencies {
            if let Some(dep) = active.get(dep_id) {
                if dep.priority == Priority::Critical {
                    bonus += CRITICAL_DEPENDENCY_BONUS;
                }
            }
        }
        bonus.min(DEPENDENCY_BONUS_CAP)
    }

    fn business_bonus(content: &str) -> f64 {
        let mut bonus: f64 = 0.0;
        for word in ["user", "customer", "revenue", "outage", "production"] {
            if content.contains(word) {
                bonus += 5.0;
            }
        }
        for word in ["ui", "interface", "frontend"] {
            if content.contains(word) {
                bonus += 10.0;
                break;
            }
        }
        for word in ["api", "endpoint"] {
            if content.contains(word) {
                bonus += 8.0;
                break;
            }
        }
        bonus.min(BUSINESS_BONUS_CAP)
    }

    // ---- Tracking and dependencies ----

    /// Starts tracking a task and registers its dependency edges.
    pub async fn track(&self, task: Task) {
        {
            let mut dependents = self.dependents.write().await;
            for dep in &task.dependencies {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(task.id.clone());
            }
        }
        let mut active = self.active.write().await;
        active.insert(task.id.clone(), task);
    }

    /// Marks a task completed, releasing anything blocked on it.
    pub async fn mark_completed(&self, task_id: &str) {
        let removed = {
            let mut active = self.active.write().await;
            active.remove(task_id)
        };
        if let Some(task) = &removed {
            let mut dependents = self.dependents.write().await;
            for dep in &task.dependencies {
                if let Some(set) = dependents.get_mut(dep) {
                    set.remove(task_id);
                }
            }
        }
        let mut completed = self.completed.write().await;
        completed.insert(task_id);
    }

    pub async fn add_task_dependency(
        &self,
        task_id: &str,
        dependency_id: &str,
    ) -> Result<(), PriorityError> {
        let mut active = self.active.write().await;
        let task = active
            .get_mut(task_id)
            .ok_or_else(|| PriorityError::TaskNotFound(task_id.to_string()))?;
        if !task.dependencies.contains(&dependency_id.to_string()) {
            task.dependencies.push(dependency_id.to_string());
        }
        drop(active);

        let mut dependents = self.dependents.write().await;
        dependents
            .entry(dependency_id.to_string())
            .or_default()
            .insert(task_id.to_string());
        Ok(())
    }

    pub async fn remove_task_dependency(
        &self,
        task_id: &str,
        dependency_id: &str,
    ) -> Result<(), PriorityError> {
        let mut active = self.active.write().await;
        let task = active
            .get_mut(task_id)
            .ok_or_else(|| PriorityError::TaskNotFound(task_id.to_string()))?;
        task.dependencies.retain(|d| d != dependency_id);
        drop(active);

        let mut dependents = self.dependents.write().await;
        if let Some(set) = dependents.get_mut(dependency_id) {
            set.remove(task_id);
        }
        Ok(())
    }

    /// Number of tracked tasks waiting on the given task.
    pub async fn blocked_dependents(&self, task_id: &str) -> usize {
        let dependents = self.dependents.read().await;
        dependents.get(task_id).map(|d| d.len()).unwrap_or(0)
    }

    async fn has_blocked_dependencies(&self, task: &Task) -> bool {
        if task.dependencies.is_empty() {
            return false;
        }
        let completed = self.completed.read().await;
        task.dependencies.iter().any(|d| !completed.contains(d))
    }

    // ---- Escalation ----

    /// Runs every escalation rule over every active task, applying
    /// upgrades only. Returns the number of escalated tasks.
    pub async fn run_escalation_cycle(&self) -> Result<usize, PriorityError> {
        if self
            .escalating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Escalation cycle already in flight, skipping");
            return Ok(0);
        }
        let result = self.escalation_inner().await;
        self.escalating.store(false, Ordering::SeqCst);
        result
    }

    async fn escalation_inner(&self) -> Result<usize, PriorityError> {
        let snapshot: Vec<Task> = {
            let active = self.active.read().await;
            active.values().cloned().collect()
        };

        let mut escalated = 0;
        for task in snapshot {
            let ctx = EscalationContext {
                age_minutes: task.age().num_minutes(),
                failures: task.failure_count,
                retries: task.retry_count,
                blocked_dependents: self.blocked_dependents(&task.id).await,
                has_blocked_dependencies: self.has_blocked_dependencies(&task).await,
                complexity: task.complexity,
                current_priority: task.priority,
            };

            let mut score = task.priority.value();
            let mut forced: Option<Priority> = None;
            let mut reasons: Vec<String> = Vec::new();

            for rule in &self.escalation_rules {
                match rule.evaluate(&ctx) {
                    Some(EscalationOutcome::Boost(boost)) => {
                        score += boost;
                        reasons.push(rule.label().to_string());
                        metrics::record_escalation(rule.label());
                    }
                    Some(EscalationOutcome::ForceAtLeast(level)) => {
                        forced = Some(forced.map_or(level, |f| f.max(level)));
                        reasons.push(rule.label().to_string());
                        metrics::record_escalation(rule.label());
                    }
                    None => {}
                }
            }

            let mut new_priority = Priority::from_score(score);
            if let Some(level) = forced {
                new_priority = new_priority.max(level);
            }

            // Escalation only ever raises priority.
            if new_priority > task.priority {
                let reason = format!("escalation: {}", reasons.join(", "));
                self.update_task_priority(&task.id, new_priority, &reason)
                    .await?;
                escalated += 1;
            }
        }

        if escalated > 0 {
            let mut stats = self.stats.lock().await;
            stats.total_escalations += escalated as u64;
        }
        Ok(escalated)
    }

    /// Changes a task's priority, recording the change and relocating it
    /// between its agent's per-priority queues. The relocated entry gets
    /// a fresh enqueue timestamp, so it joins the back of its new band.
    pub async fn update_task_priority(
        &self,
        task_id: &str,
        new_priority: Priority,
        reason: &str,
    ) -> Result<(), PriorityError> {
        let (changed, updated) = {
            let mut active = self.active.write().await;
            let task = active
                .get_mut(task_id)
                .ok_or_else(|| PriorityError::TaskNotFound(task_id.to_string()))?;
            let changed = task.apply_priority_change(new_priority, reason);
            (changed, task.clone())
        };

        self.store.set_task_priority(task_id, new_priority).await?;

        if changed {
            if let Some(agent_id) = &updated.assigned_agent {
                // remove_assigned scans the old bands; a miss means a
                // worker already picked the task up.
                match self.store.remove_assigned(agent_id, task_id).await? {
                    Some(_) => {
                        self.store.enqueue_assigned(agent_id, &updated).await?;
                    }
                    None => {
                        warn!(
                            task_id = %task_id,
                            agent = %agent_id,
                            "Priority change could not relocate task; already dequeued"
                        );
                    }
                }
            }
            let mut stats = self.stats.lock().await;
            stats.total_priority_changes += 1;
            info!(
                task_id = %task_id,
                new_priority = %new_priority,
                reason = %reason,
                "Task priority updated"
            );
        }
        Ok(())
    }

    /// Clones a tracked task, if it is still active.
    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        let active = self.active.read().await;
        active.get(task_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_business_bonus_capped() {
        let content = "user revenue outage production ui api customer";
        assert_eq!(PriorityManager::business_bonus(content), BUSINESS_BONUS_CAP);
    }

    #[test]
    fn test_business_bonus_components() {
        assert_eq!(PriorityManager::business_bonus("fix the ui"), 10.0);
        assert_eq!(PriorityManager::business_bonus("api endpoint"), 8.0);
        assert_eq!(PriorityManager::business_bonus("user report"), 5.0);
        assert_eq!(PriorityManager::business_bonus("nothing special"), 0.0);
    }
}
