//! Learned scheduling model.
//!
//! The model keeps an exponential moving average of completion times per
//! `(task type, complexity bucket)` and a weight per agent reflecting how
//! its actual completion times compare to predictions. Both feed the
//! scheduler's completion-time predictions and agent scoring.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Relative blend of signals in a completion-time prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelWeights {
    /// Weight of the complexity-derived baseline.
    pub baseline: f64,
    /// Weight of the agent's own history for the task type.
    pub agent_history: f64,
    /// Weight of the learned per-bucket average.
    pub learned: f64,
}

impl Default for ModelWeights {
    fn default() -> Self {
        Self {
            baseline: 0.3,
            agent_history: 0.3,
            learned: 0.4,
        }
    }
}

/// Learned state shared across scheduling decisions.
///
/// Serialized as a whole to the store so a restarted engine resumes with
/// its accumulated knowledge instead of cold predictions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingModel {
    /// EMA of completion times keyed by `<task_type>_<complexity bucket>`.
    pub completion_times_ms: HashMap<String, f64>,
    /// Per-agent performance weight; 1.0 is neutral, above 1.0 means the
    /// agent finishes faster than predicted.
    pub agent_weights: HashMap<String, f64>,
    /// Blend weights for prediction signals.
    pub weights: ModelWeights,
    /// EMA learning rate applied to new samples.
    pub learning_rate: f64,
}

impl SchedulingModel {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            completion_times_ms: HashMap::new(),
            agent_weights: HashMap::new(),
            weights: ModelWeights::default(),
            learning_rate,
        }
    }

    /// Bucket key for a task type at a complexity level. Complexity is
    /// floored so e.g. 2.3 and 2.9 share the `_2` bucket.
    pub fn bucket_key(task_type: &str, complexity: f64) -> String {
        format!("{task_type}_{}", complexity.floor() as i64)
    }

    /// Learned average for a bucket, if any sample has landed there.
    pub fn bucket_average(&self, task_type: &str, complexity: f64) -> Option<f64> {
        self.completion_times_ms
            .get(&Self::bucket_key(task_type, complexity))
            .copied()
    }

    /// Folds an observed completion time into the bucket's EMA. The first
    /// sample seeds the bucket directly.
    pub fn observe_completion(&mut self, task_type: &str, complexity: f64, actual_ms: f64) {
        let key = Self::bucket_key(task_type, complexity);
        let rate = self.learning_rate;
        self.completion_times_ms
            .entry(key)
            .and_modify(|avg| *avg = *avg * (1.0 - rate) + actual_ms * rate)
            .or_insert(actual_ms);
    }

    /// Weight for an agent; unknown agents are neutral.
    pub fn agent_weight(&self, agent_id: &str) -> f64 {
        self.agent_weights.get(agent_id).copied().unwrap_or(1.0)
    }

    /// Folds a performance score into an agent's weight EMA. Scores above
    /// 1.0 (finished faster than predicted) pull the weight up.
    pub fn observe_agent_performance(&mut self, agent_id: &str, score: f64) {
        let rate = self.learning_rate;
        self.agent_weights
            .entry(agent_id.to_string())
            .and_modify(|w| *w = *w * (1.0 - rate) + score * rate)
            .or_insert(score);
    }

    /// Drops weights for agents no longer in the fleet.
    pub fn retain_agents(&mut self, live: &HashSet<String>) {
        self.agent_weights.retain(|id, _| live.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_key_floors_complexity() {
        assert_eq!(SchedulingModel::bucket_key("backend", 2.3), "backend_2");
        assert_eq!(SchedulingModel::bucket_key("backend", 2.9), "backend_2");
        assert_eq!(SchedulingModel::bucket_key("backend", 3.0), "backend_3");
    }

    #[test]
    fn test_first_sample_seeds_bucket() {
        let mut model = SchedulingModel::new(0.3);
        model.observe_completion("backend", 2.0, 60_000.0);
        assert_eq!(model.bucket_average("backend", 2.5), Some(60_000.0));
    }

    #[test]
    fn test_ema_moves_toward_samples() {
        let mut model = SchedulingModel::new(0.3);
        model.observe_completion("backend", 2.0, 100_000.0);
        model.observe_completion("backend", 2.0, 50_000.0);
        // 100000 * 0.7 + 50000 * 0.3 = 85000
        let avg = model.bucket_average("backend", 2.0).unwrap();
        assert!((avg - 85_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_agent_weight_is_neutral() {
        let model = SchedulingModel::new(0.3);
        assert!((model.agent_weight("ghost") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_agent_weight_ema() {
        let mut model = SchedulingModel::new(0.5);
        model.observe_agent_performance("a1", 2.0);
        assert!((model.agent_weight("a1") - 2.0).abs() < 1e-9);
        model.observe_agent_performance("a1", 1.0);
        assert!((model.agent_weight("a1") - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_retain_agents_prunes_departed() {
        let mut model = SchedulingModel::new(0.3);
        model.observe_agent_performance("a1", 1.2);
        model.observe_agent_performance("a2", 0.8);
        let live: HashSet<String> = ["a1".to_string()].into_iter().collect();
        model.retain_agents(&live);
        assert!(model.agent_weights.contains_key("a1"));
        assert!(!model.agent_weights.contains_key("a2"));
    }
}
