//! Task definitions for the orchestration engine.
//!
//! This module defines the core task types shared by all four control loops:
//!
//! - `Task`: A unit of work submitted for scheduling
//! - `Priority`: Ordered priority levels with numeric values and SLA windows
//! - `PriorityChange`: A recorded priority transition
//! - `CompletionResult`: Outcome reported when an agent finishes a task

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// Priority levels for tasks, ordered from lowest to highest.
///
/// Each level carries a numeric value used by the score-based priority
/// analysis and an SLA window used by the escalation rules.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Deferred,
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// All levels, sorted descending by value.
    pub const DESCENDING: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Deferred,
    ];

    /// Numeric value of this level, used as the score threshold.
    pub fn value(self) -> f64 {
        match self {
            Priority::Critical => 100.0,
            Priority::High => 80.0,
            Priority::Normal => 60.0,
            Priority::Low => 40.0,
            Priority::Deferred => 20.0,
        }
    }

    /// SLA window in minutes. A task older than this without completion is
    /// considered in breach by the escalation rules.
    pub fn sla_minutes(self) -> i64 {
        match self {
            Priority::Critical => 15,
            Priority::High => 60,
            Priority::Normal => 240,
            Priority::Low => 480,
            Priority::Deferred => 1440,
        }
    }

    /// Maps a score to the highest level whose threshold is at or below it.
    ///
    /// Levels are scanned descending by value; scores below every threshold
    /// fall through to `Deferred`.
    pub fn from_score(score: f64) -> Priority {
        for level in Priority::DESCENDING {
            if score >= level.value() {
                return level;
            }
        }
        Priority::Deferred
    }

    /// The next level up, saturating at `Critical`. Used when requeueing
    /// failed tasks with boosted priority.
    pub fn escalated(self) -> Priority {
        match self {
            Priority::Deferred => Priority::Low,
            Priority::Low => Priority::Normal,
            Priority::Normal => Priority::High,
            Priority::High | Priority::Critical => Priority::Critical,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
            Priority::Deferred => write!(f, "deferred"),
        }
    }
}

/// A recorded priority transition on a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityChange {
    pub old_priority: Priority,
    pub new_priority: Priority,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// A file attached to a task, with its size for complexity analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFile {
    pub path: String,
    #[serde(default)]
    pub size_bytes: u64,
}

impl TaskFile {
    pub fn new(path: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
        }
    }

    /// Whether the file is larger than the 50 KB complexity threshold.
    pub fn is_large(&self) -> bool {
        self.size_bytes > 50 * 1024
    }

    /// Whether the path looks like a source-code file.
    pub fn is_code(&self) -> bool {
        const CODE_EXTENSIONS: [&str; 10] = [
            ".rs", ".py", ".js", ".ts", ".go", ".java", ".c", ".cpp", ".rb", ".sql",
        ];
        CODE_EXTENSIONS.iter().any(|ext| self.path.ends_with(ext))
    }

    /// Whether the path looks like a test file.
    pub fn is_test(&self) -> bool {
        let lower = self.path.to_lowercase();
        lower.contains("test") || lower.contains("spec")
    }
}

fn default_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// A unit of work moving through the scheduler, priority manager,
/// auto-scaler, and workload balancer.
///
/// Tasks are serialized into the store's queues as JSON. Every field that a
/// submitter may omit carries a serde default so externally produced task
/// payloads remain accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier. Assigned by the scheduler when empty.
    #[serde(default)]
    pub id: String,
    /// Task category (e.g. "architecture", "bugfix", "documentation").
    pub task_type: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub required_capabilities: HashSet<String>,
    #[serde(default)]
    pub files: Vec<TaskFile>,
    #[serde(default)]
    pub content: String,
    /// Task ids this task depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Computed complexity in [1.0, 5.0]; 0.0 until the scheduler stamps it.
    #[serde(default)]
    pub complexity: f64,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub predicted_completion_ms: Option<u64>,
    #[serde(default)]
    pub scheduling_score: Option<f64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub failure_count: u32,
    /// Error string recorded by the worker on the most recent failure.
    #[serde(default)]
    pub last_failure: Option<String>,
    #[serde(default)]
    pub priority_history: Vec<PriorityChange>,
    #[serde(default = "default_timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Creates a new task of the given type with a fresh id.
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            priority: Priority::Normal,
            required_capabilities: HashSet::new(),
            files: Vec::new(),
            content: String::new(),
            dependencies: Vec::new(),
            complexity: 0.0,
            assigned_agent: None,
            scheduled_at: None,
            predicted_completion_ms: None,
            scheduling_score: None,
            retry_count: 0,
            failure_count: 0,
            last_failure: None,
            priority_history: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_files(mut self, files: Vec<TaskFile>) -> Self {
        self.files = files;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Assigns a fresh id if the submitter left it empty.
    pub fn ensure_id(&mut self) -> &str {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        &self.id
    }

    /// Age of the task, measured from `scheduled_at` when set, otherwise
    /// from creation.
    pub fn age(&self) -> chrono::Duration {
        let since = self.scheduled_at.unwrap_or(self.created_at);
        Utc::now() - since
    }

    /// Records a priority transition and applies the new level.
    ///
    /// Returns `true` if the priority actually changed. The history entry is
    /// appended either way so repeated escalation attempts stay auditable.
    pub fn apply_priority_change(&mut self, new_priority: Priority, reason: &str) -> bool {
        let old = self.priority;
        self.priority_history.push(PriorityChange {
            old_priority: old,
            new_priority,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        self.priority = new_priority;
        old != new_priority
    }

    /// Number of non-empty content lines, used by complexity analysis.
    pub fn content_lines(&self) -> usize {
        self.content.lines().filter(|l| !l.trim().is_empty()).count()
    }
}

/// Outcome reported when an agent finishes (or fails) a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResult {
    pub success: bool,
    pub completion_time_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl CompletionResult {
    pub fn success(completion_time_ms: u64) -> Self {
        Self {
            success: true,
            completion_time_ms,
            error: None,
        }
    }

    pub fn failure(completion_time_ms: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            completion_time_ms,
            error: Some(error.into()),
        }
    }
}

/// Placement summary returned by `schedule_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulePlacement {
    pub task_id: String,
    pub assigned_agent: String,
    pub queue_position: usize,
    pub predicted_completion_ms: u64,
}

/// Insertion-ordered set of task ids with a fixed capacity.
///
/// Once the capacity is reached the oldest ids fall out, so dedupe
/// bookkeeping stays bounded over the life of the process. Callers must
/// treat eviction as "no longer remembered", not as "never seen".
#[derive(Debug)]
pub struct RecentIds {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Records an id, evicting the oldest if over capacity. Returns
    /// `false` if the id was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert!(Priority::Low > Priority::Deferred);
    }

    #[test]
    fn test_priority_from_score() {
        assert_eq!(Priority::from_score(100.0), Priority::Critical);
        assert_eq!(Priority::from_score(150.0), Priority::Critical);
        assert_eq!(Priority::from_score(85.0), Priority::High);
        assert_eq!(Priority::from_score(60.0), Priority::Normal);
        assert_eq!(Priority::from_score(45.0), Priority::Low);
        assert_eq!(Priority::from_score(10.0), Priority::Deferred);
    }

    #[test]
    fn test_priority_escalated_saturates() {
        assert_eq!(Priority::Deferred.escalated(), Priority::Low);
        assert_eq!(Priority::High.escalated(), Priority::Critical);
        assert_eq!(Priority::Critical.escalated(), Priority::Critical);
    }

    #[test]
    fn test_priority_display_matches_queue_keys() {
        assert_eq!(Priority::Critical.to_string(), "critical");
        assert_eq!(Priority::Deferred.to_string(), "deferred");
    }

    #[test]
    fn test_task_file_classification() {
        let large = TaskFile::new("src/auth.rs", 60 * 1024);
        assert!(large.is_large());
        assert!(large.is_code());
        assert!(!large.is_test());

        let test = TaskFile::new("tests/auth_test.py", 1024);
        assert!(test.is_test());
        assert!(test.is_code());
        assert!(!test.is_large());
    }

    #[test]
    fn test_task_ensure_id() {
        let mut task = Task::new("bugfix");
        let original = task.id.clone();
        assert!(!original.is_empty());
        task.ensure_id();
        assert_eq!(task.id, original);

        task.id.clear();
        task.ensure_id();
        assert!(!task.id.is_empty());
        assert_ne!(task.id, original);
    }

    #[test]
    fn test_apply_priority_change_records_history() {
        let mut task = Task::new("bugfix");
        let changed = task.apply_priority_change(Priority::High, "sla_breach");
        assert!(changed);
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.priority_history.len(), 1);
        assert_eq!(task.priority_history[0].old_priority, Priority::Normal);
        assert_eq!(task.priority_history[0].reason, "sla_breach");

        // Same level again: history grows, but no change reported.
        let changed = task.apply_priority_change(Priority::High, "age_based");
        assert!(!changed);
        assert_eq!(task.priority_history.len(), 2);
    }

    #[test]
    fn test_task_serialization_tolerates_sparse_payloads() {
        let json = r#"{"task_type": "documentation", "content": "update the readme"}"#;
        let task: Task = serde_json::from_str(json).expect("sparse payload should parse");
        assert!(task.id.is_empty());
        assert_eq!(task.priority, Priority::Normal);
        assert!(task.files.is_empty());
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn test_content_lines_skips_blanks() {
        let task = Task::new("feature").with_content("a\n\n  \nb\nc");
        assert_eq!(task.content_lines(), 3);
    }

    #[test]
    fn test_recent_ids_dedupes() {
        let mut seen = RecentIds::new(10);
        assert!(seen.insert("t1"));
        assert!(!seen.insert("t1"));
        assert!(seen.contains("t1"));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_recent_ids_evicts_oldest_at_capacity() {
        let mut seen = RecentIds::new(3);
        for id in ["t1", "t2", "t3", "t4"] {
            assert!(seen.insert(id));
        }
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains("t1"));
        assert!(seen.contains("t2"));
        assert!(seen.contains("t4"));
        // An evicted id can be recorded again.
        assert!(seen.insert("t1"));
    }
}
