//! Content-based task classification.
//!
//! Tasks are matched against named regex categories; the category with
//! the most matches becomes the primary type and the runners-up become
//! secondary types. Coarse complexity and urgency tags come from text
//! length and keyword presence. Classification drives the balancer's
//! capability-fit scoring.

use regex::Regex;

use crate::config::AgentTypeConfig;
use crate::error::BalanceError;
use crate::task::Task;

/// Minimum fit score at which a type is considered suitable at all.
pub const SUITABILITY_FLOOR: f64 = 0.3;
/// Stricter suitability gate used by cross-type transfers.
pub const TRANSFER_SUITABILITY: f64 = 0.4;

/// Coarse task size derived from content length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplexityTag {
    Low,
    Medium,
    High,
}

/// Coarse urgency derived from keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrgencyTag {
    Normal,
    Urgent,
}

/// Classification result for one task.
#[derive(Debug, Clone)]
pub struct TaskAnalysis {
    pub primary_type: String,
    /// Up to two runner-up categories.
    pub secondary_types: Vec<String>,
    pub complexity: ComplexityTag,
    pub urgency: UrgencyTag,
    pub keywords: Vec<String>,
}

struct Category {
    name: &'static str,
    pattern: Regex,
}

/// Matches task text against the category patterns.
pub struct TaskClassifier {
    categories: Vec<Category>,
    urgency_pattern: Regex,
}

impl TaskClassifier {
    /// Compiles the category patterns.
    ///
    /// # Errors
    ///
    /// Returns `BalanceError::Pattern` if any pattern fails to compile.
    pub fn new() -> Result<Self, BalanceError> {
        let specs: [(&'static str, &'static str); 11] = [
            (
                "architecture",
                r"(?i)\b(architect|design pattern|system design|structure|module layout|blueprint)\b",
            ),
            (
                "refactoring",
                r"(?i)\b(refactor|restructure|clean ?up|rewrite|simplif|extract)\b",
            ),
            (
                "documentation",
                r"(?i)\b(document|docs|readme|changelog|comment|tutorial|guide)\b",
            ),
            (
                "security",
                r"(?i)\b(security|vulnerab|exploit|injection|auth[a-z]*|encrypt|sanitiz)\b",
            ),
            (
                "testing",
                r"(?i)\b(test|spec|coverage|assert|mock|fixture|regression)\b",
            ),
            (
                "debugging",
                r"(?i)\b(debug|bug|crash|stack ?trace|panic|exception|reproduce)\b",
            ),
            (
                "performance",
                r"(?i)\b(performance|optimi[sz]|slow|latency|throughput|profil|memory leak)\b",
            ),
            (
                "api",
                r"(?i)\b(api|endpoint|rest|graphql|route|request handler|webhook)\b",
            ),
            (
                "frontend",
                r"(?i)\b(frontend|ui|ux|css|component|render|browser|react|dom)\b",
            ),
            (
                "backend",
                r"(?i)\b(backend|server|database|query|migration|service|worker|queue)\b",
            ),
            (
                "devops",
                r"(?i)\b(deploy|docker|kubernetes|ci\b|cd\b|pipeline|terraform|infra)\b",
            ),
        ];

        let mut categories = Vec::with_capacity(specs.len());
        for (name, pattern) in specs {
            categories.push(Category {
                name,
                pattern: Regex::new(pattern)?,
            });
        }
        let urgency_pattern =
            Regex::new(r"(?i)\b(urgent|asap|immediately|critical|emergency|blocker)\b")?;
        Ok(Self {
            categories,
            urgency_pattern,
        })
    }

    /// Classifies a task from its type name, content, and file paths.
    pub fn analyze(&self, task: &Task) -> TaskAnalysis {
        let mut text = String::with_capacity(task.content.len() + 64);
        text.push_str(&task.task_type);
        text.push(' ');
        text.push_str(&task.content);
        for file in &task.files {
            text.push(' ');
            text.push_str(&file.path);
        }

        let mut scored: Vec<(&'static str, usize)> = self
            .categories
            .iter()
            .map(|c| (c.name, c.pattern.find_iter(&text).count()))
            .filter(|(_, count)| *count > 0)
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));

        let primary_type = scored
            .first()
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| task.task_type.clone());
        let secondary_types: Vec<String> = scored
            .iter()
            .skip(1)
            .take(2)
            .map(|(name, _)| name.to_string())
            .collect();
        let keywords: Vec<String> = scored.iter().map(|(name, _)| name.to_string()).collect();

        let complexity = match task.content.len() {
            0..=500 => ComplexityTag::Low,
            501..=3000 => ComplexityTag::Medium,
            _ => ComplexityTag::High,
        };
        let urgency = if self.urgency_pattern.is_match(&text) {
            UrgencyTag::Urgent
        } else {
            UrgencyTag::Normal
        };

        TaskAnalysis {
            primary_type,
            secondary_types,
            complexity,
            urgency,
            keywords,
        }
    }
}

/// Fit of a task analysis against one agent type's capability tiers,
/// discounted by that type's current load.
///
/// A primary-tier match on the primary type scores 1.0, secondary 0.7,
/// emergency 0.4; each secondary-type overlap adds smaller credit. The
/// whole score is multiplied by `1 - 0.5 * min(1, load / capacity)`.
pub fn capability_score(
    analysis: &TaskAnalysis,
    type_config: &AgentTypeConfig,
    current_load: usize,
    max_tasks_per_agent: usize,
) -> f64 {
    let tier = |capability: &str| -> f64 {
        if type_config
            .primary_capabilities
            .iter()
            .any(|c| c == capability)
        {
            1.0
        } else if type_config
            .secondary_capabilities
            .iter()
            .any(|c| c == capability)
        {
            0.7
        } else if type_config
            .emergency_capabilities
            .iter()
            .any(|c| c == capability)
        {
            0.4
        } else {
            0.0
        }
    };

    let mut score = tier(&analysis.primary_type);
    for secondary in &analysis.secondary_types {
        // Partial credit at 15% of the tier value.
        score += tier(secondary) * 0.15;
    }

    let capacity = max_tasks_per_agent.max(1) as f64;
    let load_discount = 1.0 - 0.5 * (current_load as f64 / capacity).min(1.0);
    score * load_discount
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> TaskClassifier {
        TaskClassifier::new().unwrap()
    }

    #[test]
    fn test_primary_type_from_dominant_category() {
        let task = Task::new("general").with_content(
            "Debug the crash in the worker: the stack trace shows a panic \
             while reproducing the bug",
        );
        let analysis = classifier().analyze(&task);
        assert_eq!(analysis.primary_type, "debugging");
    }

    #[test]
    fn test_secondary_types_are_runners_up() {
        let task = Task::new("general").with_content(
            "Refactor the api endpoint handlers and add tests covering the \
             rest routes; refactor the request handler module too",
        );
        let analysis = classifier().analyze(&task);
        assert_eq!(analysis.primary_type, "api");
        assert!(analysis.secondary_types.len() <= 2);
        assert!(analysis.secondary_types.contains(&"refactoring".to_string()));
    }

    #[test]
    fn test_no_match_falls_back_to_task_type() {
        let task = Task::new("backend").with_content("zzzz qqqq");
        let analysis = classifier().analyze(&task);
        assert_eq!(analysis.primary_type, "backend");
        assert!(analysis.secondary_types.is_empty());
    }

    #[test]
    fn test_urgency_detection() {
        let calm = Task::new("backend").with_content("add a field to the model");
        assert_eq!(classifier().analyze(&calm).urgency, UrgencyTag::Normal);

        let urgent = Task::new("backend").with_content("urgent: production is down");
        assert_eq!(classifier().analyze(&urgent).urgency, UrgencyTag::Urgent);
    }

    #[test]
    fn test_complexity_from_length() {
        let short = Task::new("backend").with_content("tiny");
        assert_eq!(classifier().analyze(&short).complexity, ComplexityTag::Low);

        let long = Task::new("backend").with_content("word ".repeat(1000));
        assert_eq!(classifier().analyze(&long).complexity, ComplexityTag::High);
    }

    #[test]
    fn test_capability_score_tiers() {
        let cfg = AgentTypeConfig::new("claude").with_tiers(
            ["architecture"],
            ["security"],
            ["backend"],
        );
        let analysis = |primary: &str| TaskAnalysis {
            primary_type: primary.to_string(),
            secondary_types: vec![],
            complexity: ComplexityTag::Low,
            urgency: UrgencyTag::Normal,
            keywords: vec![],
        };

        assert!((capability_score(&analysis("architecture"), &cfg, 0, 10) - 1.0).abs() < 1e-9);
        assert!((capability_score(&analysis("security"), &cfg, 0, 10) - 0.7).abs() < 1e-9);
        assert!((capability_score(&analysis("backend"), &cfg, 0, 10) - 0.4).abs() < 1e-9);
        assert_eq!(capability_score(&analysis("frontend"), &cfg, 0, 10), 0.0);
    }

    #[test]
    fn test_capability_score_load_discount() {
        let cfg = AgentTypeConfig::new("claude").with_tiers(["architecture"], [], []);
        let analysis = TaskAnalysis {
            primary_type: "architecture".to_string(),
            secondary_types: vec![],
            complexity: ComplexityTag::Low,
            urgency: UrgencyTag::Normal,
            keywords: vec![],
        };
        // Full load halves the score; overload clamps at half.
        assert!((capability_score(&analysis, &cfg, 10, 10) - 0.5).abs() < 1e-9);
        assert!((capability_score(&analysis, &cfg, 50, 10) - 0.5).abs() < 1e-9);
        assert!((capability_score(&analysis, &cfg, 5, 10) - 0.75).abs() < 1e-9);
    }
}
