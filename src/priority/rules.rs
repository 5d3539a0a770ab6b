//! Priority scoring tables and escalation rules.
//!
//! Initial priority comes from score tables matched against file paths,
//! content keywords, and task types. Escalation rules run periodically
//! over active tasks; each evaluates against a small context snapshot
//! and yields either a score boost or a forced minimum priority.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::task::Priority;

/// Score tables consulted by the initial priority analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityRules {
    /// Path-prefix rules, checked against each attached file path.
    pub path_rules: Vec<(String, f64)>,
    /// Keyword rules, checked against task content (case-insensitive).
    pub keyword_rules: Vec<(String, f64)>,
    /// Task-type rules.
    pub type_rules: Vec<(String, f64)>,
}

impl Default for PriorityRules {
    fn default() -> Self {
        Self {
            path_rules: vec![
                ("security/".to_string(), 100.0),
                ("payments/".to_string(), 90.0),
                ("auth/".to_string(), 90.0),
                ("api/".to_string(), 80.0),
                ("core/".to_string(), 80.0),
                ("docs/".to_string(), 40.0),
            ],
            keyword_rules: vec![
                ("vulnerability".to_string(), 100.0),
                ("data loss".to_string(), 95.0),
                ("outage".to_string(), 95.0),
                ("crash".to_string(), 90.0),
                ("security".to_string(), 90.0),
                ("payment".to_string(), 85.0),
                ("regression".to_string(), 80.0),
                ("deadline".to_string(), 75.0),
                ("bug".to_string(), 70.0),
                ("cleanup".to_string(), 40.0),
                ("typo".to_string(), 30.0),
            ],
            type_rules: vec![
                ("security".to_string(), 95.0),
                ("debugging".to_string(), 85.0),
                ("api".to_string(), 80.0),
                ("performance".to_string(), 80.0),
                ("architecture".to_string(), 75.0),
                ("backend".to_string(), 70.0),
                ("devops".to_string(), 70.0),
                ("frontend".to_string(), 65.0),
                ("testing".to_string(), 60.0),
                ("refactoring".to_string(), 55.0),
                ("documentation".to_string(), 40.0),
            ],
        }
    }
}

/// Task field a custom escalation condition can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskVariable {
    AgeMinutes,
    Failures,
    Retries,
    Dependents,
    Complexity,
}

impl FromStr for TaskVariable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "age" | "age_minutes" => Ok(TaskVariable::AgeMinutes),
            "failures" => Ok(TaskVariable::Failures),
            "retries" => Ok(TaskVariable::Retries),
            "dependents" => Ok(TaskVariable::Dependents),
            "complexity" => Ok(TaskVariable::Complexity),
            other => Err(format!("unknown task variable '{other}'")),
        }
    }
}

/// Comparison operator for custom conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl Comparison {
    pub fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Gt => lhs > rhs,
            Comparison::Gte => lhs >= rhs,
            Comparison::Lt => lhs < rhs,
            Comparison::Lte => lhs <= rhs,
            Comparison::Eq => (lhs - rhs).abs() < f64::EPSILON,
        }
    }
}

impl FromStr for Comparison {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" => Ok(Comparison::Gt),
            ">=" => Ok(Comparison::Gte),
            "<" => Ok(Comparison::Lt),
            "<=" => Ok(Comparison::Lte),
            "==" | "=" => Ok(Comparison::Eq),
            other => Err(format!("unknown comparison '{other}'")),
        }
    }
}

/// Parses a `variable OP number` condition, e.g. `"failures > 2"`.
pub fn parse_condition(expr: &str) -> Result<(TaskVariable, Comparison, f64), String> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(format!("condition '{expr}' is not of the form 'var OP number'"));
    }
    let variable = parts[0].parse()?;
    let op = parts[1].parse()?;
    let value: f64 = parts[2]
        .parse()
        .map_err(|_| format!("'{}' is not a number", parts[2]))?;
    Ok((variable, op, value))
}

/// One escalation rule evaluated against every active task each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationRule {
    /// Tasks older than the limit get a score boost.
    AgeBased { max_age_minutes: i64, boost: f64 },
    /// Tasks with more than `threshold` failures get a score boost.
    FailureCount { threshold: u32, boost: f64 },
    /// Tasks past their priority level's SLA are forced to at least High.
    SlaBreach,
    /// Tasks with incomplete dependencies are forced to Critical.
    BlockedDependencies,
    /// Generic `variable OP number` condition with a score boost.
    Custom {
        name: String,
        variable: TaskVariable,
        op: Comparison,
        value: f64,
        boost: f64,
    },
}

impl EscalationRule {
    /// Parses a custom rule from a condition string.
    pub fn custom(name: impl Into<String>, condition: &str, boost: f64) -> Result<Self, String> {
        let (variable, op, value) = parse_condition(condition)?;
        Ok(EscalationRule::Custom {
            name: name.into(),
            variable,
            op,
            value,
            boost,
        })
    }

    /// Short label used in logs and metrics.
    pub fn label(&self) -> &str {
        match self {
            EscalationRule::AgeBased { .. } => "age",
            EscalationRule::FailureCount { .. } => "failures",
            EscalationRule::SlaBreach => "sla_breach",
            EscalationRule::BlockedDependencies => "dependencies_blocked",
            EscalationRule::Custom { name, .. } => name,
        }
    }
}

/// Snapshot of the task fields rules evaluate against.
#[derive(Debug, Clone, Copy)]
pub struct EscalationContext {
    pub age_minutes: i64,
    pub failures: u32,
    pub retries: u32,
    pub blocked_dependents: usize,
    pub has_blocked_dependencies: bool,
    pub complexity: f64,
    pub current_priority: Priority,
}

impl EscalationContext {
    fn variable(&self, var: TaskVariable) -> f64 {
        match var {
            TaskVariable::AgeMinutes => self.age_minutes as f64,
            TaskVariable::Failures => self.failures as f64,
            TaskVariable::Retries => self.retries as f64,
            TaskVariable::Dependents => self.blocked_dependents as f64,
            TaskVariable::Complexity => self.complexity,
        }
    }
}

/// What an escalation rule wants done to a task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EscalationOutcome {
    /// Add to the task's priority score before re-mapping to a level.
    Boost(f64),
    /// Raise the task at least to this priority.
    ForceAtLeast(Priority),
}

impl EscalationRule {
    /// Evaluates the rule, returning the outcome if it fires.
    pub fn evaluate(&self, ctx: &EscalationContext) -> Option<EscalationOutcome> {
        match self {
            EscalationRule::AgeBased {
                max_age_minutes,
                boost,
            } => (ctx.age_minutes > *max_age_minutes).then_some(EscalationOutcome::Boost(*boost)),
            EscalationRule::FailureCount { threshold, boost } => {
                (ctx.failures > *threshold).then_some(EscalationOutcome::Boost(*boost))
            }
            EscalationRule::SlaBreach => (ctx.age_minutes
                > ctx.current_priority.sla_minutes())
            .then_some(EscalationOutcome::ForceAtLeast(Priority::High)),
            EscalationRule::BlockedDependencies => ctx
                .has_blocked_dependencies
                .then_some(EscalationOutcome::ForceAtLeast(Priority::Critical)),
            EscalationRule::Custom {
                variable,
                op,
                value,
                boost,
                ..
            } => op
                .apply(ctx.variable(*variable), *value)
                .then_some(EscalationOutcome::Boost(*boost)),
        }
    }
}

/// The default escalation rule set.
pub fn default_rules() -> Vec<EscalationRule> {
    vec![
        EscalationRule::AgeBased {
            max_age_minutes: 30,
            boost: 10.0,
        },
        EscalationRule::FailureCount {
            threshold: 2,
            boost: 20.0,
        },
        EscalationRule::SlaBreach,
        EscalationRule::BlockedDependencies,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> EscalationContext {
        EscalationContext {
            age_minutes: 0,
            failures: 0,
            retries: 0,
            blocked_dependents: 0,
            has_blocked_dependencies: false,
            complexity: 1.0,
            current_priority: Priority::Normal,
        }
    }

    #[test]
    fn test_parse_condition() {
        let (var, op, value) = parse_condition("failures > 2").unwrap();
        assert_eq!(var, TaskVariable::Failures);
        assert_eq!(op, Comparison::Gt);
        assert_eq!(value, 2.0);
    }

    #[test]
    fn test_parse_condition_rejects_garbage() {
        assert!(parse_condition("failures >").is_err());
        assert!(parse_condition("bogus > 2").is_err());
        assert!(parse_condition("failures ~ 2").is_err());
        assert!(parse_condition("failures > two").is_err());
    }

    #[test]
    fn test_age_rule_fires_past_limit() {
        let rule = EscalationRule::AgeBased {
            max_age_minutes: 30,
            boost: 10.0,
        };
        let mut c = ctx();
        assert_eq!(rule.evaluate(&c), None);
        c.age_minutes = 31;
        assert_eq!(rule.evaluate(&c), Some(EscalationOutcome::Boost(10.0)));
    }

    #[test]
    fn test_failure_rule_threshold_is_exclusive() {
        let rule = EscalationRule::FailureCount {
            threshold: 2,
            boost: 20.0,
        };
        let mut c = ctx();
        c.failures = 2;
        assert_eq!(rule.evaluate(&c), None);
        c.failures = 3;
        assert_eq!(rule.evaluate(&c), Some(EscalationOutcome::Boost(20.0)));
    }

    #[test]
    fn test_sla_breach_forces_high() {
        let mut c = ctx();
        c.age_minutes = Priority::Normal.sla_minutes() + 1;
        assert_eq!(
            EscalationRule::SlaBreach.evaluate(&c),
            Some(EscalationOutcome::ForceAtLeast(Priority::High))
        );
    }

    #[test]
    fn test_blocked_dependencies_force_critical() {
        let mut c = ctx();
        c.has_blocked_dependencies = true;
        assert_eq!(
            EscalationRule::BlockedDependencies.evaluate(&c),
            Some(EscalationOutcome::ForceAtLeast(Priority::Critical))
        );
    }

    #[test]
    fn test_custom_rule_roundtrip() {
        let rule = EscalationRule::custom("many_dependents", "dependents >= 3", 15.0).unwrap();
        let mut c = ctx();
        c.blocked_dependents = 3;
        assert_eq!(rule.evaluate(&c), Some(EscalationOutcome::Boost(15.0)));
        assert_eq!(rule.label(), "many_dependents");
    }
}
