//! Task priority management.
//!
//! Initial priority is scored from path, keyword, and type rule tables,
//! plus dependency and business-impact bonuses. A periodic escalation
//! loop re-evaluates active tasks against configurable rules (aging,
//! repeated failure, SLA breach, blocked dependents) and only ever
//! upgrades a task, relocating it between its agent's priority queues
//! when the level changes.

pub mod manager;
pub mod rules;

pub use manager::{PriorityManager, PriorityStats};
pub use rules::{
    default_rules, parse_condition, Comparison, EscalationContext, EscalationOutcome,
    EscalationRule, PriorityRules, TaskVariable,
};
