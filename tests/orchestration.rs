//! Scenario tests for the orchestration heuristics.
//!
//! These exercise the decision functions end to end without a store:
//! agent selection, workload classification, priority escalation, and
//! retry classification.

use std::collections::HashSet;

use agentpool::balancer::{capability_score, TaskClassifier, WorkloadBalancer};
use agentpool::config::AgentTypeConfig;
use agentpool::priority::{default_rules, EscalationContext, EscalationOutcome};
use agentpool::registry::Agent;
use agentpool::scaler::{AutoScaler, WorkloadStatus};
use agentpool::scheduler::{SchedulingModel, TaskScheduler};
use agentpool::task::{Priority, Task};

fn agent(id: &str, agent_type: &str, caps: &[&str], load: usize, max: usize) -> Agent {
    let capabilities: HashSet<String> = caps.iter().map(|c| c.to_string()).collect();
    let mut a = Agent::new(id, agent_type, capabilities, max);
    a.current_load = load;
    a
}

#[test]
fn lightly_loaded_agent_wins_selection() {
    // Two claude agents with identical capabilities and health; the one
    // with four of five slots in use must lose to the idle one, and the
    // margin must exceed the tie-break window.
    let model = SchedulingModel::new(0.3);
    let mut task = Task::new("architecture").with_capabilities(["architecture"]);
    task.complexity = TaskScheduler::calculate_task_complexity(&task);

    let a1 = agent("a1", "claude", &["architecture"], 0, 5);
    let a2 = agent("a2", "claude", &["architecture"], 4, 5);

    let (chosen, score, _) = TaskScheduler::choose_agent(&task, &[a1.clone(), a2.clone()], &model)
        .expect("selection should succeed");
    assert_eq!(chosen.id, "a1");

    let losing_score = TaskScheduler::calculate_agent_score(&task, &a2);
    assert!(score - losing_score > 5.0);
}

#[test]
fn selection_respects_eligibility_filters() {
    let model = SchedulingModel::new(0.3);
    let task = Task::new("backend");

    let full = agent("full", "gpt", &[], 5, 5);
    let mut unhealthy = agent("sick", "gpt", &[], 0, 5);
    unhealthy.health_score = 0.1;
    let mut silent = agent("silent", "gpt", &[], 0, 5);
    silent.last_heartbeat = chrono::Utc::now() - chrono::Duration::seconds(300);
    let good = agent("good", "gpt", &[], 2, 5);

    let fleet = vec![full, unhealthy, silent, good];
    let (chosen, _, _) = TaskScheduler::choose_agent(&task, &fleet, &model).unwrap();
    assert_eq!(chosen.id, "good");
}

#[test]
fn complexity_stays_in_range_and_grows_with_content() {
    let small = Task::new("documentation").with_content("fix a typo");
    let big = Task::new("architecture").with_content("design the system\n".repeat(500));

    let c_small = TaskScheduler::calculate_task_complexity(&small);
    let c_big = TaskScheduler::calculate_task_complexity(&big);
    assert!((1.0..=5.0).contains(&c_small));
    assert!((1.0..=5.0).contains(&c_big));
    assert!(c_big > c_small);
}

#[test]
fn deep_queue_with_one_agent_is_critical() {
    // pending=12, processing=3, maxInstances=4, healthy=1, up-threshold=5:
    // depth 15 > 2*5 classifies critical; target is min(4, 1+2) = 3.
    let status = AutoScaler::classify(12 + 3, 1, 1, 4, 5, 2);
    assert_eq!(status, WorkloadStatus::Critical);
    assert_eq!(4usize.min(1 + 2), 3);
}

#[test]
fn empty_fleet_is_critical_regardless_of_depth() {
    assert_eq!(
        AutoScaler::classify(0, 0, 1, 4, 5, 2),
        WorkloadStatus::Critical
    );
}

#[test]
fn syntax_errors_are_never_retried() {
    assert!(!WorkloadBalancer::is_retryable(
        "syntax error: unexpected token"
    ));
    // A transient failure is retryable.
    assert!(WorkloadBalancer::is_retryable("connection refused"));
}

#[test]
fn escalation_rules_do_not_de_escalate() {
    // Once SLA breach forces High, re-evaluating the same context yields
    // the same forced level, never a lower one.
    let rules = default_rules();
    let ctx = EscalationContext {
        age_minutes: Priority::High.sla_minutes() + 1,
        failures: 0,
        retries: 0,
        blocked_dependents: 0,
        has_blocked_dependencies: false,
        complexity: 1.0,
        current_priority: Priority::High,
    };

    for rule in &rules {
        if let Some(EscalationOutcome::ForceAtLeast(level)) = rule.evaluate(&ctx) {
            assert!(level >= Priority::High || level == Priority::Critical);
        }
    }
}

#[test]
fn blocked_dependencies_force_critical_idempotently() {
    let rules = default_rules();
    let mut ctx = EscalationContext {
        age_minutes: 0,
        failures: 0,
        retries: 0,
        blocked_dependents: 2,
        has_blocked_dependencies: true,
        complexity: 1.0,
        current_priority: Priority::Normal,
    };

    let forced_first: Vec<_> = rules.iter().filter_map(|r| r.evaluate(&ctx)).collect();
    assert!(forced_first.contains(&EscalationOutcome::ForceAtLeast(Priority::Critical)));

    // Re-evaluating at Critical still yields Critical, not a downgrade.
    ctx.current_priority = Priority::Critical;
    let forced_again: Vec<_> = rules.iter().filter_map(|r| r.evaluate(&ctx)).collect();
    assert!(forced_again.contains(&EscalationOutcome::ForceAtLeast(Priority::Critical)));
}

#[test]
fn classification_feeds_capability_fit() {
    let classifier = TaskClassifier::new().unwrap();
    let task = Task::new("general")
        .with_content("debug the crash: stack trace shows a panic in the worker");
    let analysis = classifier.analyze(&task);
    assert_eq!(analysis.primary_type, "debugging");

    let debug_pool = AgentTypeConfig::new("deepseek-coder").with_tiers(
        ["debugging", "performance", "testing"],
        ["backend", "api"],
        ["refactoring", "devops"],
    );
    let docs_pool = AgentTypeConfig::new("claude").with_tiers(
        ["architecture", "refactoring", "documentation"],
        ["security", "api"],
        ["backend", "testing"],
    );

    let fit_debug = capability_score(&analysis, &debug_pool, 0, 10);
    let fit_docs = capability_score(&analysis, &docs_pool, 0, 10);
    assert!(fit_debug > fit_docs);
    assert!(fit_debug >= 1.0);
}
