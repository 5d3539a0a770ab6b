//! Store-backed lifecycle tests against a live redis.
//!
//! Run with: REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_state -- --ignored

use agentpool::config::OrchestratorConfig;
use agentpool::registry::{Agent, AgentRegistry};
use agentpool::scaler::AutoScaler;
use agentpool::scheduler::TaskScheduler;
use agentpool::store::QueueStore;
use agentpool::task::{CompletionResult, Task};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn store() -> QueueStore {
    QueueStore::connect(&redis_url())
        .await
        .expect("redis must be reachable for ignored tests")
}

/// Unique name so parallel test runs never share queue keys.
fn unique(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..8])
}

#[tokio::test]
#[ignore]
async fn completion_clears_assigned_queue_and_load() {
    let store = store().await;
    let registry = AgentRegistry::new();
    let agent_id = unique("claude");
    registry
        .register(Agent::new(&agent_id, "claude", Default::default(), 5))
        .await;
    let scheduler =
        TaskScheduler::new(store.clone(), registry.clone(), OrchestratorConfig::default());

    let placement = scheduler
        .schedule_task(Task::new("backend"))
        .await
        .expect("one idle healthy agent must be selectable");
    assert_eq!(placement.assigned_agent, agent_id);
    assert_eq!(store.assigned_len(&agent_id).await.unwrap(), 1);
    assert_eq!(registry.get(&agent_id).await.unwrap().current_load, 1);

    scheduler
        .update_task_completion(&placement.task_id, &CompletionResult::success(45_000))
        .await
        .unwrap();
    assert_eq!(store.assigned_len(&agent_id).await.unwrap(), 0);
    assert_eq!(registry.get(&agent_id).await.unwrap().current_load, 0);

    // A duplicate report changes neither the queue nor the load.
    scheduler
        .update_task_completion(&placement.task_id, &CompletionResult::success(45_000))
        .await
        .unwrap();
    assert_eq!(store.assigned_len(&agent_id).await.unwrap(), 0);
    assert_eq!(registry.get(&agent_id).await.unwrap().current_load, 0);

    store.clear_task_priority(&placement.task_id).await.unwrap();
    store.delete_agent(&agent_id).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn startup_sweep_spares_types_with_live_workers() {
    let store = store().await;
    let registry = AgentRegistry::new();
    let agent_type = unique("claude");
    let scaler = AutoScaler::new(
        store.clone(),
        registry.clone(),
        OrchestratorConfig::default(),
    );

    let mut task = Task::new("backend");
    task.ensure_id();
    store.push_processing(&agent_type, &task).await.unwrap();

    // A fresh heartbeat means the fleet is alive: nothing is recovered.
    let agent_id = unique(&agent_type);
    registry
        .register(Agent::new(&agent_id, &agent_type, Default::default(), 5))
        .await;
    assert_eq!(scaler.recover_abandoned(&agent_type).await.unwrap(), 0);
    assert_eq!(store.processing_len(&agent_type).await.unwrap(), 1);

    // With the fleet gone, the in-flight task returns to pending.
    let _ = registry.unregister(&agent_id).await;
    assert_eq!(scaler.recover_abandoned(&agent_type).await.unwrap(), 1);
    assert_eq!(store.processing_len(&agent_type).await.unwrap(), 0);
    assert_eq!(store.pending_len(&agent_type).await.unwrap(), 1);

    for (raw, _) in store.pending_entries(&agent_type).await.unwrap() {
        store.remove_pending(&agent_type, &raw).await.unwrap();
    }
}

#[tokio::test]
#[ignore]
async fn reroute_pending_moves_executable_copy() {
    let store = store().await;
    let from_type = unique("claude");
    let to_type = unique("gpt");
    let new_agent = unique("gpt");

    let mut task = Task::new("frontend");
    task.ensure_id();
    store.push_pending(&from_type, &task).await.unwrap();

    assert!(store
        .reroute_pending(&from_type, &to_type, &task.id, &new_agent)
        .await
        .unwrap());
    assert_eq!(store.pending_len(&from_type).await.unwrap(), 0);

    let entries = store.pending_entries(&to_type).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.id, task.id);
    assert_eq!(entries[0].1.assigned_agent.as_deref(), Some(new_agent.as_str()));

    // A second attempt finds nothing left to move.
    assert!(!store
        .reroute_pending(&from_type, &to_type, &task.id, &new_agent)
        .await
        .unwrap());

    for (raw, _) in entries {
        store.remove_pending(&to_type, &raw).await.unwrap();
    }
}
