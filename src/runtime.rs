//! Engine runtime: wires the four control loops together and drives
//! their periodic cycles.
//!
//! The orchestrator never executes task payloads. It places tasks,
//! watches queues, scales the fleet, and reacts to completion reports;
//! worker processes spawned by the scaler do the actual work.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::balancer::{BalancerStats, WorkloadBalancer};
use crate::config::OrchestratorConfig;
use crate::error::{BalanceError, PriorityError, ScalingError, ScheduleError, StoreError};
use crate::priority::{PriorityManager, PriorityStats};
use crate::registry::AgentRegistry;
use crate::scaler::{AutoScaler, ScalerStats};
use crate::scheduler::{SchedulerStats, TaskScheduler};
use crate::store::QueueStore;
use crate::task::{CompletionResult, SchedulePlacement, Task};

/// Errors surfaced by the orchestrator runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduling error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Scaling error: {0}")]
    Scaling(#[from] ScalingError),

    #[error("Balancing error: {0}")]
    Balance(#[from] BalanceError),

    #[error("Priority error: {0}")]
    Priority(#[from] PriorityError),
}

/// Top-level handle owning all four control loops.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: AgentRegistry,
    store: QueueStore,
    scheduler: Arc<TaskScheduler>,
    priorities: Arc<PriorityManager>,
    balancer: Arc<WorkloadBalancer>,
    shutdown_tx: broadcast::Sender<()>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Connects to the store and assembles the engine. Agents already in
    /// the store index are loaded into the registry, and a persisted
    /// scheduling model is restored if one exists.
    pub async fn connect(config: OrchestratorConfig) -> Result<Self, RuntimeError> {
        let store = QueueStore::connect(&config.redis_url).await?;
        let registry = AgentRegistry::new();

        for agent_id in store.agent_ids().await? {
            match store.load_agent(&agent_id).await? {
                Some(agent) => registry.register(agent).await,
                None => warn!(agent_id = %agent_id, "Indexed agent has no record, skipping"),
            }
        }
        let known = registry.count().await;
        if known > 0 {
            info!(agents = known, "Restored agents from store");
        }

        let scheduler = Arc::new(TaskScheduler::new(
            store.clone(),
            registry.clone(),
            config.clone(),
        ));
        if let Some(model) = store.load_model().await? {
            info!(
                buckets = model.completion_times_ms.len(),
                "Restored scheduling model"
            );
            scheduler.restore_model(model).await;
        }

        let priorities = Arc::new(PriorityManager::new(store.clone()));
        let scaler = Arc::new(AutoScaler::new(
            store.clone(),
            registry.clone(),
            config.clone(),
        ));
        let balancer = Arc::new(WorkloadBalancer::new(
            store.clone(),
            config.clone(),
            scaler,
        )?);

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            registry,
            store,
            scheduler,
            priorities,
            balancer,
            shutdown_tx,
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn scaler(&self) -> &Arc<AutoScaler> {
        self.balancer.scaler()
    }

    // ---- Task lifecycle ----

    /// Submits one task: scores its priority, schedules it onto an
    /// agent, and feeds it to that agent's type queue for pickup.
    pub async fn submit_task(&self, mut task: Task) -> Result<SchedulePlacement, RuntimeError> {
        task.ensure_id();

        let (priority, score) = self.priorities.analyze_task_priority(&task).await;
        if priority != task.priority {
            task.apply_priority_change(priority, &format!("initial analysis (score {score:.0})"));
        }

        let placement = self.scheduler.schedule_task(task.clone()).await?;
        task.assigned_agent = Some(placement.assigned_agent.clone());
        self.priorities.track(task.clone()).await;

        // The executable copy goes to the assigned agent's type queue for
        // worker pickup; the entry the scheduler wrote into the agent's
        // sorted set is the placement ledger, cleared on completion.
        if let Some(agent) = self.registry.get(&placement.assigned_agent).await {
            self.store.push_pending(&agent.agent_type, &task).await?;
        }
        Ok(placement)
    }

    /// Processes a completion report from a worker.
    pub async fn complete_task(
        &self,
        task_id: &str,
        result: CompletionResult,
    ) -> Result<(), RuntimeError> {
        self.scheduler.update_task_completion(task_id, &result).await?;

        if result.success {
            self.priorities.mark_completed(task_id).await;
            self.store.clear_task_priority(task_id).await?;
        } else if let Some(mut task) = self.priorities.get_task(task_id).await {
            task.failure_count += 1;
            task.last_failure = result.error.clone();
            self.store.push_failure(&task).await?;
            self.priorities.track(task).await;
        }
        Ok(())
    }

    // ---- Control loops ----

    /// Brings every type up to its minimum, recovers in-flight tasks
    /// abandoned by a dead fleet, and starts all periodic loops.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let scaler = self.scaler().clone();
        // Sweep before topping the fleet up: freshly spawned agents carry
        // current heartbeats and would make a dead fleet look alive.
        for type_config in &self.config.agent_types {
            scaler.recover_abandoned(&type_config.agent_type).await?;
        }
        scaler.ensure_minimum_agents().await?;

        let mut loops = self.loops.lock().await;

        // Scaling analysis.
        {
            let scaler = self.scaler().clone();
            let interval = self.config.scaling_interval;
            let mut rx = self.shutdown_tx.subscribe();
            loops.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = scaler.run_scaling_cycle().await {
                                error!(error = %e, "Scaling cycle failed");
                            }
                        }
                        _ = rx.recv() => break,
                    }
                }
            }));
        }

        // Health monitoring.
        {
            let scaler = self.scaler().clone();
            let interval = self.config.health_check_interval;
            let mut rx = self.shutdown_tx.subscribe();
            loops.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = scaler.run_health_check().await {
                                error!(error = %e, "Health check failed");
                            }
                        }
                        _ = rx.recv() => break,
                    }
                }
            }));
        }

        // Stuck-task recovery.
        {
            let scaler = self.scaler().clone();
            let interval = self.config.stuck_check_interval;
            let mut rx = self.shutdown_tx.subscribe();
            loops.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = scaler.recover_stuck_tasks().await {
                                error!(error = %e, "Stuck-task recovery failed");
                            }
                        }
                        _ = rx.recv() => break,
                    }
                }
            }));
        }

        // Priority escalation.
        {
            let priorities = Arc::clone(&self.priorities);
            let interval = self.config.escalation_interval;
            let mut rx = self.shutdown_tx.subscribe();
            loops.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = priorities.run_escalation_cycle().await {
                                error!(error = %e, "Escalation cycle failed");
                            }
                        }
                        _ = rx.recv() => break,
                    }
                }
            }));
        }

        // Assigned-work rebalancing.
        {
            let scheduler = Arc::clone(&self.scheduler);
            let interval = self.config.rebalance_interval;
            let mut rx = self.shutdown_tx.subscribe();
            loops.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = scheduler.rebalance_workload().await {
                                error!(error = %e, "Rebalance cycle failed");
                            }
                        }
                        _ = rx.recv() => break,
                    }
                }
            }));
        }

        // Model persistence. Failures here never interrupt scheduling.
        {
            let scheduler = Arc::clone(&self.scheduler);
            let interval = self.config.model_snapshot_interval;
            let mut rx = self.shutdown_tx.subscribe();
            loops.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = scheduler.snapshot_model().await {
                                warn!(error = %e, "Model snapshot failed");
                            }
                        }
                        _ = rx.recv() => break,
                    }
                }
            }));
        }

        // Fit-based routing.
        {
            let balancer = Arc::clone(&self.balancer);
            let interval = self.config.routing_interval;
            let mut rx = self.shutdown_tx.subscribe();
            loops.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = balancer.run_routing_cycle().await {
                                error!(error = %e, "Routing cycle failed");
                            }
                        }
                        _ = rx.recv() => break,
                    }
                }
            }));
        }

        // Cross-type fairness.
        {
            let balancer = Arc::clone(&self.balancer);
            let interval = self.config.cross_queue_interval;
            let mut rx = self.shutdown_tx.subscribe();
            loops.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = balancer.run_cross_type_cycle().await {
                                error!(error = %e, "Cross-type cycle failed");
                            }
                        }
                        _ = rx.recv() => break,
                    }
                }
            }));
        }

        // Emergency relief.
        {
            let balancer = Arc::clone(&self.balancer);
            let interval = self.config.emergency_interval;
            let mut rx = self.shutdown_tx.subscribe();
            loops.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = balancer.run_emergency_cycle().await {
                                error!(error = %e, "Emergency cycle failed");
                            }
                        }
                        _ = rx.recv() => break,
                    }
                }
            }));
        }

        // Failed-task retry.
        {
            let balancer = Arc::clone(&self.balancer);
            let interval = self.config.retry_interval;
            let mut rx = self.shutdown_tx.subscribe();
            loops.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = balancer.run_retry_cycle().await {
                                error!(error = %e, "Retry cycle failed");
                            }
                        }
                        _ = rx.recv() => break,
                    }
                }
            }));
        }

        info!(loops = loops.len(), "Orchestrator started");
        Ok(())
    }

    /// Stops all loops and persists the scheduling model.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        info!("Shutting down orchestrator");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = {
            let mut loops = self.loops.lock().await;
            loops.drain(..).collect()
        };
        for handle in handles {
            if tokio::time::timeout(std::time::Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("Control loop did not stop within the shutdown window");
            }
        }

        self.scheduler.snapshot_model().await?;
        info!("Orchestrator stopped");
        Ok(())
    }

    // ---- Stats ----

    pub async fn scheduling_stats(&self) -> SchedulerStats {
        self.scheduler.stats().await
    }

    pub async fn scaling_stats(&self) -> ScalerStats {
        self.scaler().stats().await
    }

    pub async fn balancing_stats(&self) -> BalancerStats {
        self.balancer.stats().await
    }

    pub async fn priority_stats(&self) -> PriorityStats {
        self.priorities.stats().await
    }
}
