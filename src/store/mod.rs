//! Redis-backed shared store.
//!
//! All durable orchestration state lives here: agent records, per-agent
//! priority queues, per-type pending/processing lists, the failure queue,
//! health flag sets, and the learned scheduling model snapshot. Every
//! control loop and every worker process talks to the same keys, so this
//! module is the single place that knows the key layout.
//!
//! # Key Layout
//!
//! - `agents:<id>` - hash; field `record` holds the full agent JSON and
//!   scalar fields (`heartbeat`, `health_score`, `cpu`, `memory`,
//!   `active_tasks`) are written directly by worker heartbeats
//! - `agents:index` - set of registered agent ids
//! - `queue:<agent_id>:p:<priority>` - sorted set of assigned tasks,
//!   scored by enqueue timestamp (lower is served first)
//! - `queue:<type>` - pending list workers consume from
//! - `processing:<type>` - in-flight list workers park tasks in
//! - `queue:failures` - failed-task list the balancer retries from
//! - `scheduler:unhealthy_agents` / `scheduler:offline_agents` - flag sets
//! - `tasks:priorities` / `tasks:metrics` - bookkeeping hashes
//! - `scheduler:model` - learned scheduling model snapshot

mod queue;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::{debug, warn};

use crate::registry::{Agent, ResourceUsage};
use crate::scheduler::SchedulingModel;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the store backend.
    #[error("Failed to connect to store: {0}")]
    ConnectionFailed(String),

    /// A redis command failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key for an agent's hash.
pub(crate) fn agent_key(agent_id: &str) -> String {
    format!("agents:{agent_id}")
}

/// Key for one agent's per-priority assigned queue.
pub(crate) fn assigned_queue_key(agent_id: &str, priority: crate::task::Priority) -> String {
    format!("queue:{agent_id}:p:{priority}")
}

/// Key for a type's pending list.
pub(crate) fn pending_key(agent_type: &str) -> String {
    format!("queue:{agent_type}")
}

/// Key for a type's processing list.
pub(crate) fn processing_key(agent_type: &str) -> String {
    format!("processing:{agent_type}")
}

const AGENT_INDEX_KEY: &str = "agents:index";
const UNHEALTHY_SET_KEY: &str = "scheduler:unhealthy_agents";
const OFFLINE_SET_KEY: &str = "scheduler:offline_agents";
const MODEL_KEY: &str = "scheduler:model";
pub(crate) const FAILURE_KEY: &str = "queue:failures";
pub(crate) const PRIORITIES_HASH_KEY: &str = "tasks:priorities";
pub(crate) const METRICS_HASH_KEY: &str = "tasks:metrics";

/// Shared handle to the redis store.
///
/// Cheap to clone; every public method clones the underlying connection
/// manager, so a single `QueueStore` can be shared across all loops.
#[derive(Clone)]
pub struct QueueStore {
    conn: ConnectionManager,
}

impl QueueStore {
    /// Connects to redis and returns a store handle.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the client cannot be
    /// created or the initial connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        debug!(url = %redis_url, "Connected to store");
        Ok(Self { conn })
    }

    /// Wraps an existing connection manager (used by tests and tools).
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    // ---- Agent records ----

    /// Persists an agent record and adds it to the index.
    pub async fn save_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = agent_key(&agent.id);
        let json = serde_json::to_string(agent)?;
        conn.hset::<_, _, _, ()>(&key, "record", json).await?;
        conn.sadd::<_, _, ()>(AGENT_INDEX_KEY, &agent.id).await?;
        Ok(())
    }

    /// Loads an agent record, merging in the scalar heartbeat fields
    /// workers write directly to the hash.
    pub async fn load_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        let mut conn = self.conn.clone();
        let key = agent_key(agent_id);
        let record: Option<String> = conn.hget(&key, "record").await?;
        let Some(record) = record else {
            return Ok(None);
        };
        let mut agent: Agent = serde_json::from_str(&record)?;

        if let Some(heartbeat) = self.hash_field::<String>(&key, "heartbeat").await? {
            match heartbeat.parse::<DateTime<Utc>>() {
                Ok(ts) => agent.last_heartbeat = ts,
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "Ignoring malformed heartbeat field")
                }
            }
        }
        if let Some(score) = self.hash_field::<f64>(&key, "health_score").await? {
            agent.health_score = score.clamp(0.0, 1.0);
        }
        if let Some(cpu) = self.hash_field::<f64>(&key, "cpu").await? {
            agent.resource_usage.cpu_percent = cpu;
        }
        if let Some(memory) = self.hash_field::<f64>(&key, "memory").await? {
            agent.resource_usage.memory_mb = memory;
        }
        if let Some(active) = self.hash_field::<usize>(&key, "active_tasks").await? {
            agent.current_load = active;
        }
        Ok(Some(agent))
    }

    async fn hash_field<T: redis::FromRedisValue>(
        &self,
        key: &str,
        field: &str,
    ) -> Result<Option<T>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    /// Writes the scalar heartbeat fields for an agent, the same shape
    /// worker processes use.
    pub async fn record_heartbeat(
        &self,
        agent_id: &str,
        health_score: f64,
        usage: &ResourceUsage,
        active_tasks: usize,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = agent_key(agent_id);
        conn.hset::<_, _, _, ()>(&key, "heartbeat", Utc::now().to_rfc3339())
            .await?;
        conn.hset::<_, _, _, ()>(&key, "health_score", health_score)
            .await?;
        conn.hset::<_, _, _, ()>(&key, "cpu", usage.cpu_percent)
            .await?;
        conn.hset::<_, _, _, ()>(&key, "memory", usage.memory_mb)
            .await?;
        conn.hset::<_, _, _, ()>(&key, "active_tasks", active_tasks)
            .await?;
        Ok(())
    }

    /// Removes an agent's hash, index entry, and health flags.
    pub async fn delete_agent(&self, agent_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(agent_key(agent_id)).await?;
        conn.srem::<_, _, ()>(AGENT_INDEX_KEY, agent_id).await?;
        conn.srem::<_, _, ()>(UNHEALTHY_SET_KEY, agent_id).await?;
        conn.srem::<_, _, ()>(OFFLINE_SET_KEY, agent_id).await?;
        Ok(())
    }

    /// Ids of every agent in the index.
    pub async fn agent_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(AGENT_INDEX_KEY).await?)
    }

    // ---- Health flags ----

    pub async fn mark_unhealthy(&self, agent_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(UNHEALTHY_SET_KEY, agent_id).await?;
        Ok(())
    }

    pub async fn clear_unhealthy(&self, agent_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(UNHEALTHY_SET_KEY, agent_id).await?;
        Ok(())
    }

    pub async fn mark_offline(&self, agent_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(OFFLINE_SET_KEY, agent_id).await?;
        Ok(())
    }

    // ---- Task bookkeeping hashes ----

    pub async fn set_task_priority(
        &self,
        task_id: &str,
        priority: crate::task::Priority,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(PRIORITIES_HASH_KEY, task_id, priority.to_string())
            .await?;
        Ok(())
    }

    pub async fn set_task_metrics(
        &self,
        task_id: &str,
        metrics: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(metrics)?;
        conn.hset::<_, _, _, ()>(METRICS_HASH_KEY, task_id, json)
            .await?;
        Ok(())
    }

    pub async fn get_task_metrics(
        &self,
        task_id: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.hget(METRICS_HASH_KEY, task_id).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Rewrites the agent named in a task's placement record, so that
    /// completion bookkeeping lands on the task's current owner. An
    /// empty agent id marks the task as no longer agent-attributed.
    pub async fn update_task_agent(
        &self,
        task_id: &str,
        agent_id: &str,
    ) -> Result<(), StoreError> {
        if let Some(mut metrics) = self.get_task_metrics(task_id).await? {
            if let Some(record) = metrics.as_object_mut() {
                record.insert(
                    "agent".to_string(),
                    serde_json::Value::String(agent_id.to_string()),
                );
                self.set_task_metrics(task_id, &metrics).await?;
            }
        }
        Ok(())
    }

    // ---- Scheduling model snapshot ----

    pub async fn save_model(&self, model: &SchedulingModel) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(model)?;
        conn.set::<_, _, ()>(MODEL_KEY, json).await?;
        Ok(())
    }

    pub async fn load_model(&self) -> Result<Option<SchedulingModel>, StoreError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(MODEL_KEY).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
