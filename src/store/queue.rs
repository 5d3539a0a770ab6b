//! Queue operations on the shared store.
//!
//! A task has exactly one executable copy: in its type's pending list
//! until a worker picks it up, then in the type's processing list until
//! the worker reports completion. The per-agent sorted sets keyed by
//! priority are the scheduler's placement ledger, not a second work
//! queue: they record which agent a task is earmarked for and in what
//! order, follow the task when it migrates, and are cleared when its
//! completion is processed. Removal helpers return how many entries
//! were removed so callers can detect that another loop already moved a
//! task and skip their half of the migration.

use chrono::Utc;
use redis::AsyncCommands;
use tracing::warn;

use super::{assigned_queue_key, pending_key, processing_key, QueueStore, StoreError};
use super::{FAILURE_KEY, PRIORITIES_HASH_KEY};
use crate::task::{Priority, Task};

impl QueueStore {
    // ---- Per-agent assigned queues ----

    /// Adds a task to an agent's priority queue, scored by the current
    /// timestamp so earlier arrivals are served first. Returns the task's
    /// position within its priority band (0-based).
    pub async fn enqueue_assigned(
        &self,
        agent_id: &str,
        task: &Task,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let key = assigned_queue_key(agent_id, task.priority);
        let member = serde_json::to_string(task)?;
        let score = Utc::now().timestamp_millis() as f64;
        conn.zadd::<_, _, _, ()>(&key, &member, score).await?;
        let rank: Option<usize> = conn.zrank(&key, &member).await?;
        Ok(rank.unwrap_or(0))
    }

    /// Finds and removes a task from one of an agent's priority queues,
    /// scanning highest priority first. Returns the raw member that was
    /// removed, or `None` if no queue held the task.
    pub async fn remove_assigned(
        &self,
        agent_id: &str,
        task_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        for priority in Priority::DESCENDING {
            let key = assigned_queue_key(agent_id, priority);
            let members: Vec<String> = conn.zrange(&key, 0, -1).await?;
            for member in members {
                let matches = serde_json::from_str::<Task>(&member)
                    .map(|t| t.id == task_id)
                    .unwrap_or(false);
                if matches {
                    let removed: usize = conn.zrem(&key, &member).await?;
                    if removed > 0 {
                        return Ok(Some(member));
                    }
                    // Another loop took it between the scan and the zrem.
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    /// All tasks assigned to an agent, highest priority first, oldest
    /// first within each priority.
    pub async fn assigned_tasks(&self, agent_id: &str) -> Result<Vec<Task>, StoreError> {
        let mut conn = self.conn.clone();
        let mut tasks = Vec::new();
        for priority in Priority::DESCENDING {
            let key = assigned_queue_key(agent_id, priority);
            let members: Vec<String> = conn.zrange(&key, 0, -1).await?;
            for member in members {
                match serde_json::from_str::<Task>(&member) {
                    Ok(task) => tasks.push(task),
                    Err(e) => {
                        warn!(agent_id = %agent_id, error = %e, "Skipping malformed queue entry")
                    }
                }
            }
        }
        Ok(tasks)
    }

    /// Total assigned-task count across an agent's priority queues.
    pub async fn assigned_len(&self, agent_id: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let mut total = 0;
        for priority in Priority::DESCENDING {
            let key = assigned_queue_key(agent_id, priority);
            let len: usize = conn.zcard(&key).await?;
            total += len;
        }
        Ok(total)
    }

    /// Deletes every priority queue belonging to an agent, returning the
    /// tasks that were still waiting in them.
    pub async fn drain_assigned(&self, agent_id: &str) -> Result<Vec<Task>, StoreError> {
        let tasks = self.assigned_tasks(agent_id).await?;
        let mut conn = self.conn.clone();
        for priority in Priority::DESCENDING {
            conn.del::<_, ()>(assigned_queue_key(agent_id, priority))
                .await?;
        }
        Ok(tasks)
    }

    // ---- Per-type pending and processing lists ----

    /// Pushes a task onto the back of a type's pending list.
    pub async fn push_pending(&self, agent_type: &str, task: &Task) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let member = serde_json::to_string(task)?;
        conn.lpush::<_, _, ()>(pending_key(agent_type), member)
            .await?;
        Ok(())
    }

    /// Pushes a task onto the consuming end of a type's pending list so
    /// the next worker picks it up first. Used for recovered and boosted
    /// tasks.
    pub async fn push_pending_front(
        &self,
        agent_type: &str,
        task: &Task,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let member = serde_json::to_string(task)?;
        conn.rpush::<_, _, ()>(pending_key(agent_type), member)
            .await?;
        Ok(())
    }

    /// Parks a task in a type's processing list, as a worker does when it
    /// picks one up.
    pub async fn push_processing(&self, agent_type: &str, task: &Task) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let member = serde_json::to_string(task)?;
        conn.lpush::<_, _, ()>(processing_key(agent_type), member)
            .await?;
        Ok(())
    }

    pub async fn pending_len(&self, agent_type: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(pending_key(agent_type)).await?)
    }

    pub async fn processing_len(&self, agent_type: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(processing_key(agent_type)).await?)
    }

    /// Raw entries plus parsed tasks from a type's pending list. The raw
    /// string is kept alongside so callers can `lrem` the exact member.
    pub async fn pending_entries(
        &self,
        agent_type: &str,
    ) -> Result<Vec<(String, Task)>, StoreError> {
        self.list_entries(&pending_key(agent_type)).await
    }

    /// Raw entries plus parsed tasks from a type's processing list.
    pub async fn processing_entries(
        &self,
        agent_type: &str,
    ) -> Result<Vec<(String, Task)>, StoreError> {
        self.list_entries(&processing_key(agent_type)).await
    }

    async fn list_entries(&self, key: &str) -> Result<Vec<(String, Task)>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.lrange(key, 0, -1).await?;
        let mut entries = Vec::with_capacity(members.len());
        for member in members {
            match serde_json::from_str::<Task>(&member) {
                Ok(task) => entries.push((member, task)),
                Err(e) => warn!(key = %key, error = %e, "Skipping malformed list entry"),
            }
        }
        Ok(entries)
    }

    /// Removes one occurrence of a raw entry from a type's pending list.
    /// Returns `true` if an entry was removed.
    pub async fn remove_pending(&self, agent_type: &str, raw: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.lrem(pending_key(agent_type), 1, raw).await?;
        Ok(removed > 0)
    }

    /// Removes one occurrence of a raw entry from a type's processing
    /// list. Returns `true` if an entry was removed.
    pub async fn remove_processing(&self, agent_type: &str, raw: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.lrem(processing_key(agent_type), 1, raw).await?;
        Ok(removed > 0)
    }

    // ---- Failure queue ----

    pub async fn push_failure(&self, task: &Task) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let member = serde_json::to_string(task)?;
        conn.lpush::<_, _, ()>(FAILURE_KEY, member).await?;
        Ok(())
    }

    pub async fn failure_entries(&self) -> Result<Vec<(String, Task)>, StoreError> {
        self.list_entries(FAILURE_KEY).await
    }

    pub async fn remove_failure(&self, raw: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.lrem(FAILURE_KEY, 1, raw).await?;
        Ok(removed > 0)
    }

    pub async fn failure_len(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(FAILURE_KEY).await?)
    }

    // ---- Migration ----

    /// Moves an assigned task from one agent's queue to another's in a
    /// remove-then-insert sequence. Returns `false` without inserting if
    /// the source queue no longer holds the task, which means another
    /// loop migrated it first.
    pub async fn move_assigned(
        &self,
        from_agent: &str,
        to_agent: &str,
        task: &Task,
    ) -> Result<bool, StoreError> {
        if self.remove_assigned(from_agent, &task.id).await?.is_none() {
            return Ok(false);
        }
        let mut reassigned = task.clone();
        reassigned.assigned_agent = Some(to_agent.to_string());
        self.enqueue_assigned(to_agent, &reassigned).await?;
        Ok(true)
    }

    /// Moves a task's pending entry between type queues by id, stamping
    /// the new assigned agent on the moved copy. Returns `false` if the
    /// source list no longer holds the task.
    pub async fn reroute_pending(
        &self,
        from_type: &str,
        to_type: &str,
        task_id: &str,
        new_agent: &str,
    ) -> Result<bool, StoreError> {
        for (raw, mut task) in self.pending_entries(from_type).await? {
            if task.id != task_id {
                continue;
            }
            if !self.remove_pending(from_type, &raw).await? {
                return Ok(false);
            }
            task.assigned_agent = Some(new_agent.to_string());
            self.push_pending(to_type, &task).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Clears a task's bookkeeping hash entries after terminal handling.
    pub async fn clear_task_priority(&self, task_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(PRIORITIES_HASH_KEY, task_id).await?;
        Ok(())
    }
}
