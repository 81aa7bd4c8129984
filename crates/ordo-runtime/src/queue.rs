//! Delayed-resume task queue.
//!
//! A time-ordered sorted set indexes executions by their absolute resume
//! time; the payload for each lives in a plain record. A worker loop (see
//! the orchestrator module) polls for due tasks, claims them atomically via
//! [`TaskQueue::mark_processing`], and resumes the execution under its lock.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use ordo_kernel::capabilities::KVStore;
use ordo_kernel::clock::Clock;
use ordo_kernel::error::OrdoResult;

const QUEUE_INDEX_KEY: &str = "ordo:queue:resume";

/// A scheduled resume, as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeTask {
    pub execution_id: Uuid,
    pub scheduled_at_ms: u64,
    pub reason: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Time-ordered queue over a [`KVStore`] sorted set.
pub struct TaskQueue {
    store: Arc<dyn KVStore>,
    clock: Arc<dyn Clock>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn KVStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn payload_key(execution_id: Uuid) -> String {
        format!("ordo:task:{execution_id}")
    }

    /// Schedule `execution_id` to resume after `delay`.
    ///
    /// Re-scheduling an already queued execution moves it to the new time.
    pub async fn schedule_resume(
        &self,
        execution_id: Uuid,
        delay: Duration,
        reason: impl Into<String>,
        payload: serde_json::Value,
    ) -> OrdoResult<ResumeTask> {
        let scheduled_at_ms = self.clock.now_millis() + delay.as_millis() as u64;
        let task = ResumeTask {
            execution_id,
            scheduled_at_ms,
            reason: reason.into(),
            payload,
        };
        self.store
            .set(
                &Self::payload_key(execution_id),
                &serde_json::to_string(&task)?,
                None,
            )
            .await?;
        self.store
            .zadd(QUEUE_INDEX_KEY, &execution_id.to_string(), scheduled_at_ms as f64)
            .await?;
        Ok(task)
    }

    /// Tasks whose scheduled time has passed, earliest first.
    pub async fn ready_tasks(&self, limit: usize) -> OrdoResult<Vec<ResumeTask>> {
        let now = self.clock.now_millis() as f64;
        let due = self
            .store
            .zrange_by_score(QUEUE_INDEX_KEY, 0.0, now, limit)
            .await?;

        let mut tasks = Vec::with_capacity(due.len());
        for (member, _) in due {
            let Ok(execution_id) = member.parse::<Uuid>() else {
                continue;
            };
            if let Some(raw) = self.store.get(&Self::payload_key(execution_id)).await? {
                if let Ok(task) = serde_json::from_str::<ResumeTask>(&raw) {
                    tasks.push(task);
                }
            }
        }
        Ok(tasks)
    }

    /// Atomically claim a task: remove it from the index and delete its
    /// payload. Returns `false` when another worker got there first.
    pub async fn mark_processing(&self, execution_id: Uuid) -> OrdoResult<bool> {
        let claimed = self
            .store
            .zrem(QUEUE_INDEX_KEY, &execution_id.to_string())
            .await?;
        if claimed {
            self.store.del(&Self::payload_key(execution_id)).await?;
        }
        Ok(claimed)
    }
}
