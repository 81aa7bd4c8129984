//! Execution memory — versioned persistence over a [`KVStore`].
//!
//! Execution states are stored as JSON blobs whose `version` field is
//! assigned here: every successful optimistic write persists
//! `current.version + 1`, so versions are strictly monotonic and contiguous
//! per record. Writers race through [`ExecutionMemory::save_with_occ`], which
//! rebases the caller's update onto the latest state on conflict.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use ordo_kernel::capabilities::{CasOutcome, KVStore};
use ordo_kernel::checkpoint::Checkpoint;
use ordo_kernel::clock::Clock;
use ordo_kernel::error::{OrdoError, OrdoResult};
use ordo_kernel::execution::ExecutionState;

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for the optimistic write loop.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OccConfig {
    /// Rebase attempts after the initial write (so `max_retries + 1` total).
    pub max_retries: u32,
    /// Base backoff between rebases; actual delay is
    /// `min(max_delay_ms, base·2^attempt + jitter)`.
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for OccConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        }
    }
}

/// TTLs applied by the memory adapter.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MemoryConfig {
    /// Applied once an execution reaches a terminal status.
    pub terminal_state_ttl_secs: u64,
    /// Checkpoints outlive redeploys for a week.
    pub checkpoint_ttl_secs: u64,
    pub occ: OccConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            terminal_state_ttl_secs: 24 * 3600,
            checkpoint_ttl_secs: 7 * 24 * 3600,
            occ: OccConfig::default(),
        }
    }
}

// ============================================================================
// ExecutionMemory
// ============================================================================

/// Persistence adapter for execution states, checkpoints, and the
/// schema-drift log.
pub struct ExecutionMemory {
    store: Arc<dyn KVStore>,
    clock: Arc<dyn Clock>,
    config: MemoryConfig,
}

impl ExecutionMemory {
    pub fn new(store: Arc<dyn KVStore>, clock: Arc<dyn Clock>, config: MemoryConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    fn exec_key(execution_id: Uuid) -> String {
        format!("ordo:exec:{execution_id}")
    }

    fn checkpoint_key(execution_id: Uuid) -> String {
        format!("ordo:checkpoint:{execution_id}")
    }

    fn state_ttl(&self, state: &ExecutionState) -> Option<Duration> {
        state
            .status
            .is_terminal()
            .then(|| Duration::from_secs(self.config.terminal_state_ttl_secs))
    }

    /// Persist a brand-new execution record at version 1.
    ///
    /// Fails with `CONFLICT` if a record already exists under the id.
    pub async fn create(&self, mut state: ExecutionState) -> OrdoResult<ExecutionState> {
        state.version = 1;
        let key = Self::exec_key(state.execution_id);
        let raw = serde_json::to_string(&state)?;
        match self
            .store
            .compare_and_swap(&key, None, &raw, self.state_ttl(&state))
            .await?
        {
            CasOutcome::Written => Ok(state),
            CasOutcome::Conflict { current } => {
                let existing: ExecutionState = serde_json::from_str(&current)?;
                Err(OrdoError::Conflict {
                    current_version: existing.version,
                })
            }
            CasOutcome::NotFound => Err(OrdoError::MemoryOperationFailed(
                "create-only CAS returned NOT_FOUND".into(),
            )),
        }
    }

    /// Load an execution record, or `None` when it does not exist.
    pub async fn load(&self, execution_id: Uuid) -> OrdoResult<Option<ExecutionState>> {
        match self.store.get(&Self::exec_key(execution_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Load an execution record, failing with `NOT_FOUND` when absent.
    pub async fn load_required(&self, execution_id: Uuid) -> OrdoResult<ExecutionState> {
        self.load(execution_id)
            .await?
            .ok_or_else(|| OrdoError::NotFound(format!("execution {execution_id}")))
    }

    /// Optimistically persist an update to an execution record.
    ///
    /// `update` is applied to the freshest copy of the state on every
    /// attempt, so it must be a pure function of that state. On a version
    /// race the loop re-loads, re-applies, backs off with jitter, and tries
    /// again up to `occ.max_retries` times before surfacing `CONFLICT`.
    pub async fn save_with_occ<F>(
        &self,
        execution_id: Uuid,
        update: F,
    ) -> OrdoResult<ExecutionState>
    where
        F: Fn(&mut ExecutionState) -> OrdoResult<()>,
    {
        let key = Self::exec_key(execution_id);

        let mut raw_current = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| OrdoError::NotFound(format!("execution {execution_id}")))?;

        for attempt in 0..=self.config.occ.max_retries {
            let current: ExecutionState = serde_json::from_str(&raw_current)?;
            let expected_version = current.version;

            let mut next = current;
            update(&mut next)?;
            next.version = expected_version + 1;

            let raw_next = serde_json::to_string(&next)?;
            match self
                .store
                .compare_and_swap(&key, Some(&raw_current), &raw_next, self.state_ttl(&next))
                .await?
            {
                CasOutcome::Written => {
                    debug!(
                        execution_id = %execution_id,
                        version = next.version,
                        "execution state persisted"
                    );
                    return Ok(next);
                }
                CasOutcome::Conflict { current } => {
                    let store_state: ExecutionState = serde_json::from_str(&current)?;
                    warn!(
                        execution_id = %execution_id,
                        expected = expected_version,
                        found = store_state.version,
                        attempt,
                        "optimistic write conflict, rebasing"
                    );
                    raw_current = current;
                    if attempt < self.config.occ.max_retries {
                        let backoff = self.conflict_backoff(attempt);
                        tokio::time::sleep(backoff).await;
                    } else {
                        return Err(OrdoError::Conflict {
                            current_version: store_state.version,
                        });
                    }
                }
                CasOutcome::NotFound => {
                    return Err(OrdoError::NotFound(format!("execution {execution_id}")));
                }
            }
        }

        unreachable!("loop returns on final attempt")
    }

    fn conflict_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.occ.base_delay_ms;
        let exp = base.saturating_mul(1u64 << attempt.min(10));
        let jitter = rand::thread_rng().gen_range(0..base.max(1));
        Duration::from_millis(exp.saturating_add(jitter).min(self.config.occ.max_delay_ms))
    }

    /// Delete an execution record.
    pub async fn remove(&self, execution_id: Uuid) -> OrdoResult<bool> {
        self.store.del(&Self::exec_key(execution_id)).await
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Store a checkpoint under the 7-day TTL.
    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> OrdoResult<()> {
        let raw = serde_json::to_string(checkpoint)?;
        self.store
            .set(
                &Self::checkpoint_key(checkpoint.execution_id),
                &raw,
                Some(Duration::from_secs(self.config.checkpoint_ttl_secs)),
            )
            .await
            .map_err(|e| OrdoError::CheckpointStoreFailed(e.to_string()))
    }

    pub async fn load_checkpoint(&self, execution_id: Uuid) -> OrdoResult<Option<Checkpoint>> {
        match self.store.get(&Self::checkpoint_key(execution_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // History & schema drift
    // ------------------------------------------------------------------

    /// All executions created for a given intent, for `self_reflect`.
    pub async fn executions_for_intent(&self, intent_id: Uuid) -> OrdoResult<Vec<ExecutionState>> {
        let keys = self.store.scan("ordo:exec:*", 1_000).await?;
        let mut found = Vec::new();
        for key in keys {
            if let Some(raw) = self.store.get(&key).await? {
                let state: ExecutionState = serde_json::from_str(&raw)?;
                if state.plan.intent_id == intent_id {
                    found.push(state);
                }
            }
        }
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    /// Append a schema-evolution observation for a tool. Fire-and-forget
    /// callers spawn this; failures are logged, never propagated.
    pub async fn record_schema_mismatch(
        &self,
        tool_name: &str,
        expected: &[String],
        unexpected: &[String],
        missing: &[String],
    ) -> OrdoResult<()> {
        let seq = self
            .store
            .incr(&format!("ordo:schema-drift:{tool_name}:seq"))
            .await?;
        let entry = serde_json::json!({
            "tool": tool_name,
            "observed_at": self.clock.now_iso(),
            "expected": expected,
            "unexpected": unexpected,
            "missing": missing,
        });
        self.store
            .set(
                &format!("ordo:schema-drift:{tool_name}:{seq}"),
                &entry.to_string(),
                Some(Duration::from_secs(30 * 24 * 3600)),
            )
            .await
    }
}
