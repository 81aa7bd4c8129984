//! Distributed quorum lock.
//!
//! Mutual exclusion across N independent stores: an acquisition holds iff a
//! majority of stores accepted the lock id and enough validity remains after
//! accounting for acquisition time and clock drift. Single-store deployments
//! get the same code path by fanning one store into three virtual namespaces.
//!
//! The lock value is a fresh UUID per acquisition; release and extend are
//! value-checked so a holder can never clobber a lock that has since moved
//! to someone else.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use ordo_kernel::capabilities::{CasOutcome, KVStore};
use ordo_kernel::clock::Clock;
use ordo_kernel::error::{OrdoError, OrdoResult};

use crate::retry::RetryConfig;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LockConfig {
    /// How long an acquisition is valid, before drift compensation.
    pub validity_ms: u64,
    /// Clock-drift allowance as a fraction of acquisition elapsed time.
    pub drift_factor: f64,
    /// Backoff between acquisition rounds.
    pub acquire_retry: RetryConfig,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            validity_ms: 30_000,
            drift_factor: 0.01,
            acquire_retry: RetryConfig::exponential(3, 50, 500),
        }
    }
}

// ============================================================================
// LockHandle
// ============================================================================

/// Proof of a held lock. The caller must treat the lock as lost once
/// `valid_until_ms` passes, whether or not release has run.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub resource: String,
    pub lock_id: String,
    pub acquired_at_ms: u64,
    pub valid_until_ms: u64,
}

impl LockHandle {
    /// `true` while the caller may assume exclusive ownership.
    pub fn is_valid(&self, now_ms: u64) -> bool {
        now_ms < self.valid_until_ms
    }
}

// ============================================================================
// QuorumLock
// ============================================================================

/// Lock manager over N stores with majority agreement.
pub struct QuorumLock {
    /// `(store, key namespace)` pairs. Real multi-store deployments use empty
    /// namespaces; a single store is fanned into three virtual ones.
    stores: Vec<(Arc<dyn KVStore>, String)>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
}

impl QuorumLock {
    /// Build over N independent stores.
    pub fn new(stores: Vec<Arc<dyn KVStore>>, clock: Arc<dyn Clock>, config: LockConfig) -> Self {
        Self {
            stores: stores.into_iter().map(|s| (s, String::new())).collect(),
            clock,
            config,
        }
    }

    /// Simulate N=3 over one underlying store by keying into three virtual
    /// namespaces.
    pub fn single_store(store: Arc<dyn KVStore>, clock: Arc<dyn Clock>, config: LockConfig) -> Self {
        let stores = (0..3)
            .map(|i| (store.clone(), format!("ns{i}:")))
            .collect();
        Self {
            stores,
            clock,
            config,
        }
    }

    fn quorum(&self) -> usize {
        self.stores.len() / 2 + 1
    }

    fn key(namespace: &str, resource: &str) -> String {
        format!("ordo:lock:{namespace}{resource}")
    }

    /// Acquire the lock for `resource`, retrying with backoff.
    pub async fn acquire(&self, resource: &str) -> OrdoResult<LockHandle> {
        let attempts = self.config.acquire_retry.max_attempts.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.acquire_retry.policy.delay_for(attempt - 1)).await;
            }
            if let Some(handle) = self.try_acquire_once(resource).await? {
                return Ok(handle);
            }
        }
        Err(OrdoError::LockAcquireFailed(format!(
            "no quorum for '{resource}' after {attempts} attempts"
        )))
    }

    /// One acquisition round: set-if-absent on every store in parallel, then
    /// check quorum and residual validity.
    async fn try_acquire_once(&self, resource: &str) -> OrdoResult<Option<LockHandle>> {
        let lock_id = Uuid::new_v4().to_string();
        let ttl = Duration::from_millis(self.config.validity_ms);
        let started_ms = self.clock.now_millis();

        let grants = join_all(self.stores.iter().map(|(store, ns)| {
            let key = Self::key(ns, resource);
            let lock_id = lock_id.clone();
            async move { store.set_nx(&key, &lock_id, Some(ttl)).await.unwrap_or(false) }
        }))
        .await;

        let elapsed = self.clock.now_millis().saturating_sub(started_ms);
        let granted = grants.iter().filter(|&&g| g).count();
        let drift = (elapsed as f64 * self.config.drift_factor).ceil() as u64 + 2;
        let residual = self.config.validity_ms.saturating_sub(drift);

        if granted >= self.quorum() && residual > 0 {
            debug!(resource, granted, elapsed, "quorum lock acquired");
            return Ok(Some(LockHandle {
                resource: resource.to_string(),
                lock_id,
                acquired_at_ms: started_ms,
                valid_until_ms: started_ms + residual,
            }));
        }

        warn!(
            resource,
            granted,
            quorum = self.quorum(),
            "quorum lock round failed, releasing partial holdings"
        );
        self.release_value(resource, &lock_id).await;
        Ok(None)
    }

    /// Release the lock. Only entries still holding this acquisition's id
    /// are deleted.
    pub async fn release(&self, handle: &LockHandle) {
        self.release_value(&handle.resource, &handle.lock_id).await;
    }

    async fn release_value(&self, resource: &str, lock_id: &str) {
        join_all(self.stores.iter().map(|(store, ns)| {
            let key = Self::key(ns, resource);
            async move {
                let _ = store.del_if_equals(&key, lock_id).await;
            }
        }))
        .await;
    }

    /// Extend the lock's TTL on every store still holding our id. Succeeds
    /// only with quorum agreement; the handle's validity window is refreshed.
    pub async fn extend(&self, handle: &mut LockHandle) -> OrdoResult<bool> {
        let ttl = Duration::from_millis(self.config.validity_ms);
        let started_ms = self.clock.now_millis();

        let extended = join_all(self.stores.iter().map(|(store, ns)| {
            let key = Self::key(ns, &handle.resource);
            let lock_id = handle.lock_id.clone();
            async move {
                matches!(
                    store
                        .compare_and_swap(&key, Some(&lock_id), &lock_id, Some(ttl))
                        .await,
                    Ok(CasOutcome::Written)
                )
            }
        }))
        .await;

        let granted = extended.iter().filter(|&&g| g).count();
        if granted >= self.quorum() {
            let elapsed = self.clock.now_millis().saturating_sub(started_ms);
            let drift = (elapsed as f64 * self.config.drift_factor).ceil() as u64 + 2;
            handle.valid_until_ms = started_ms + self.config.validity_ms.saturating_sub(drift);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
