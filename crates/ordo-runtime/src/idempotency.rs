//! Idempotency keys — at-most-once side effects within a TTL window.
//!
//! The dedup key is `sha256(user_id ‖ tool_name ‖ canonical parameters)`
//! truncated to 16 hex characters. The first claimant wins an atomic
//! set-if-absent with a 24-hour TTL; later claimants are told it is a
//! duplicate and the orchestrator proceeds without re-invoking the side
//! effect, reusing the cached output when one was recorded.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use ordo_kernel::capabilities::KVStore;
use ordo_kernel::error::OrdoResult;

/// Result of claiming an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyClaim {
    /// First occurrence — proceed with the side effect.
    Fresh,
    /// Seen within the TTL window; carries the cached output when the
    /// original invocation recorded one.
    Duplicate { cached_output: Option<serde_json::Value> },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IdempotencyConfig {
    pub ttl_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { ttl_secs: 24 * 3600 }
    }
}

/// Guard over a [`KVStore`] providing at-most-once semantics per dedup key.
pub struct IdempotencyGuard {
    store: Arc<dyn KVStore>,
    config: IdempotencyConfig,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn KVStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    /// Compute the dedup key. Parameters are re-serialized through
    /// `serde_json::Value`, whose object keys are ordered, so semantically
    /// equal parameter maps hash identically.
    pub fn dedup_key(user_id: &str, tool_name: &str, params: &serde_json::Value) -> String {
        let canonical = params.to_string();
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(tool_name.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        hex::encode(digest)[..16].to_string()
    }

    fn record_key(key: &str) -> String {
        format!("ordo:idem:{key}")
    }

    fn output_key(key: &str) -> String {
        format!("ordo:idem:{key}:output")
    }

    /// Attempt to claim the key atomically.
    pub async fn claim(
        &self,
        user_id: &str,
        tool_name: &str,
        params: &serde_json::Value,
    ) -> OrdoResult<IdempotencyClaim> {
        let key = Self::dedup_key(user_id, tool_name, params);
        let ttl = Duration::from_secs(self.config.ttl_secs);

        let fresh = self
            .store
            .set_nx(&Self::record_key(&key), "processed", Some(ttl))
            .await?;
        if fresh {
            return Ok(IdempotencyClaim::Fresh);
        }

        let cached_output = match self.store.get(&Self::output_key(&key)).await? {
            Some(raw) => serde_json::from_str(&raw).ok(),
            None => None,
        };
        Ok(IdempotencyClaim::Duplicate { cached_output })
    }

    /// Release a claim after a failed invocation so a retry can execute the
    /// side effect again. Only successful effects stay deduplicated.
    pub async fn release(
        &self,
        user_id: &str,
        tool_name: &str,
        params: &serde_json::Value,
    ) -> OrdoResult<()> {
        let key = Self::dedup_key(user_id, tool_name, params);
        self.store.del(&Self::record_key(&key)).await?;
        self.store.del(&Self::output_key(&key)).await?;
        Ok(())
    }

    /// Record the side effect's output so later duplicates can reuse it.
    pub async fn record_output(
        &self,
        user_id: &str,
        tool_name: &str,
        params: &serde_json::Value,
        output: &serde_json::Value,
    ) -> OrdoResult<()> {
        let key = Self::dedup_key(user_id, tool_name, params);
        self.store
            .set(
                &Self::output_key(&key),
                &output.to_string(),
                Some(Duration::from_secs(self.config.ttl_secs)),
            )
            .await
    }
}
