//! External capability traits.
//!
//! The engine consumes its substrate — persistence, vector search, the
//! structured generator, and tool backends — through the traits in this
//! module. Concrete implementations are injected at the composition site;
//! test doubles plug in the same way. The kernel never depends on any
//! backend crate.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::OrdoResult;
use crate::tool::ToolOutcome;
use crate::trace::TokenUsage;

// ============================================================================
// KVStore
// ============================================================================

/// Outcome of a compare-and-swap write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The expected value matched and the new value was written.
    Written,
    /// The stored value differs; carries what the store holds now so the
    /// caller can rebase without a second read.
    Conflict { current: String },
    /// `expected` was given but the key does not exist.
    NotFound,
}

/// String-keyed blob store with TTLs, counters, sorted sets, and an atomic
/// compare-and-swap.
///
/// The CAS compares the full stored value; deployments on a scripting store
/// (Redis `EVAL`) implement it with a compare script, while stores without
/// scripting must provide an equivalent server-side atomic. The bundled
/// in-memory implementation runs it under one lock.
#[async_trait]
pub trait KVStore: Send + Sync {
    async fn get(&self, key: &str) -> OrdoResult<Option<String>>;

    /// Set a value, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> OrdoResult<()>;

    /// Set only if the key is absent. Returns `true` when the write happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> OrdoResult<bool>;

    /// Delete a key. Returns `true` when it existed.
    async fn del(&self, key: &str) -> OrdoResult<bool>;

    /// Delete only when the stored value equals `expected` (atomic).
    /// Used by the quorum lock to release without clobbering another holder.
    async fn del_if_equals(&self, key: &str, expected: &str) -> OrdoResult<bool>;

    /// Refresh a key's TTL. Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> OrdoResult<bool>;

    /// Atomically increment a counter key, creating it at 0 first.
    async fn incr(&self, key: &str) -> OrdoResult<i64>;

    /// Keys matching a glob-style pattern (`*` wildcard only), up to `count`.
    async fn scan(&self, pattern: &str, count: usize) -> OrdoResult<Vec<String>>;

    /// Add (or update) a member in a sorted set.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> OrdoResult<()>;

    /// Members with `min <= score <= max`, score-ascending, up to `limit`.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> OrdoResult<Vec<(String, f64)>>;

    /// Remove a member from a sorted set. Returns `true` when it was present.
    async fn zrem(&self, key: &str, member: &str) -> OrdoResult<bool>;

    /// Atomic compare-and-swap of the full value. `expected = None` means
    /// "create only" (conflicts when the key already exists).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> OrdoResult<CasOutcome>;
}

// ============================================================================
// VectorIndex
// ============================================================================

/// A stored vector with its payload.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub user_id: String,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

/// A search hit.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub record: VectorRecord,
    pub score: f32,
}

/// Index statistics.
#[derive(Debug, Clone, Default)]
pub struct VectorIndexStats {
    pub total_records: usize,
    pub dimensions: usize,
}

/// Semantic memory over embedding vectors.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn add(&self, record: VectorRecord) -> OrdoResult<()>;

    async fn search(
        &self,
        query: &[f32],
        filter: Option<&HashMap<String, String>>,
        top_k: usize,
        min_score: f32,
    ) -> OrdoResult<Vec<VectorMatch>>;

    async fn delete(&self, id: &str) -> OrdoResult<bool>;

    async fn delete_by_user(&self, user_id: &str) -> OrdoResult<usize>;

    async fn stats(&self) -> OrdoResult<VectorIndexStats>;
}

// ============================================================================
// StructuredGenerator
// ============================================================================

/// Request for schema-constrained generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system: String,
    /// JSON schema the output must satisfy; the generator enforces it or
    /// raises.
    pub schema: serde_json::Value,
    pub temperature: f32,
    pub timeout_ms: u64,
}

/// Schema-conforming generation output.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub data: serde_json::Value,
    pub model_id: String,
    pub token_usage: TokenUsage,
}

/// An LLM behind a structured-output contract. The caller specifies the
/// output shape; the generator must return conforming data or error.
#[async_trait]
pub trait StructuredGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> OrdoResult<GenerationOutput>;
}

// ============================================================================
// ToolExecutor
// ============================================================================

/// Dispatches one tool invocation. Must honor `timeout_ms` and never block
/// indefinitely; backend failures are reported inside the [`ToolOutcome`],
/// not as `Err`.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        tool_name: &str,
        params: &serde_json::Value,
        timeout_ms: u64,
    ) -> OrdoResult<ToolOutcome>;
}
