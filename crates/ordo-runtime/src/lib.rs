//! Ordo Runtime — the durable intent-to-execution engine.
//!
//! Implements the contracts defined in `ordo-kernel`: the normalizer and
//! ambiguity resolver, the planner and safety verifier, the orchestrator
//! with checkpoint/resume and logic-drift protection, failure triage and the
//! failover policy engine, and the concurrency substrate (optimistic state
//! writes, quorum locks, idempotency keys, and the delayed-resume queue).
//!
//! Composition happens at the application root: construct the capability
//! implementations (`KVStore`, `StructuredGenerator`, tool handlers), wire
//! them into [`orchestrator::Orchestrator::new`], and hand the orchestrator
//! to a [`orchestrator::ResumeWorker`].

pub mod ambiguity;
pub mod config;
pub mod failover;
pub mod idempotency;
pub mod lock;
pub mod memory;
pub mod normalizer;
pub mod orchestrator;
pub mod planner;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod safety;
pub mod store;
pub mod triage;
pub mod vector;

pub use ambiguity::{AmbiguityConfig, AmbiguityResolver};
pub use config::{DispatchConfig, EngineConfig};
pub use failover::{FailoverEngine, FailoverMatch};
pub use idempotency::{IdempotencyClaim, IdempotencyConfig, IdempotencyGuard};
pub use lock::{LockConfig, LockHandle, QuorumLock};
pub use memory::{ExecutionMemory, MemoryConfig, OccConfig};
pub use normalizer::{Normalizer, Ontology};
pub use orchestrator::{
    DriftReport, ExecutionRequest, Orchestrator, OrchestratorConfig, ResumeWorker, WorkerConfig,
};
pub use planner::{PlanBuilder, PlanGenerator};
pub use queue::{ResumeTask, TaskQueue};
pub use registry::{ClosureTool, ToolHandler, ToolRegistry, register_builtins};
pub use retry::{RetryConfig, RetryPolicy, retry_with_policy};
pub use safety::{SafetyPolicy, SafetyVerifier};
pub use store::InMemoryKVStore;
pub use triage::{TriageMode, TriageService};
pub use vector::InMemoryVectorIndex;
