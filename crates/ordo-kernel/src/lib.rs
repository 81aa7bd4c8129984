//! Ordo Kernel — data model, capability traits, and contracts.
//!
//! The kernel defines *what* the execution engine works with: the intent and
//! plan models, the execution state machine, checkpoints and drift detection,
//! failure-triage and failover types, and the capability traits the runtime
//! consumes (`KVStore`, `VectorIndex`, `StructuredGenerator`, `ToolExecutor`).
//!
//! Concrete implementations live in `ordo-runtime`; the kernel never depends
//! on the runtime.

pub mod capabilities;
pub mod checkpoint;
pub mod clock;
pub mod error;
pub mod execution;
pub mod failover;
pub mod intent;
pub mod plan;
pub mod tool;
pub mod trace;
pub mod triage;

pub use capabilities::{
    CasOutcome, GenerationOutput, GenerationRequest, KVStore, StructuredGenerator, ToolExecutor,
    VectorIndex, VectorIndexStats, VectorMatch, VectorRecord,
};
pub use checkpoint::{
    Checkpoint, CheckpointReason, CodeIdentity, DriftRecommendation, drift_recommendation,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorCode, ErrorEnvelope, OrdoError, OrdoResult};
pub use execution::{
    ExecutionError, ExecutionState, ExecutionStatus, StateTransition, StepState, StepStatus,
};
pub use failover::{
    FailoverAction, FailoverPolicy, FailoverSuggestion, PartySizeRange, render_template,
};
pub use intent::{CandidateIntent, Intent, IntentHypotheses, IntentMetadata, IntentType};
pub use plan::{Plan, PlanConstraints, PlanMetadata, PlanStep, RawPlan, RawPlanStep};
pub use tool::{FieldError, ToolDefinition, ToolError, ToolOutcome, validate_against_schema};
pub use trace::{NoopTraceSink, TokenUsage, TraceEntry, TracePhase, TraceSink, VecTraceSink};
pub use triage::{FailureCategory, SuggestedAction, TriageResult};
