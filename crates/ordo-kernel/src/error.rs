//! Engine error types and the wire-stable error code taxonomy.
//!
//! Every error the engine can surface maps onto a canonical [`ErrorCode`].
//! Codes are stable across releases so that callers and stored execution
//! records can be matched against them; the enum variants carry the
//! human-readable context.
//!
//! Expected-failure paths (CAS conflicts, triage verdicts) are modelled as
//! values, not panics — code that hits one returns the matching variant and
//! the caller decides whether to rebase, retry, or give up.

use thiserror::Error;

/// Engine operation result type.
pub type OrdoResult<T> = Result<T, OrdoError>;

// ============================================================================
// ErrorCode — wire-stable taxonomy
// ============================================================================

/// Canonical error codes persisted into execution records and traces.
///
/// Marked `#[non_exhaustive]` so new codes can be added in minor releases
/// without breaking exhaustive matches downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // Plan phase
    PlanGenerationFailed,
    PlanValidationFailed,
    PlanCircularDependency,
    // Tool phase
    ToolNotFound,
    ToolValidationFailed,
    ToolExecutionFailed,
    StepTimeout,
    // State phase
    StateTransitionInvalid,
    Conflict,
    NotFound,
    // Infrastructure
    MemoryOperationFailed,
    LockAcquireFailed,
    CheckpointStoreFailed,
    // Normalization
    UnknownTool,
    SchemaValidationFailed,
    // Execution-wide deadline (distinct from a per-step timeout)
    ExecutionTimeout,
    Cancelled,
    Internal,
}

impl ErrorCode {
    /// Wire representation of the code, e.g. `PLAN_CIRCULAR_DEPENDENCY`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanGenerationFailed => "PLAN_GENERATION_FAILED",
            Self::PlanValidationFailed => "PLAN_VALIDATION_FAILED",
            Self::PlanCircularDependency => "PLAN_CIRCULAR_DEPENDENCY",
            Self::ToolNotFound => "TOOL_NOT_FOUND",
            Self::ToolValidationFailed => "TOOL_VALIDATION_FAILED",
            Self::ToolExecutionFailed => "TOOL_EXECUTION_FAILED",
            Self::StepTimeout => "STEP_TIMEOUT",
            Self::StateTransitionInvalid => "STATE_TRANSITION_INVALID",
            Self::Conflict => "CONFLICT",
            Self::NotFound => "NOT_FOUND",
            Self::MemoryOperationFailed => "MEMORY_OPERATION_FAILED",
            Self::LockAcquireFailed => "LOCK_ACQUIRE_FAILED",
            Self::CheckpointStoreFailed => "CHECKPOINT_STORE_FAILED",
            Self::UnknownTool => "UNKNOWN_TOOL",
            Self::SchemaValidationFailed => "SCHEMA_VALIDATION_FAILED",
            Self::ExecutionTimeout => "EXECUTION_TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// OrdoError
// ============================================================================

/// Engine error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OrdoError {
    /// The plan generator produced no usable plan.
    #[error("Plan generation failed: {0}")]
    PlanGenerationFailed(String),

    /// A structurally invalid plan (dangling refs, constraint violations,
    /// unknown capabilities).
    #[error("Plan validation failed: {0}")]
    PlanValidationFailed(String),

    /// The dependency graph contains a cycle, either detected at build time
    /// or as a dispatch dead-lock at run time.
    #[error("Plan dependency graph contains a cycle: {0}")]
    PlanCircularDependency(String),

    /// No registered tool matches the requested name/version.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool input or output failed schema validation.
    #[error("Tool validation failed: {tool_name}: {message}")]
    ToolValidationFailed { tool_name: String, message: String },

    /// The tool backend reported a failure.
    #[error("Tool execution failed: {tool_name}: {message}")]
    ToolExecutionFailed { tool_name: String, message: String },

    /// A single step exceeded its `timeout_ms`.
    #[error("Step timed out after {timeout_ms}ms")]
    StepTimeout { timeout_ms: u64 },

    /// The whole execution exceeded `constraints.max_execution_time_ms`.
    #[error("Execution exceeded its deadline of {deadline_ms}ms")]
    ExecutionTimeout { deadline_ms: u64 },

    /// A status transition not permitted by the execution state machine.
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Optimistic write lost the race; carries the version the store holds now.
    #[error("Version conflict: store is at version {current_version}")]
    Conflict { current_version: u64 },

    /// The referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The persistence substrate failed.
    #[error("Memory operation failed: {0}")]
    MemoryOperationFailed(String),

    /// Quorum lock acquisition failed after all retries.
    #[error("Lock acquisition failed: {0}")]
    LockAcquireFailed(String),

    /// Writing or reading a checkpoint failed.
    #[error("Checkpoint store failed: {0}")]
    CheckpointStoreFailed(String),

    /// Normalization referenced a tool the registry has never seen.
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// A candidate intent or parameter set failed schema validation.
    #[error("Schema validation failed: {0}")]
    SchemaValidationFailed(String),

    /// The execution was cancelled cooperatively.
    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    /// Anything without a more specific home.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrdoError {
    /// The canonical code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::PlanGenerationFailed(_) => ErrorCode::PlanGenerationFailed,
            Self::PlanValidationFailed(_) => ErrorCode::PlanValidationFailed,
            Self::PlanCircularDependency(_) => ErrorCode::PlanCircularDependency,
            Self::ToolNotFound(_) => ErrorCode::ToolNotFound,
            Self::ToolValidationFailed { .. } => ErrorCode::ToolValidationFailed,
            Self::ToolExecutionFailed { .. } => ErrorCode::ToolExecutionFailed,
            Self::StepTimeout { .. } => ErrorCode::StepTimeout,
            Self::ExecutionTimeout { .. } => ErrorCode::ExecutionTimeout,
            Self::InvalidTransition { .. } => ErrorCode::StateTransitionInvalid,
            Self::Conflict { .. } => ErrorCode::Conflict,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::MemoryOperationFailed(_) => ErrorCode::MemoryOperationFailed,
            Self::LockAcquireFailed(_) => ErrorCode::LockAcquireFailed,
            Self::CheckpointStoreFailed(_) => ErrorCode::CheckpointStoreFailed,
            Self::UnknownTool(_) => ErrorCode::UnknownTool,
            Self::SchemaValidationFailed(_) => ErrorCode::SchemaValidationFailed,
            Self::Cancelled(_) => ErrorCode::Cancelled,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// `true` when the caller may safely retry without running compensations.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            Self::StepTimeout { .. }
                | Self::Conflict { .. }
                | Self::MemoryOperationFailed(_)
                | Self::LockAcquireFailed(_)
        )
    }

    /// Build the serializable envelope carried on the wire and in traces.
    pub fn to_envelope(&self, timestamp: String) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.code(),
            message: self.to_string(),
            details: serde_json::Value::Null,
            recoverable: self.recoverable(),
            timestamp,
        }
    }

    /// Convenience constructor for tool failures.
    pub fn tool_execution_failed(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecutionFailed {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for invalid transitions.
    pub fn invalid_transition(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        Self::InvalidTransition {
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        }
    }
}

impl From<serde_json::Error> for OrdoError {
    fn from(err: serde_json::Error) -> Self {
        OrdoError::Internal(format!("serialization: {err}"))
    }
}

// ============================================================================
// ErrorEnvelope — the persisted / wire form
// ============================================================================

/// The serializable error shape stored on execution records and emitted in
/// traces: `{code, message, details, recoverable, timestamp}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub recoverable: bool,
    pub timestamp: String,
}
