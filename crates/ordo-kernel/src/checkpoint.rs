//! Durable checkpoints and logic-drift detection.
//!
//! Before the orchestrator yields control (time-slice exhaustion, a
//! confirmation gate, a scheduled retry) it stores a [`Checkpoint`] tagged
//! with the [`CodeIdentity`] of the process that wrote it. On resume, the
//! current identity is compared against the pinned one; a differing `git_sha`
//! produces a [`DriftRecommendation`] that decides whether the execution may
//! proceed, must be replayed in shadow first, or needs a human.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::execution::ExecutionState;

// ============================================================================
// CodeIdentity
// ============================================================================

/// The code identity of the running process, read once at start-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeIdentity {
    /// Commit the binary was built from.
    pub git_sha: String,
    /// Semver of the orchestration logic, e.g. `"2.1.0"`.
    pub logic_version: String,
    /// Versions of every registered tool at start-up.
    pub tool_versions: HashMap<String, String>,
}

impl CodeIdentity {
    /// Read identity from `ORDO_GIT_SHA` / `ORDO_LOGIC_VERSION` environment
    /// variables, falling back to `"unknown"` / `"0.0.0"`.
    pub fn from_env(tool_versions: HashMap<String, String>) -> Self {
        Self {
            git_sha: std::env::var("ORDO_GIT_SHA").unwrap_or_else(|_| "unknown".into()),
            logic_version: std::env::var("ORDO_LOGIC_VERSION").unwrap_or_else(|_| "0.0.0".into()),
            tool_versions,
        }
    }

    /// Major component of `logic_version`; 0 when unparseable.
    pub fn logic_major(&self) -> u64 {
        semver::Version::parse(&self.logic_version)
            .map(|v| v.major)
            .unwrap_or(0)
    }
}

// ============================================================================
// Checkpoint
// ============================================================================

/// Why a checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    TimeSliceExhausted,
    AwaitingConfirmation,
    ScheduledRetry,
    Compensation,
    Shutdown,
}

/// A durable resume record. TTL is applied by the checkpoint store (7 days).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: Uuid,
    pub checkpoint_at: String,
    pub git_sha: String,
    pub logic_version: String,
    pub tool_versions: HashMap<String, String>,
    /// Full execution state at the moment of suspension.
    pub state_snapshot: ExecutionState,
    pub next_step_index: usize,
    /// Increments every time a checkpoint is written for this execution.
    pub segment_number: u64,
    pub reason: CheckpointReason,
    /// Version of the snapshot at write time, for staleness checks.
    pub version: u64,
}

// ============================================================================
// Drift detection
// ============================================================================

/// What resume should do given the identity delta between the checkpointing
/// process and the resuming one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriftRecommendation {
    /// Identical code — resume directly.
    Proceed,
    /// Same major logic version but different commit — replay the remaining
    /// steps against a no-op executor before trusting the resume.
    ShadowDryRun,
    /// Major logic version changed — park the execution for a human.
    ManualReview,
}

/// Compare the checkpoint's pinned identity with the current one.
pub fn drift_recommendation(pinned: &CodeIdentity, current: &CodeIdentity) -> DriftRecommendation {
    if pinned.git_sha == current.git_sha {
        return DriftRecommendation::Proceed;
    }
    if pinned.logic_major() == current.logic_major() {
        DriftRecommendation::ShadowDryRun
    } else {
        DriftRecommendation::ManualReview
    }
}
