//! Trace entries — the append-only observability stream.
//!
//! Every phase of normalization, planning, and execution emits a
//! [`TraceEntry`] into a [`TraceSink`]. Cost accounting (token usage) rides
//! along on the entries; it is advisory observability, nothing gates on it.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

// ============================================================================
// TokenUsage
// ============================================================================

/// Token accounting for one generator call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
    }
}

// ============================================================================
// TraceEntry
// ============================================================================

/// Which pipeline phase produced the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TracePhase {
    Planning,
    Execution,
    Normalization,
}

/// One record in the trace stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: String,
    pub phase: TracePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl TraceEntry {
    /// Minimal entry with just a phase, event name, and timestamp.
    pub fn event(phase: TracePhase, event: impl Into<String>, timestamp: String) -> Self {
        Self {
            timestamp,
            phase,
            step_id: None,
            event: event.into(),
            input: None,
            output: None,
            error: None,
            latency_ms: None,
            model_id: None,
            token_usage: None,
        }
    }

    pub fn with_step(mut self, step_id: Uuid) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_io(mut self, input: Option<serde_json::Value>, output: Option<serde_json::Value>) -> Self {
        self.input = input;
        self.output = output;
        self
    }
}

// ============================================================================
// TraceSink
// ============================================================================

/// Append-only consumer of trace entries. Implementations must not fail the
/// caller — tracing is never on the critical path.
pub trait TraceSink: Send + Sync {
    fn record(&self, entry: TraceEntry);
}

/// Discards everything.
pub struct NoopTraceSink;

impl TraceSink for NoopTraceSink {
    fn record(&self, _entry: TraceEntry) {}
}

/// Collects entries in memory; the test suites assert against it.
#[derive(Default)]
pub struct VecTraceSink {
    entries: Mutex<Vec<TraceEntry>>,
}

impl VecTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.lock().expect("trace sink poisoned").clone()
    }

    /// Entries whose `event` equals the given name.
    pub fn events_named(&self, event: &str) -> Vec<TraceEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.event == event)
            .collect()
    }
}

impl TraceSink for VecTraceSink {
    fn record(&self, entry: TraceEntry) {
        self.entries.lock().expect("trace sink poisoned").push(entry);
    }
}
