//! Engine configuration.
//!
//! One serde-deserializable aggregate covering every tunable sub-system.
//! Values layer in the usual order: built-in defaults, then an optional
//! config file (TOML or JSON), then `ORDO_`-prefixed environment variables
//! (`ORDO_LOCK__VALIDITY_MS=5000` targets `lock.validity_ms`).

use serde::{Deserialize, Serialize};

use crate::idempotency::IdempotencyConfig;
use crate::lock::LockConfig;
use crate::memory::MemoryConfig;

/// Serializable mirror of [`crate::orchestrator::OrchestratorConfig`] minus
/// the backoff policy object (configured via `retry_base_ms`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub max_step_attempts: u32,
    pub max_modified_param_retries: u32,
    pub steps_per_slice: usize,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: 3,
            max_modified_param_retries: 2,
            steps_per_slice: 32,
            retry_base_ms: 1_000,
            retry_max_ms: 30_000,
        }
    }
}

impl DispatchConfig {
    pub fn to_orchestrator_config(&self) -> crate::orchestrator::OrchestratorConfig {
        crate::orchestrator::OrchestratorConfig {
            max_step_attempts: self.max_step_attempts,
            max_modified_param_retries: self.max_modified_param_retries,
            steps_per_slice: self.steps_per_slice,
            retry_backoff: crate::retry::RetryPolicy::ExponentialBackoff {
                base_ms: self.retry_base_ms,
                max_ms: self.retry_max_ms,
                jitter: true,
            },
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dispatch: DispatchConfig,
    pub memory: MemoryConfig,
    pub lock: LockConfig,
    pub idempotency: IdempotencyConfig,
}

impl EngineConfig {
    /// Load configuration: defaults ← optional file ← environment.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ORDO").separator("__"),
        );
        let loaded = builder.build()?;

        // Missing keys fall back to the serde defaults.
        let mut engine = EngineConfig::default();
        if let Ok(overlaid) = loaded.clone().try_deserialize::<EngineConfig>() {
            engine = overlaid;
        } else {
            // Partial overlays: deserialize section by section so one
            // malformed section does not silently reset the others.
            if let Ok(dispatch) = loaded.get::<DispatchConfig>("dispatch") {
                engine.dispatch = dispatch;
            }
            if let Ok(memory) = loaded.get::<MemoryConfig>("memory") {
                engine.memory = memory;
            }
            if let Ok(lock) = loaded.get::<LockConfig>("lock") {
                engine.lock = lock;
            }
            if let Ok(idempotency) = loaded.get::<IdempotencyConfig>("idempotency") {
                engine.idempotency = idempotency;
            }
        }
        Ok(engine)
    }
}
