//! Tool registry — typed registration, semver resolution, and dispatch.
//!
//! Tools register a [`ToolDefinition`] together with a [`ToolHandler`] under
//! `(name, version)`; re-registration of the same pair is forbidden.
//! Name-only lookups resolve to the highest registered semver; a
//! `name@version` reference resolves exactly. Dispatch validates input
//! against the tool's schema, runs the handler under the caller's timeout,
//! and validates output against the optional return schema.
//!
//! Runtime registration is allowed but must happen before the first
//! invocation of that tool name.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ordo_kernel::capabilities::ToolExecutor;
use ordo_kernel::error::{OrdoError, OrdoResult};
use ordo_kernel::tool::{ToolDefinition, ToolOutcome, validate_against_schema};

use crate::memory::ExecutionMemory;

// ============================================================================
// ToolHandler
// ============================================================================

/// The implementation half of a registered tool. Backend failures are
/// returned as `Err`; the registry folds them into a failed [`ToolOutcome`].
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, params: serde_json::Value) -> OrdoResult<serde_json::Value>;
}

type BoxedToolFn = Box<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = OrdoResult<serde_json::Value>> + Send>>
        + Send
        + Sync,
>;

/// Adapter turning an async closure into a [`ToolHandler`].
pub struct ClosureTool {
    func: BoxedToolFn,
}

impl ClosureTool {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = OrdoResult<serde_json::Value>> + Send + 'static,
    {
        Self {
            func: Box::new(move |params| Box::pin(func(params))),
        }
    }
}

#[async_trait]
impl ToolHandler for ClosureTool {
    async fn call(&self, params: serde_json::Value) -> OrdoResult<serde_json::Value> {
        (self.func)(params).await
    }
}

// ============================================================================
// ToolRegistry
// ============================================================================

struct RegisteredTool {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

/// Registry of versioned tools. Cheap to share via `Arc`.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, BTreeMap<semver::Version, Arc<RegisteredTool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool implementation under `(definition.name,
    /// definition.version)`.
    pub fn register(
        &self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> OrdoResult<()> {
        let version = semver::Version::parse(&definition.version).map_err(|e| {
            OrdoError::Internal(format!(
                "tool '{}' has invalid version '{}': {e}",
                definition.name, definition.version
            ))
        })?;

        let mut versions = self.tools.entry(definition.name.clone()).or_default();
        if versions.contains_key(&version) {
            return Err(OrdoError::Internal(format!(
                "tool '{}@{}' is already registered",
                definition.name, definition.version
            )));
        }
        info!(tool = %definition.name, version = %definition.version, "tool registered");
        versions.insert(version, Arc::new(RegisteredTool { definition, handler }));
        Ok(())
    }

    /// Whether any version of `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.get(name).map(|v| !v.is_empty()).unwrap_or(false)
    }

    /// Resolve a definition. `version = None` picks the highest semver.
    pub fn definition(&self, name: &str, version: Option<&str>) -> OrdoResult<ToolDefinition> {
        self.resolve(name, version).map(|t| t.definition.clone())
    }

    /// Version map of every registered tool (highest version per name),
    /// captured into the process [`CodeIdentity`] at start-up.
    pub fn tool_versions(&self) -> HashMap<String, String> {
        self.tools
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .keys()
                    .next_back()
                    .map(|v| (entry.key().clone(), v.to_string()))
            })
            .collect()
    }

    fn resolve(&self, name: &str, version: Option<&str>) -> OrdoResult<Arc<RegisteredTool>> {
        let versions = self
            .tools
            .get(name)
            .ok_or_else(|| OrdoError::ToolNotFound(name.to_string()))?;
        match version {
            None => versions
                .values()
                .next_back()
                .cloned()
                .ok_or_else(|| OrdoError::ToolNotFound(name.to_string())),
            Some(v) => {
                let parsed = semver::Version::parse(v)
                    .map_err(|e| OrdoError::ToolNotFound(format!("{name}@{v}: {e}")))?;
                versions
                    .get(&parsed)
                    .cloned()
                    .ok_or_else(|| OrdoError::ToolNotFound(format!("{name}@{v}")))
            }
        }
    }

    /// Validate, dispatch under `timeout_ms`, validate output, and measure
    /// latency. Backend failures and timeouts come back inside the outcome;
    /// `Err` is reserved for caller mistakes (unknown tool, invalid input).
    pub async fn dispatch(
        &self,
        name: &str,
        version: Option<&str>,
        params: &serde_json::Value,
        timeout_ms: u64,
    ) -> OrdoResult<ToolOutcome> {
        let tool = self.resolve(name, version)?;

        let input_errors = validate_against_schema(&tool.definition.input_schema, params);
        if !input_errors.is_empty() {
            return Err(OrdoError::ToolValidationFailed {
                tool_name: name.to_string(),
                message: input_errors
                    .iter()
                    .map(|e| format!("{}: {}", e.path, e.message))
                    .collect::<Vec<_>>()
                    .join("; "),
            });
        }

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            tool.handler.call(params.clone()),
        )
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Err(_) => {
                warn!(tool = name, timeout_ms, "tool invocation timed out");
                ToolOutcome::err(format!("timed out after {timeout_ms}ms"), None, latency_ms)
            }
            Ok(Err(e)) => ToolOutcome::err(e.to_string(), None, latency_ms),
            Ok(Ok(output)) => {
                if let Some(return_schema) = &tool.definition.return_schema {
                    let output_errors = validate_against_schema(return_schema, &output);
                    if !output_errors.is_empty() {
                        return Ok(ToolOutcome::err(
                            format!(
                                "output failed schema validation: {}",
                                output_errors
                                    .iter()
                                    .map(|e| e.path.as_str())
                                    .collect::<Vec<_>>()
                                    .join(", ")
                            ),
                            None,
                            latency_ms,
                        ));
                    }
                }
                debug!(tool = name, latency_ms, "tool invocation succeeded");
                ToolOutcome::ok(output, latency_ms)
            }
        };
        Ok(outcome)
    }
}

/// The registry is itself the engine's [`ToolExecutor`]. A `name@version`
/// reference pins the version; a bare name resolves to the latest.
#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(
        &self,
        tool_name: &str,
        params: &serde_json::Value,
        timeout_ms: u64,
    ) -> OrdoResult<ToolOutcome> {
        match tool_name.split_once('@') {
            Some((name, version)) => self.dispatch(name, Some(version), params, timeout_ms).await,
            None => self.dispatch(tool_name, None, params, timeout_ms).await,
        }
    }
}

// ============================================================================
// Built-in tools
// ============================================================================

/// Register the built-in `wait`, `log`, and `self_reflect` tools.
pub fn register_builtins(registry: &ToolRegistry, memory: Arc<ExecutionMemory>) -> OrdoResult<()> {
    registry.register(
        ToolDefinition {
            name: "wait".into(),
            version: "1.0.0".into(),
            description: "Pause execution for a number of milliseconds".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"duration_ms": {"type": "integer"}},
                "required": ["duration_ms"]
            }),
            return_schema: None,
            requires_confirmation: false,
            default_timeout_ms: 60_000,
            compensation_tool: None,
        },
        Arc::new(ClosureTool::new(|params: serde_json::Value| async move {
            let duration_ms = params
                .get("duration_ms")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
            Ok(serde_json::json!({"waited_ms": duration_ms}))
        })),
    )?;

    registry.register(
        ToolDefinition {
            name: "log".into(),
            version: "1.0.0".into(),
            description: "Emit a message into the process log".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string"},
                    "level": {"type": "string", "enum": ["debug", "info", "warn", "error"]}
                },
                "required": ["message"]
            }),
            return_schema: None,
            requires_confirmation: false,
            default_timeout_ms: 1_000,
            compensation_tool: None,
        },
        Arc::new(ClosureTool::new(|params: serde_json::Value| async move {
            let message = params.get("message").and_then(|v| v.as_str()).unwrap_or("");
            match params.get("level").and_then(|v| v.as_str()).unwrap_or("info") {
                "debug" => debug!(target: "ordo::tool::log", "{message}"),
                "warn" => warn!(target: "ordo::tool::log", "{message}"),
                "error" => tracing::error!(target: "ordo::tool::log", "{message}"),
                _ => info!(target: "ordo::tool::log", "{message}"),
            }
            Ok(serde_json::json!({"logged": true}))
        })),
    )?;

    registry.register(
        ToolDefinition {
            name: "self_reflect".into(),
            version: "1.0.0".into(),
            description: "Summarize the execution history of an intent".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"intent_id": {"type": "string"}},
                "required": ["intent_id"]
            }),
            return_schema: None,
            requires_confirmation: false,
            default_timeout_ms: 5_000,
            compensation_tool: None,
        },
        Arc::new(ClosureTool::new(move |params: serde_json::Value| {
            let memory = memory.clone();
            async move {
                let intent_id = params
                    .get("intent_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<Uuid>().ok())
                    .ok_or_else(|| {
                        OrdoError::SchemaValidationFailed("intent_id must be a UUID".into())
                    })?;
                let executions = memory.executions_for_intent(intent_id).await?;
                let summaries: Vec<serde_json::Value> = executions
                    .iter()
                    .map(|e| {
                        serde_json::json!({
                            "execution_id": e.execution_id,
                            "status": e.status,
                            "steps": e.step_states.len(),
                            "version": e.version,
                        })
                    })
                    .collect();
                Ok(serde_json::json!({
                    "intent_id": intent_id,
                    "executions": summaries,
                }))
            }
        })),
    )?;

    Ok(())
}
