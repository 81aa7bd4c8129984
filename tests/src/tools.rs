//! Sample tool set used across the integration suite.

use std::sync::Arc;

use ordo_kernel::error::OrdoResult;
use ordo_kernel::tool::ToolDefinition;
use ordo_runtime::registry::{ClosureTool, ToolRegistry};
use serde_json::json;

/// Register the calendar/weather/booking tools the scenarios use.
pub fn register_sample_tools(registry: &ToolRegistry) -> OrdoResult<()> {
    registry.register(
        ToolDefinition {
            name: "calendar.create".into(),
            version: "1.2.0".into(),
            description: "Create a calendar event".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "start": {"type": "string"}
                },
                "required": ["title"]
            }),
            return_schema: None,
            requires_confirmation: false,
            default_timeout_ms: 5_000,
            compensation_tool: Some("calendar.cancel".into()),
        },
        Arc::new(ClosureTool::new(|params: serde_json::Value| async move {
            Ok(json!({
                "event_id": "evt-1001",
                "title": params.get("title").cloned().unwrap_or_default(),
            }))
        })),
    )?;

    registry.register(
        ToolDefinition {
            name: "calendar.cancel".into(),
            version: "1.0.0".into(),
            description: "Cancel a previously created calendar event".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "original_parameters": {"type": "object"},
                    "original_output": {"type": "object"}
                }
            }),
            return_schema: None,
            requires_confirmation: false,
            default_timeout_ms: 5_000,
            compensation_tool: None,
        },
        Arc::new(ClosureTool::new(|_params| async move {
            Ok(json!({"cancelled": true}))
        })),
    )?;

    registry.register(
        ToolDefinition {
            name: "calendar.delete".into(),
            version: "1.0.0".into(),
            description: "Delete calendar events (destructive)".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"all": {"type": "boolean"}}
            }),
            return_schema: None,
            requires_confirmation: true,
            default_timeout_ms: 5_000,
            compensation_tool: None,
        },
        Arc::new(ClosureTool::new(|_params| async move {
            Ok(json!({"deleted": true}))
        })),
    )?;

    registry.register(
        ToolDefinition {
            name: "get_weather_data".into(),
            version: "2.1.0".into(),
            description: "Fetch a weather report for one location".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "location": {"type": "string"},
                    "units": {"type": "string", "enum": ["metric", "imperial"]}
                },
                "required": ["location"]
            }),
            return_schema: None,
            requires_confirmation: false,
            default_timeout_ms: 5_000,
            compensation_tool: None,
        },
        Arc::new(ClosureTool::new(|params: serde_json::Value| async move {
            Ok(json!({
                "location": params.get("location").cloned().unwrap_or_default(),
                "temp_c": 21,
            }))
        })),
    )?;

    registry.register(
        ToolDefinition {
            name: "summarize".into(),
            version: "1.0.0".into(),
            description: "Summarize upstream step outputs".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"text": {"type": "string"}, "inputs": {"type": "array"}}
            }),
            return_schema: None,
            requires_confirmation: false,
            default_timeout_ms: 5_000,
            compensation_tool: None,
        },
        Arc::new(ClosureTool::new(|_params| async move {
            Ok(json!({"summary": "reports combined"}))
        })),
    )?;

    registry.register(
        ToolDefinition {
            name: "booking.reserve".into(),
            version: "1.0.0".into(),
            description: "Reserve a table".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "time": {"type": "string"},
                    "party_size": {"type": "integer"}
                },
                "required": ["time"]
            }),
            return_schema: None,
            requires_confirmation: false,
            default_timeout_ms: 5_000,
            compensation_tool: None,
        },
        Arc::new(ClosureTool::new(|params: serde_json::Value| async move {
            Ok(json!({
                "reservation_id": "res-77",
                "time": params.get("time").cloned().unwrap_or_default(),
            }))
        })),
    )?;

    Ok(())
}
