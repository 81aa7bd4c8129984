//! Step parameter resolution.
//!
//! A parameter value of the form `$<step>.field.subfield` is substituted
//! from the referenced step's recorded output. The step reference is either
//! a step UUID or a zero-based step number. A reference whose path cannot be
//! resolved keeps its literal value and produces a warning — unresolved
//! forward references are tolerated for debugging, never fatal.

use std::collections::HashMap;
use uuid::Uuid;

use ordo_kernel::execution::ExecutionState;
use ordo_kernel::plan::PlanStep;

/// Resolved parameters plus warnings for every reference left unresolved.
pub struct ResolvedParams {
    pub value: serde_json::Value,
    pub warnings: Vec<String>,
}

/// Resolve `step.parameters` against the execution state.
///
/// Overrides recorded under `param_overrides:{step_id}` in the execution
/// context (written by the modified-params retry path) are merged over the
/// plan's parameters before substitution.
pub fn resolve_parameters(state: &ExecutionState, step: &PlanStep) -> ResolvedParams {
    let mut params: HashMap<String, serde_json::Value> = step.parameters.clone();
    if let Some(overrides) = state
        .context
        .get(&format!("param_overrides:{}", step.id))
        .and_then(|v| v.as_object())
    {
        for (key, value) in overrides {
            params.insert(key.clone(), value.clone());
        }
    }

    let mut warnings = Vec::new();
    let resolved: serde_json::Map<String, serde_json::Value> = params
        .into_iter()
        .map(|(key, value)| {
            let resolved = resolve_value(state, value, &mut warnings);
            (key, resolved)
        })
        .collect();

    ResolvedParams {
        value: serde_json::Value::Object(resolved),
        warnings,
    }
}

fn resolve_value(
    state: &ExecutionState,
    value: serde_json::Value,
    warnings: &mut Vec<String>,
) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) if s.starts_with('$') => {
            match lookup_reference(state, &s) {
                Some(found) => found,
                None => {
                    warnings.push(format!("unresolved reference '{s}'"));
                    serde_json::Value::String(s)
                }
            }
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .into_iter()
                .map(|item| resolve_value(state, item, warnings))
                .collect(),
        ),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, resolve_value(state, v, warnings)))
                .collect(),
        ),
        other => other,
    }
}

/// `$<uuid-or-number>[.path.to.field]` → value from that step's output.
fn lookup_reference(state: &ExecutionState, reference: &str) -> Option<serde_json::Value> {
    let body = reference.strip_prefix('$')?;
    let mut segments = body.split('.');
    let step_ref = segments.next()?;

    let step_id = if let Ok(id) = step_ref.parse::<Uuid>() {
        id
    } else if let Ok(number) = step_ref.parse::<u32>() {
        state
            .plan
            .steps
            .iter()
            .find(|s| s.step_number == number)?
            .id
    } else {
        return None;
    };

    let output = state.step_state(step_id)?.output.as_ref()?;
    let mut cursor = output;
    for segment in segments {
        cursor = match cursor {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cursor.clone())
}
