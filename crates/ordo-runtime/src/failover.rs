//! Failover policy engine.
//!
//! Policies are evaluated in registration order; a policy matches when the
//! intent type, failure category, minimum confidence, and (when present) the
//! party-size range all apply. The first match wins and its first action is
//! the recommendation. Suggestion expansion is deterministic given identical
//! inputs.

use tracing::debug;

use ordo_kernel::failover::{
    FailoverAction, FailoverPolicy, FailoverSuggestion, render_template,
};
use ordo_kernel::intent::Intent;
use ordo_kernel::triage::TriageResult;

/// Result of policy evaluation.
#[derive(Debug, Clone)]
pub struct FailoverMatch {
    pub policy: FailoverPolicy,
    pub recommended_action: FailoverAction,
}

#[derive(Default)]
pub struct FailoverEngine {
    policies: Vec<FailoverPolicy>,
}

impl FailoverEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a policy. Order of registration is evaluation order.
    pub fn register(&mut self, policy: FailoverPolicy) {
        debug_assert!(
            !policy.actions.is_empty(),
            "failover policy '{}' must declare at least one action",
            policy.name
        );
        self.policies.push(policy);
    }

    pub fn with_policy(mut self, policy: FailoverPolicy) -> Self {
        self.register(policy);
        self
    }

    /// Find the first matching policy for a triaged failure.
    pub fn evaluate(&self, intent: &Intent, triage: &TriageResult) -> Option<FailoverMatch> {
        for policy in &self.policies {
            if !self.matches(policy, intent, triage) {
                continue;
            }
            let Some(first_action) = policy.actions.first() else {
                continue;
            };
            debug!(policy = %policy.name, category = ?triage.category, "failover policy matched");
            return Some(FailoverMatch {
                policy: policy.clone(),
                recommended_action: first_action.clone(),
            });
        }
        None
    }

    fn matches(&self, policy: &FailoverPolicy, intent: &Intent, triage: &TriageResult) -> bool {
        if policy.intent_type != intent.intent_type {
            return false;
        }
        if !policy.failure_reasons.contains(&triage.category) {
            return false;
        }
        if intent.confidence < policy.min_confidence {
            return false;
        }
        if let Some(range) = &policy.party_size_range {
            match intent.param_u64("party_size") {
                Some(size) if range.contains(size) => {}
                _ => return false,
            }
        }
        true
    }

    /// Expand an action into user-facing suggestions.
    ///
    /// When the action's params carry an `alternatives` array, each element
    /// becomes one suggestion with `{value}` substituted into the template;
    /// otherwise a single suggestion is produced. Confidence descends from
    /// 0.9 in steps of 0.1 (floor 0.1) so suggestion order survives sorting
    /// downstream.
    pub fn suggestions(&self, action: &FailoverAction) -> Vec<FailoverSuggestion> {
        let alternatives = action
            .params
            .get("alternatives")
            .and_then(|v| v.as_array())
            .cloned();

        match alternatives {
            Some(values) => values
                .into_iter()
                .enumerate()
                .map(|(i, value)| {
                    let mut params = action.params.clone();
                    params.insert("value".into(), value.clone());
                    FailoverSuggestion {
                        kind: action.kind,
                        message: render_template(&action.message_template, &params),
                        value,
                        confidence: (0.9 - 0.1 * i as f64).max(0.1),
                    }
                })
                .collect(),
            None => vec![FailoverSuggestion {
                kind: action.kind,
                message: render_template(&action.message_template, &action.params),
                value: serde_json::Value::Null,
                confidence: 0.9,
            }],
        }
    }
}
