//! Ambiguity resolution over ranked intent candidates.
//!
//! Two situations force a clarification round instead of picking a winner:
//! the top two candidates sit within the confidence margin of each other, or
//! they target conflicting high-risk capabilities. The margin is fixed at
//! 0.15; deployments overriding it do so knowingly through
//! [`AmbiguityConfig`].

use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

use ordo_kernel::intent::{Intent, IntentHypotheses, IntentMetadata, IntentType};

#[derive(Debug, Clone)]
pub struct AmbiguityConfig {
    /// Candidates closer than this are considered indistinguishable.
    pub confidence_margin: f64,
    /// Capabilities whose mis-selection is costly enough that any
    /// disagreement between top candidates forces clarification.
    pub high_risk_capabilities: HashSet<String>,
}

impl Default for AmbiguityConfig {
    fn default() -> Self {
        Self {
            confidence_margin: 0.15,
            high_risk_capabilities: HashSet::from([
                "calendar.delete".to_string(),
                "email.send".to_string(),
                "payment.charge".to_string(),
            ]),
        }
    }
}

pub struct AmbiguityResolver {
    config: AmbiguityConfig,
}

impl AmbiguityResolver {
    pub fn new(config: AmbiguityConfig) -> Self {
        Self { config }
    }

    /// Reduce 1–3 normalized candidates to hypotheses.
    ///
    /// Candidates are ranked by confidence (descending, stable). With a
    /// single candidate the answer is trivially unambiguous.
    pub fn resolve(&self, mut candidates: Vec<Intent>) -> IntentHypotheses {
        assert!(!candidates.is_empty(), "resolve requires at least one candidate");
        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if candidates.len() == 1 {
            let primary = candidates.remove(0);
            return IntentHypotheses {
                primary,
                is_ambiguous: false,
                alternatives: Vec::new(),
            };
        }

        let near_equal =
            candidates[0].confidence - candidates[1].confidence < self.config.confidence_margin;
        let risky_conflict = self.conflicting_high_risk(&candidates[0], &candidates[1]);

        if near_equal || risky_conflict {
            debug!(
                near_equal,
                risky_conflict,
                top = candidates[0].confidence,
                second = candidates[1].confidence,
                "candidates are ambiguous, requesting clarification"
            );
            let primary = self.clarification_intent(&candidates);
            return IntentHypotheses {
                primary,
                is_ambiguous: true,
                alternatives: candidates,
            };
        }

        let primary = candidates.remove(0);
        IntentHypotheses {
            primary,
            is_ambiguous: false,
            alternatives: candidates,
        }
    }

    /// Top two candidates target different capabilities and at least one is
    /// high-risk.
    fn conflicting_high_risk(&self, a: &Intent, b: &Intent) -> bool {
        let (Some(cap_a), Some(cap_b)) = (a.param_str("capability"), b.param_str("capability"))
        else {
            return false;
        };
        cap_a != cap_b
            && (self.config.high_risk_capabilities.contains(cap_a)
                || self.config.high_risk_capabilities.contains(cap_b))
    }

    fn clarification_intent(&self, candidates: &[Intent]) -> Intent {
        let top = &candidates[0];
        let options: Vec<String> = candidates
            .iter()
            .map(|c| format!("{:?} ({:.2})", c.intent_type, c.confidence))
            .collect();
        Intent {
            id: Uuid::new_v4(),
            parent_intent_id: Some(top.id),
            intent_type: IntentType::ClarificationNeeded,
            confidence: top.confidence,
            parameters: top.parameters.clone(),
            raw_text: top.raw_text.clone(),
            explanation: Some(format!(
                "ambiguous between: {}",
                options.join(", ")
            )),
            metadata: IntentMetadata {
                version: 1,
                timestamp: top.metadata.timestamp.clone(),
                source: "ambiguity_resolver".into(),
                model_id: top.metadata.model_id.clone(),
            },
        }
    }
}
