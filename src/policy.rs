//! Policy evaluation.
//!
//! Rules are evaluated in configuration order against the request alone;
//! no I/O, no clock, no mutation. The first rule whose match applies
//! decides the request. Requests matching no rule are allowed, but a set
//! of built-in guards runs first and fails closed on malformed input.

use serde::{Deserialize, Serialize};

use crate::GLOBAL_KEY;
use crate::gateway::RequestSpec;

/// Result of evaluating a request against the policy set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

/// What a matching rule does with the request. `Allow` short-circuits the
/// remaining rules, which makes exemptions expressible ahead of a broad
/// deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Deny,
    Allow,
}

/// Predicate over a request. Every present field must hold for the rule to
/// match; a matcher with no fields matches every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleMatch {
    /// Matches when the caller identity is in this list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identities: Option<Vec<String>>,
    /// Matches when the caller identity is NOT in this list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identities_not: Option<Vec<String>>,
    /// Matches when the requested model is in this list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    /// Matches when the requested model is NOT in this list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_not: Option<Vec<String>>,
    /// Matches when the requested max output tokens exceed this ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_over: Option<u32>,
    /// Matches when the prompt length in characters exceeds this ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_chars_over: Option<usize>,
}

impl RuleMatch {
    fn matches(&self, spec: &RequestSpec) -> bool {
        if let Some(identities) = &self.identities {
            if !identities.iter().any(|i| i == &spec.identity) {
                return false;
            }
        }
        if let Some(identities) = &self.identities_not {
            if identities.iter().any(|i| i == &spec.identity) {
                return false;
            }
        }
        if let Some(models) = &self.models {
            if !models.iter().any(|m| m == &spec.model) {
                return false;
            }
        }
        if let Some(models) = &self.models_not {
            if models.iter().any(|m| m == &spec.model) {
                return false;
            }
        }
        if let Some(ceiling) = self.max_tokens_over {
            if spec.params.max_tokens <= ceiling {
                return false;
            }
        }
        if let Some(ceiling) = self.prompt_chars_over {
            if spec.prompt.chars().count() <= ceiling {
                return false;
            }
        }
        true
    }
}

/// One ordered policy rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(rename = "match")]
    pub matcher: RuleMatch,
    pub action: Action,
    pub reason: String,
}

/// Deterministic rule evaluator. Built once from validated configuration;
/// replacing the rule set means constructing a new engine, so in-flight
/// requests are never retroactively affected.
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
    max_prompt_chars: usize,
}

impl PolicyEngine {
    pub fn new(rules: Vec<PolicyRule>, max_prompt_chars: usize) -> Self {
        Self {
            rules,
            max_prompt_chars,
        }
    }

    /// Evaluate a request. Built-in guards run first, then the configured
    /// rules in order; the first match decides.
    pub fn evaluate(&self, spec: &RequestSpec) -> Decision {
        if spec.identity.is_empty() {
            return deny("caller identity is empty");
        }
        if spec.identity == GLOBAL_KEY {
            return deny("caller identity collides with the reserved global accounting key");
        }
        if spec.prompt.trim().is_empty() {
            return deny("prompt is empty");
        }
        let prompt_chars = spec.prompt.chars().count();
        if prompt_chars > self.max_prompt_chars {
            return Decision::Deny {
                reason: format!(
                    "prompt length ({prompt_chars} chars) exceeds the maximum ({})",
                    self.max_prompt_chars
                ),
            };
        }

        for rule in &self.rules {
            if rule.matcher.matches(spec) {
                return match rule.action {
                    Action::Allow => Decision::Allow,
                    Action::Deny => Decision::Deny {
                        reason: rule.reason.clone(),
                    },
                };
            }
        }

        Decision::Allow
    }
}

fn deny(reason: &str) -> Decision {
    Decision::Deny {
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
