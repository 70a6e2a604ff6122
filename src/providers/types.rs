//! Request and response types shared by all backend adapters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sampling and sizing parameters for one generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Maximum output tokens to generate.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// System instruction prepended to the conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: None,
            top_p: None,
            stop: None,
            system: None,
        }
    }
}

fn default_max_tokens() -> u32 {
    1024
}

/// A fully-resolved generation request as handed to a backend adapter.
/// The timeout bounds this single attempt; the retry loop recomputes it
/// from the caller's remaining budget before each attempt.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub params: GenerationParams,
    pub timeout: Duration,
}

/// Token counts reported by the backend for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub tokens_in: u32,
    pub tokens_out: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.tokens_in + self.tokens_out
    }
}

/// Normalized backend response. Adapters map their native wire format into
/// this; callers never see provider-specific shapes.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
    pub latency: Duration,
    pub finish_reason: Option<String>,
}
