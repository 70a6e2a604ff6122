//! Provider registry.
//!
//! Maps a configured backend name to its constructor. Resolution happens
//! once at configuration time; an unknown name is a startup configuration
//! error, never a runtime dispatch failure.

use std::sync::Arc;

use crate::error::GatewayError;
use crate::providers::Provider;
use crate::providers::gemini::GeminiProvider;
use crate::providers::openai::OpenAiProvider;

/// Everything a backend constructor needs from configuration.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: Option<String>,
    pub credential: String,
    pub models: Vec<String>,
}

type Constructor = fn(ProviderSettings) -> Arc<dyn Provider>;

const REGISTRY: &[(&str, Constructor)] = &[
    ("openai", |s| {
        Arc::new(OpenAiProvider::new(s.base_url, s.credential, s.models))
    }),
    ("gemini", |s| {
        Arc::new(GeminiProvider::new(s.base_url, s.credential, s.models))
    }),
];

/// Construct the backend named in the configuration.
pub fn build(name: &str, settings: ProviderSettings) -> Result<Arc<dyn Provider>, GatewayError> {
    REGISTRY
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, constructor)| constructor(settings))
        .ok_or_else(|| {
            GatewayError::Configuration(format!(
                "unknown provider '{name}' (known: {})",
                known_names().join(", ")
            ))
        })
}

/// Names of all registered backends.
pub fn known_names() -> Vec<&'static str> {
    REGISTRY.iter().map(|(name, _)| *name).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
