//! Provider abstraction.
//!
//! Defines the `Provider` capability trait and the provider error taxonomy,
//! plus sub-modules for pricing, cost calculation, retry discipline, and
//! the concrete backend adapters (OpenAI-compatible, Gemini).

pub mod cost;
pub mod gemini;
pub mod openai;
pub mod pricing;
pub mod registry;
pub mod retry;
pub mod types;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::providers::types::{GenerateRequest, ProviderResponse};

// Re-exports for convenience.
pub use self::cost::CostCalculator;
pub use self::pricing::PricingTable;
pub use self::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// ProviderError
// ---------------------------------------------------------------------------

/// Errors that can occur during provider operations.
///
/// The gateway distinguishes two classes: transient conditions (timeouts,
/// throttling, 5xx) are retried with backoff; everything else is fatal and
/// surfaces immediately.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rate limited by provider, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("content rejected by provider: {0}")]
    ContentRejected(String),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    /// Whether this condition is expected to clear on its own and is safe
    /// to retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::RateLimited { .. } => true,
            Self::Api { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            Self::Authentication(_)
            | Self::InvalidRequest(_)
            | Self::ContentRejected(_)
            | Self::MalformedResponse(_) => false,
        }
    }

    /// Provider-supplied wait hint, when one was given.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Map an unsuccessful HTTP status to the provider error taxonomy.
///
/// Shared by the backend adapters; each passes the response body as the
/// message and any parsed `Retry-After` value.
pub(crate) fn classify_http_status(
    status: u16,
    message: String,
    retry_after: Option<Duration>,
) -> ProviderError {
    match status {
        401 | 403 => ProviderError::Authentication(message),
        429 => ProviderError::RateLimited { retry_after },
        400 => {
            let lowered = message.to_lowercase();
            if lowered.contains("content_policy")
                || lowered.contains("content policy")
                || lowered.contains("safety")
            {
                ProviderError::ContentRejected(message)
            } else {
                ProviderError::InvalidRequest(message)
            }
        }
        s if (402..500).contains(&s) && s != 408 => ProviderError::InvalidRequest(message),
        s => ProviderError::Api { status: s, message },
    }
}

/// Parse an RFC 7231 `Retry-After` header value given in seconds.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Trait that all LLM backends must implement.
///
/// Async methods return boxed futures so the trait is dyn-compatible (can
/// be used as `Arc<dyn Provider>`). No `async_trait` macro is needed.
pub trait Provider: Send + Sync {
    /// Unique identifier for this backend (e.g. "openai", "gemini").
    fn id(&self) -> &str;

    /// Model identifiers this backend serves. An empty list means the
    /// backend accepts any model name it is handed.
    fn models(&self) -> Vec<String>;

    /// Check whether a specific model string is handled by this backend.
    fn supports_model(&self, model: &str) -> bool;

    /// Single-shot text generation.
    fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderResponse, ProviderError>> + Send + '_>>;

    /// Lightweight health probe (e.g. can we reach the API at all?).
    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
