use std::time::Duration;

use crate::budget::BudgetScope;
use crate::providers::ProviderError;

/// Unified gateway error type returned to callers.
///
/// Every variant carries enough structure for a caller to react without
/// parsing message strings: `kind` names the failure class and
/// `retry_after` surfaces the wait hint where one exists. Raw provider or
/// database errors never cross this boundary.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("policy violation: {reason}")]
    PolicyViolation { reason: String },

    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },

    #[error("budget exceeded ({scope}): ${remaining:.6} remaining")]
    BudgetExceeded { scope: BudgetScope, remaining: f64 },

    #[error("provider unavailable after {attempts} attempts: {source}")]
    ProviderUnavailable {
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("provider error: {0}")]
    Provider(ProviderError),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GatewayError {
    /// Stable machine-readable failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PolicyViolation { .. } => "policy_violation",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::Provider(_) => "provider_error",
            Self::Timeout(_) => "timeout",
            Self::Configuration(_) => "configuration_error",
        }
    }

    /// Wait hint for retryable denials, if the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after } => Some(*retry_after),
            Self::ProviderUnavailable { source, .. } => source.retry_after(),
            _ => None,
        }
    }
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        Self::Provider(err)
    }
}
