//! Gateway facade.
//!
//! The single mediation point between agent callers and LLM backends.
//! Every request walks the same pipeline: policy evaluation, budget
//! reservation, rate acquisition, dispatch with retry, cost true-up, audit
//! append. A denial at any stage short-circuits before the provider is
//! touched, releases whatever was held, and still produces an audit
//! record.
//!
//! Per-request state machine: Received -> PolicyChecked -> BudgetReserved
//! -> RateChecked -> Dispatched -> {Completed | RetryPending | Failed} ->
//! Logged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLog, Outcome};
use crate::budget::CostTracker;
use crate::config::Config;
use crate::db::Database;
use crate::error::GatewayError;
use crate::limiter::{Acquire, RateLimiter};
use crate::policy::{Decision, PolicyEngine};
use crate::providers::Provider;
use crate::providers::cost::CostCalculator;
use crate::providers::pricing::PricingTable;
use crate::providers::registry::{self, ProviderSettings};
use crate::providers::retry::{RetryErrorKind, RetryPolicy, run_with_retry};
use crate::providers::types::GenerateRequest;

pub use crate::providers::types::GenerationParams;

/// One caller request as received by the gateway.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    /// Opaque caller label; all rate and budget accounting keys off it.
    pub identity: String,
    pub prompt: String,
    pub model: String,
    pub params: GenerationParams,
    /// Bounds the whole call including rate waits and retries. Falls back
    /// to the configured default and is capped at the configured maximum.
    pub timeout: Option<Duration>,
}

/// Successful gateway response.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub request_id: String,
    pub text: String,
    pub model: String,
    pub provider: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    pub latency: Duration,
}

/// The gateway instance. All shared accounting state lives here and is
/// reached only through its synchronized components; there is no ambient
/// global state.
pub struct Gateway {
    policy: PolicyEngine,
    limiter: RateLimiter,
    budget: CostTracker,
    cost: CostCalculator,
    audit: AuditLog,
    provider: Arc<dyn Provider>,
    retry: RetryPolicy,
    default_timeout: Duration,
    max_timeout: Duration,
    log_content: bool,
}

impl Gateway {
    /// Build a gateway from configuration, resolving the backend through
    /// the provider registry.
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let credential = config.provider.resolve_credential()?;
        let provider = registry::build(
            &config.provider.name,
            ProviderSettings {
                base_url: config.provider.base_url.clone(),
                credential,
                models: config.provider.models.clone(),
            },
        )?;
        Self::with_provider(config, provider)
    }

    /// Build a gateway over an already-constructed backend. Used by tests
    /// and embedders that bring their own `Provider` implementation.
    pub fn with_provider(
        config: &Config,
        provider: Arc<dyn Provider>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;

        let db = match &config.audit.db_path {
            Some(path) => Database::open(path),
            None => Database::open_in_memory(),
        }
        .map_err(|e| {
            GatewayError::Configuration(format!("failed to open audit database: {e}"))
        })?;

        if config.experimental.any_enabled() {
            warn!(
                auto_remediation = config.experimental.auto_remediation,
                continuous_monitoring = config.experimental.continuous_monitoring,
                "Experimental autonomy flags are set; they are parsed but inactive"
            );
        }

        let mut pricing = PricingTable::with_defaults();
        pricing.extend(&config.provider.pricing);

        Ok(Self {
            policy: PolicyEngine::new(
                config.policy.rules.clone(),
                config.policy.max_prompt_chars,
            ),
            limiter: RateLimiter::new(
                config.rate_limits.algorithm,
                config.rate_limits.per_identity.map(|w| w.to_limit()),
                config.rate_limits.global.map(|w| w.to_limit()),
            ),
            budget: CostTracker::new(
                config.budgets.per_identity_ceiling,
                config.budgets.global_ceiling,
                config.budgets.reset_period,
            ),
            cost: CostCalculator::new(pricing),
            audit: AuditLog::new(db),
            provider,
            retry: config.retry.to_policy(),
            default_timeout: Duration::from_secs(config.policy.default_timeout_secs),
            max_timeout: Duration::from_secs(config.policy.max_timeout_secs),
            log_content: config.logging.log_content,
        })
    }

    /// Execute one request through the full pipeline.
    pub async fn request(&self, spec: RequestSpec) -> Result<GatewayResponse, GatewayError> {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let timeout = spec
            .timeout
            .unwrap_or(self.default_timeout)
            .min(self.max_timeout);
        let deadline = started + timeout;

        // Prompts are sensitive; they reach the logs only when explicitly
        // enabled.
        if self.log_content {
            tracing::debug!(
                request_id = %request_id,
                identity = %spec.identity,
                prompt = %spec.prompt,
                "Received request"
            );
        }

        // Received -> PolicyChecked
        if let Decision::Deny { reason } = self.policy.evaluate(&spec) {
            warn!(
                identity = %spec.identity,
                model = %spec.model,
                reason = %reason,
                "Request denied by policy"
            );
            self.append_outcome(&request_id, &spec, Outcome::PolicyDenied, Some(&reason), 0, started);
            return Err(GatewayError::PolicyViolation { reason });
        }

        // PolicyChecked -> BudgetReserved
        let estimate = self.cost.estimate(
            &spec.model,
            spec.prompt.chars().count(),
            spec.params.max_tokens,
        );
        if let Err(denial) = self.budget.reserve(&spec.identity, estimate) {
            let reason = format!(
                "estimated cost ${estimate:.6} exceeds the {} budget (${:.6} remaining)",
                denial.scope, denial.remaining
            );
            warn!(identity = %spec.identity, reason = %reason, "Request denied by budget");
            self.append_outcome(&request_id, &spec, Outcome::BudgetDenied, Some(&reason), 0, started);
            return Err(GatewayError::BudgetExceeded {
                scope: denial.scope,
                remaining: denial.remaining,
            });
        }

        // The reservation is now live. Every path out of this function must
        // settle it; the guard covers the caller dropping the future
        // mid-flight.
        let mut guard = ReservationGuard {
            gateway: self,
            request_id: request_id.clone(),
            identity: spec.identity.clone(),
            model: spec.model.clone(),
            estimate,
            armed: true,
        };

        // BudgetReserved -> RateChecked
        if let Acquire::Denied { retry_after } =
            self.limiter.acquire_blocking(&spec.identity, deadline).await
        {
            guard.armed = false;
            self.budget.release(&spec.identity, estimate);
            let reason = format!("rate limit exceeded, retry after {retry_after:?}");
            self.append_outcome(&request_id, &spec, Outcome::RateLimited, Some(&reason), 0, started);
            return Err(GatewayError::RateLimitExceeded { retry_after });
        }

        // RateChecked -> Dispatched. Provider I/O runs outside every
        // accounting lock; each attempt is bounded by the remaining budget.
        let provider = &self.provider;
        let result = run_with_retry(&self.retry, deadline, || {
            let attempt_request = GenerateRequest {
                model: spec.model.clone(),
                prompt: spec.prompt.clone(),
                params: spec.params.clone(),
                timeout: deadline.saturating_duration_since(Instant::now()),
            };
            async move { provider.generate(&attempt_request).await }
        })
        .await;

        match result {
            Ok((attempts, response)) => {
                let actual = self.cost.actual(&spec.model, &response.usage);
                self.budget.commit(&spec.identity, estimate, actual);
                guard.armed = false;

                self.audit.append(&AuditEntry {
                    request_id: request_id.clone(),
                    identity: spec.identity.clone(),
                    provider: self.provider.id().to_string(),
                    model: spec.model.clone(),
                    tokens_in: response.usage.tokens_in,
                    tokens_out: response.usage.tokens_out,
                    cost: actual,
                    latency_ms: response.latency.as_millis() as u64,
                    attempts,
                    outcome: Outcome::Completed,
                    reason: None,
                });
                info!(
                    request_id = %request_id,
                    identity = %spec.identity,
                    model = %spec.model,
                    attempts,
                    cost_usd = %format!("${actual:.6}"),
                    "Request completed"
                );

                Ok(GatewayResponse {
                    request_id,
                    text: response.text,
                    model: response.model,
                    provider: self.provider.id().to_string(),
                    tokens_in: response.usage.tokens_in,
                    tokens_out: response.usage.tokens_out,
                    cost: actual,
                    latency: response.latency,
                })
            }
            Err(retry_error) => {
                guard.armed = false;
                self.budget.release(&spec.identity, estimate);

                match retry_error.kind {
                    RetryErrorKind::Fatal(source) => {
                        let reason = source.to_string();
                        self.append_outcome(
                            &request_id,
                            &spec,
                            Outcome::Failed,
                            Some(&reason),
                            retry_error.attempts,
                            started,
                        );
                        Err(GatewayError::Provider(source))
                    }
                    RetryErrorKind::Exhausted(source) => {
                        let reason =
                            format!("transient failure persisted after {} attempts: {source}", retry_error.attempts);
                        self.append_outcome(
                            &request_id,
                            &spec,
                            Outcome::Failed,
                            Some(&reason),
                            retry_error.attempts,
                            started,
                        );
                        Err(GatewayError::ProviderUnavailable {
                            attempts: retry_error.attempts,
                            source,
                        })
                    }
                    RetryErrorKind::DeadlineExceeded => {
                        if retry_error.attempts == 0 {
                            // Nothing was dispatched; return the rate slot too.
                            self.limiter.release(&spec.identity);
                        }
                        let reason = format!("deadline of {timeout:?} exceeded");
                        self.append_outcome(
                            &request_id,
                            &spec,
                            Outcome::TimedOut,
                            Some(&reason),
                            retry_error.attempts,
                            started,
                        );
                        Err(GatewayError::Timeout(timeout))
                    }
                }
            }
        }
    }

    /// Committed spend for one identity in the current budget period.
    pub fn spend(&self, identity: &str) -> f64 {
        self.budget.spend(identity)
    }

    /// Committed system-wide spend in the current budget period.
    pub fn global_spend(&self) -> f64 {
        self.budget.global_spend()
    }

    /// Read access to the audit trail.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Probe the configured backend.
    pub async fn provider_health(&self) -> bool {
        self.provider.health_check().await
    }

    fn append_outcome(
        &self,
        request_id: &str,
        spec: &RequestSpec,
        outcome: Outcome,
        reason: Option<&str>,
        attempts: u32,
        started: Instant,
    ) {
        self.audit.append(&AuditEntry {
            request_id: request_id.to_string(),
            identity: spec.identity.clone(),
            provider: self.provider.id().to_string(),
            model: spec.model.clone(),
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
            latency_ms: started.elapsed().as_millis() as u64,
            attempts,
            outcome,
            reason: reason.map(String::from),
        });
    }
}

/// Settles the budget reservation if the request future is dropped before
/// it reaches a terminal state (caller-side cancellation). The normal
/// completion and failure paths disarm it first.
struct ReservationGuard<'a> {
    gateway: &'a Gateway,
    request_id: String,
    identity: String,
    model: String,
    estimate: f64,
    armed: bool,
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            request_id = %self.request_id,
            identity = %self.identity,
            "Request canceled in flight; releasing reservation"
        );
        self.gateway.budget.release(&self.identity, self.estimate);
        self.gateway.audit.append(&AuditEntry {
            request_id: self.request_id.clone(),
            identity: self.identity.clone(),
            provider: self.gateway.provider.id().to_string(),
            model: self.model.clone(),
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
            latency_ms: 0,
            attempts: 0,
            outcome: Outcome::Canceled,
            reason: Some("request future dropped before completion".to_string()),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;
    use crate::providers::types::{ProviderResponse, TokenUsage};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend double that counts invocations and replies instantly.
    struct EchoProvider {
        calls: AtomicU32,
    }

    impl EchoProvider {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
            }
        }
    }

    impl Provider for EchoProvider {
        fn id(&self) -> &str {
            "echo"
        }

        fn models(&self) -> Vec<String> {
            vec![]
        }

        fn supports_model(&self, _model: &str) -> bool {
            true
        }

        fn generate(
            &self,
            request: &GenerateRequest,
        ) -> Pin<Box<dyn Future<Output = Result<ProviderResponse, ProviderError>> + Send + '_>>
        {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let model = request.model.clone();
            Box::pin(async move {
                Ok(ProviderResponse {
                    text: "ok".to_string(),
                    model,
                    usage: TokenUsage {
                        tokens_in: 10,
                        tokens_out: 5,
                    },
                    latency: Duration::from_millis(1),
                    finish_reason: Some("stop".to_string()),
                })
            })
        }

        fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
            Box::pin(async { true })
        }
    }

    fn gateway_with(config_toml: &str, provider: Arc<dyn Provider>) -> Gateway {
        let config = Config::from_toml_str(config_toml).unwrap();
        Gateway::with_provider(&config, provider).unwrap()
    }

    fn spec(identity: &str, model: &str) -> RequestSpec {
        RequestSpec {
            identity: identity.to_string(),
            prompt: "Plan the refactor".to_string(),
            model: model.to_string(),
            params: GenerationParams::default(),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_successful_request_is_audited_and_charged() {
        let provider = Arc::new(EchoProvider::new());
        let gateway = gateway_with("", provider.clone());

        let response = gateway.request(spec("planner", "gpt-4o")).await.unwrap();
        assert_eq!(response.text, "ok");
        assert_eq!(response.provider, "echo");
        assert_eq!(response.tokens_in, 10);
        assert!(response.cost > 0.0);

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!((gateway.spend("planner") - response.cost).abs() < 1e-12);

        let records = gateway.audit().recent(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, "completed");
        assert_eq!(records[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_policy_denial_never_reaches_provider() {
        let provider = Arc::new(EchoProvider::new());
        let gateway = gateway_with(
            r#"
            [[policy.rules]]
            match = { models = ["unsafe-model"] }
            action = "deny"
            reason = "model is not approved for agent use"
            "#,
            provider.clone(),
        );

        let err = gateway
            .request(spec("planner", "unsafe-model"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PolicyViolation { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        let records = gateway.audit().recent(10).unwrap();
        assert_eq!(records[0].outcome, "policy_denied");
        assert_eq!(
            records[0].reason.as_deref(),
            Some("model is not approved for agent use")
        );
    }

    #[tokio::test]
    async fn test_unknown_model_costs_nothing_but_completes() {
        let provider = Arc::new(EchoProvider::new());
        let gateway = gateway_with("", provider);

        let response = gateway.request(spec("planner", "house-model")).await.unwrap();
        assert_eq!(response.cost, 0.0);
        assert_eq!(gateway.spend("planner"), 0.0);
    }

    #[tokio::test]
    async fn test_timeout_capped_at_configured_max() {
        let provider = Arc::new(EchoProvider::new());
        let gateway = gateway_with(
            r#"
            [policy]
            default_timeout_secs = 1
            max_timeout_secs = 2
            "#,
            provider,
        );

        // A huge caller timeout is capped, not honored verbatim; the
        // request still completes well inside the cap.
        let mut request = spec("planner", "gpt-4o");
        request.timeout = Some(Duration::from_secs(3600));
        gateway.request(request).await.unwrap();
    }

    #[tokio::test]
    async fn test_reserved_identity_is_denied() {
        let provider = Arc::new(EchoProvider::new());
        let gateway = gateway_with("", provider.clone());

        let err = gateway
            .request(spec(crate::GLOBAL_KEY, "gpt-4o"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PolicyViolation { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_experimental_flags_change_nothing() {
        let provider = Arc::new(EchoProvider::new());
        let gateway = gateway_with(
            r#"
            [experimental]
            auto_remediation = true
            continuous_monitoring = true
            "#,
            provider.clone(),
        );

        gateway.request(spec("planner", "gpt-4o")).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
