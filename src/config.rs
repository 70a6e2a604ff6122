use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::budget::ResetPeriod;
use crate::error::GatewayError;
use crate::limiter::{Algorithm, WindowLimit};
use crate::policy::PolicyRule;
use crate::providers::pricing::ModelPricing;
use crate::providers::registry;
use crate::providers::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Tracks which configuration settings are overridden by environment
/// variables, so operators can tell why a file edit had no effect.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Check whether a setting key (e.g. "provider.name") is overridden.
    pub fn is_overridden(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    /// Get the env var name that overrides the given setting key.
    pub fn env_var_for(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    /// All overrides as a map of setting key -> env var name.
    pub fn all(&self) -> &HashMap<String, String> {
        &self.overrides
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub budgets: BudgetsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub experimental: ExperimentalConfig,
    /// Env var overrides are not serialized to TOML.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RateLimitsConfig {
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_identity: Option<WindowLimitConfig>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global: Option<WindowLimitConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct WindowLimitConfig {
    pub limit: u32,
    pub window_secs: u64,
}

impl WindowLimitConfig {
    pub fn to_limit(self) -> WindowLimit {
        WindowLimit {
            limit: self.limit,
            window: Duration::from_secs(self.window_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BudgetsConfig {
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_identity_ceiling: Option<f64>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_ceiling: Option<f64>,
    #[serde(default)]
    pub reset_period: ResetPeriod,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Ordered rule list; first matching rule decides.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    /// Applied when the caller supplies no timeout.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Caller-supplied timeouts are capped here.
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            max_prompt_chars: default_max_prompt_chars(),
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_name")]
    pub name: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Inline credential. Prefer `credential_env` so secrets stay out of
    /// config files.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    /// Name of the environment variable holding the credential.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_env: Option<String>,
    /// Models this deployment serves; empty accepts any model name.
    #[serde(default)]
    pub models: Vec<String>,
    /// Per-model pricing overrides merged over the built-in table.
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            base_url: None,
            credential: None,
            credential_env: None,
            models: Vec::new(),
            pricing: HashMap::new(),
        }
    }
}

impl ProviderConfig {
    /// Resolve the backend credential from inline config or the named
    /// environment variable.
    pub fn resolve_credential(&self) -> Result<String, GatewayError> {
        if let Some(credential) = &self.credential {
            return Ok(credential.clone());
        }
        if let Some(var) = &self.credential_env {
            return std::env::var(var).map_err(|_| {
                GatewayError::Configuration(format!(
                    "credential env var '{var}' is not set"
                ))
            });
        }
        Err(GatewayError::Configuration(format!(
            "provider '{}' has neither credential nor credential_env configured",
            self.name
        )))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.multiplier,
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuditConfig {
    /// Omit for an in-memory audit log.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// When false, prompt text never appears in logs.
    #[serde(default)]
    pub log_content: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_content: false,
        }
    }
}

/// Gated future-autonomy switches. Parsed and reported, but nothing in the
/// request path acts on them; they exist so enabling one is an explicit,
/// visible configuration change rather than a code edit.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExperimentalConfig {
    #[serde(default)]
    pub auto_remediation: bool,
    #[serde(default)]
    pub continuous_monitoring: bool,
}

impl ExperimentalConfig {
    pub fn any_enabled(&self) -> bool {
        self.auto_remediation || self.continuous_monitoring
    }
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file and apply env overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string (used by tests).
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        let mut overrides = EnvOverrides::default();

        if let Ok(value) = std::env::var("PORTCULLIS_PROVIDER") {
            self.provider.name = value;
            overrides.record("provider.name", "PORTCULLIS_PROVIDER");
        }
        if let Ok(value) = std::env::var("PORTCULLIS_BASE_URL") {
            self.provider.base_url = Some(value);
            overrides.record("provider.base_url", "PORTCULLIS_BASE_URL");
        }
        if let Ok(value) = std::env::var("PORTCULLIS_CREDENTIAL") {
            self.provider.credential = Some(value);
            overrides.record("provider.credential", "PORTCULLIS_CREDENTIAL");
        }
        if let Ok(value) = std::env::var("PORTCULLIS_DB_PATH") {
            self.audit.db_path = Some(PathBuf::from(value));
            overrides.record("audit.db_path", "PORTCULLIS_DB_PATH");
        }
        if let Ok(value) = std::env::var("PORTCULLIS_LOG_LEVEL") {
            self.logging.level = value;
            overrides.record("logging.level", "PORTCULLIS_LOG_LEVEL");
        }

        self.env_overrides = overrides;
    }

    /// Reject invalid limiter/budget/policy/retry settings. Runs once at
    /// startup; a gateway is never constructed over a bad configuration.
    pub fn validate(&self) -> Result<(), GatewayError> {
        for (label, window) in [
            ("rate_limits.per_identity", &self.rate_limits.per_identity),
            ("rate_limits.global", &self.rate_limits.global),
        ] {
            if let Some(window) = window {
                if window.limit == 0 {
                    return Err(config_error(format!("{label}.limit must be at least 1")));
                }
                if window.window_secs == 0 {
                    return Err(config_error(format!(
                        "{label}.window_secs must be at least 1"
                    )));
                }
            }
        }

        for (label, ceiling) in [
            (
                "budgets.per_identity_ceiling",
                self.budgets.per_identity_ceiling,
            ),
            ("budgets.global_ceiling", self.budgets.global_ceiling),
        ] {
            if let Some(ceiling) = ceiling {
                if !ceiling.is_finite() || ceiling <= 0.0 {
                    return Err(config_error(format!("{label} must be a positive amount")));
                }
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(config_error("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(config_error("retry.multiplier must be >= 1.0".into()));
        }
        if self.retry.max_backoff_ms < self.retry.base_backoff_ms {
            return Err(config_error(
                "retry.max_backoff_ms must be >= retry.base_backoff_ms".into(),
            ));
        }

        if self.policy.max_prompt_chars == 0 {
            return Err(config_error("policy.max_prompt_chars must be at least 1".into()));
        }
        if self.policy.default_timeout_secs == 0 {
            return Err(config_error(
                "policy.default_timeout_secs must be at least 1".into(),
            ));
        }
        if self.policy.default_timeout_secs > self.policy.max_timeout_secs {
            return Err(config_error(
                "policy.default_timeout_secs must not exceed policy.max_timeout_secs".into(),
            ));
        }
        for (index, rule) in self.policy.rules.iter().enumerate() {
            if rule.reason.trim().is_empty() {
                return Err(config_error(format!(
                    "policy.rules[{index}] has an empty reason"
                )));
            }
        }

        if !registry::known_names().contains(&self.provider.name.as_str()) {
            return Err(config_error(format!(
                "unknown provider '{}' (known: {})",
                self.provider.name,
                registry::known_names().join(", ")
            )));
        }
        if let Some(base_url) = &self.provider.base_url {
            url::Url::parse(base_url).map_err(|e| {
                config_error(format!("provider.base_url is not a valid URL: {e}"))
            })?;
        }

        Ok(())
    }
}

fn config_error(message: String) -> GatewayError {
    GatewayError::Configuration(message)
}

fn default_max_prompt_chars() -> usize {
    100_000
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_timeout_secs() -> u64 {
    120
}

fn default_provider_name() -> String {
    "openai".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
