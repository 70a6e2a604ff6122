pub mod audit;
pub mod budget;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod limiter;
pub mod policy;
pub mod providers;

pub use crate::audit::{AuditLog, AuditRecord, Outcome, UsageSummary};
pub use crate::budget::{BudgetScope, CostTracker};
pub use crate::config::Config;
pub use crate::error::GatewayError;
pub use crate::gateway::{Gateway, GatewayResponse, RequestSpec};
pub use crate::limiter::RateLimiter;
pub use crate::policy::PolicyEngine;
pub use crate::providers::{Provider, ProviderError};

/// Reserved accounting key for system-wide rate and budget state.
///
/// Caller identities may never collide with this key; the policy stage
/// rejects any request that claims it.
pub const GLOBAL_KEY: &str = "_global";
