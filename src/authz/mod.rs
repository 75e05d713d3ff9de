//! The authorization core: session store, risk evaluation, throttling,
//! policy decisions, audit, and entitlements, chained by the pipeline.

pub mod audit;
pub mod canonical;
pub mod credential;
pub mod entitlement;
pub mod pipeline;
pub mod policy;
pub mod rate_limit;
pub mod replay;
pub mod risk;
pub mod session;
pub mod signals;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use credential::CredentialSigner;
use entitlement::EntitlementService;
use policy::PolicyEngine;
use rate_limit::{RateLimitConfig, RateLimiter};
use replay::ReplayGuard;
use risk::RiskEngine;
use store::SessionStore;

const DEFAULT_SESSION_TTL_SECONDS: u64 = 8 * 60 * 60;
const DEFAULT_STORE_BUDGET_MS: u64 = 100;
const DEFAULT_POLICY_TIMEOUT_SECONDS: u64 = 5;
const DEFAULT_DECISION_CACHE_TTL_SECONDS: u64 = 5;
const DEFAULT_REPLAY_TTL_SECONDS: u64 = 300;

/// Tunables for the authorization core. Defaults match the documented
/// behavior; every knob has a builder-style override.
#[derive(Clone, Debug)]
pub struct AuthzConfig {
    session_ttl: Duration,
    store_budget: Duration,
    policy_timeout: Duration,
    decision_cache_ttl: Duration,
    replay_ttl: Duration,
    rate: RateLimitConfig,
    risk: RiskEngine,
    tenant_plan: String,
    tenant_throttled: bool,
}

impl AuthzConfig {
    /// Sessions last a fixed 8 h from creation; nothing slides the TTL.
    #[must_use]
    pub fn new() -> Self {
        Self {
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECONDS),
            store_budget: Duration::from_millis(DEFAULT_STORE_BUDGET_MS),
            policy_timeout: Duration::from_secs(DEFAULT_POLICY_TIMEOUT_SECONDS),
            decision_cache_ttl: Duration::from_secs(DEFAULT_DECISION_CACHE_TTL_SECONDS),
            replay_ttl: Duration::from_secs(DEFAULT_REPLAY_TTL_SECONDS),
            rate: RateLimitConfig::new(),
            risk: RiskEngine::new(),
            tenant_plan: "standard".to_string(),
            tenant_throttled: false,
        }
    }

    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_store_budget(mut self, budget: Duration) -> Self {
        self.store_budget = budget;
        self
    }

    #[must_use]
    pub fn with_policy_timeout(mut self, timeout: Duration) -> Self {
        self.policy_timeout = timeout;
        self
    }

    /// Cache TTL is clamped to 5 s: staleness must stay below the
    /// risk-update cadence.
    #[must_use]
    pub fn with_decision_cache_ttl(mut self, ttl: Duration) -> Self {
        self.decision_cache_ttl = ttl.min(Duration::from_secs(DEFAULT_DECISION_CACHE_TTL_SECONDS));
        self
    }

    #[must_use]
    pub fn with_replay_ttl(mut self, ttl: Duration) -> Self {
        self.replay_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_rate_limits(mut self, rate: RateLimitConfig) -> Self {
        self.rate = rate;
        self
    }

    #[must_use]
    pub fn with_risk_engine(mut self, risk: RiskEngine) -> Self {
        self.risk = risk;
        self
    }

    #[must_use]
    pub fn with_tenant_plan(mut self, plan: String, throttled: bool) -> Self {
        self.tenant_plan = plan;
        self.tenant_throttled = throttled;
        self
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    #[must_use]
    pub fn store_budget(&self) -> Duration {
        self.store_budget
    }

    #[must_use]
    pub fn policy_timeout(&self) -> Duration {
        self.policy_timeout
    }

    #[must_use]
    pub fn decision_cache_ttl(&self) -> Duration {
        self.decision_cache_ttl
    }

    #[must_use]
    pub fn replay_ttl(&self) -> Duration {
        self.replay_ttl
    }

    #[must_use]
    pub fn rate(&self) -> RateLimitConfig {
        self.rate
    }

    #[must_use]
    pub fn risk(&self) -> RiskEngine {
        self.risk
    }

    #[must_use]
    pub fn tenant_plan(&self) -> &str {
        &self.tenant_plan
    }

    #[must_use]
    pub fn tenant_throttled(&self) -> bool {
        self.tenant_throttled
    }
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles the HTTP surface threads through request extensions. Constructed
/// once at startup; no component behind it is a process-wide singleton.
pub struct AuthzState {
    config: AuthzConfig,
    signer: CredentialSigner,
    sessions: Arc<dyn SessionStore>,
    limiter: Arc<dyn RateLimiter>,
    policy: Arc<dyn PolicyEngine>,
    entitlements: Arc<EntitlementService>,
    audit: audit::AuditLog,
    replay: Option<ReplayGuard>,
}

impl AuthzState {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AuthzConfig,
        signer: CredentialSigner,
        sessions: Arc<dyn SessionStore>,
        limiter: Arc<dyn RateLimiter>,
        policy: Arc<dyn PolicyEngine>,
        entitlements: Arc<EntitlementService>,
        audit: audit::AuditLog,
        replay: Option<ReplayGuard>,
    ) -> Self {
        Self {
            config,
            signer,
            sessions,
            limiter,
            policy,
            entitlements,
            audit,
            replay,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthzConfig {
        &self.config
    }

    #[must_use]
    pub fn signer(&self) -> &CredentialSigner {
        &self.signer
    }

    #[must_use]
    pub fn sessions(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.sessions)
    }

    #[must_use]
    pub fn limiter(&self) -> Arc<dyn RateLimiter> {
        Arc::clone(&self.limiter)
    }

    #[must_use]
    pub fn policy(&self) -> Arc<dyn PolicyEngine> {
        Arc::clone(&self.policy)
    }

    #[must_use]
    pub fn entitlements(&self) -> Arc<EntitlementService> {
        Arc::clone(&self.entitlements)
    }

    #[must_use]
    pub fn audit(&self) -> audit::AuditLog {
        self.audit.clone()
    }

    #[must_use]
    pub fn replay(&self) -> Option<&ReplayGuard> {
        self.replay.as_ref()
    }

    /// Assemble the canonical pipeline over this state's handles.
    #[must_use]
    pub fn pipeline(&self) -> pipeline::Pipeline {
        let risk = risk::RiskService::new(self.config.risk(), self.sessions(), self.audit());
        let directory: Arc<dyn entitlement::EntitlementDirectory> = self.entitlements();
        pipeline::Pipeline::standard(
            self.signer.clone(),
            self.sessions(),
            risk,
            self.limiter(),
            policy::PolicyInputBuilder::new(
                self.config.tenant_plan().to_string(),
                self.config.tenant_throttled(),
            ),
            directory,
            self.policy(),
            self.replay.clone(),
            self.audit(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_documented_values() {
        let config = AuthzConfig::new();
        assert_eq!(config.session_ttl(), Duration::from_secs(8 * 60 * 60));
        assert_eq!(config.store_budget(), Duration::from_millis(100));
        assert_eq!(config.policy_timeout(), Duration::from_secs(5));
        assert_eq!(config.decision_cache_ttl(), Duration::from_secs(5));
        assert_eq!(config.replay_ttl(), Duration::from_secs(300));
        assert_eq!(config.tenant_plan(), "standard");
        assert!(!config.tenant_throttled());
    }

    #[test]
    fn decision_cache_ttl_is_capped() {
        let config = AuthzConfig::new().with_decision_cache_ttl(Duration::from_secs(60));
        assert_eq!(config.decision_cache_ttl(), Duration::from_secs(5));
    }

    #[test]
    fn overrides_apply() {
        let config = AuthzConfig::new()
            .with_session_ttl(Duration::from_secs(60))
            .with_tenant_plan("enterprise".to_string(), true);
        assert_eq!(config.session_ttl(), Duration::from_secs(60));
        assert_eq!(config.tenant_plan(), "enterprise");
        assert!(config.tenant_throttled());
    }
}
