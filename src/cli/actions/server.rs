use crate::api::{self, PolicyBackendChoice, ServeOptions};
use crate::authz::AuthzConfig;
use crate::authz::audit::AuditWorkerConfig;
use crate::authz::rate_limit::RateLimitConfig;
use crate::authz::risk::RiskEngine;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub redis_url: String,
    pub policy_url: Option<String>,
    pub policy_wasm: Option<PathBuf>,
    pub credential_key_hex: String,
    pub session_ttl_seconds: u64,
    pub decision_cache_ttl_seconds: u64,
    pub replay_ttl_seconds: u64,
    pub rate_limit_low: u32,
    pub rate_limit_medium: u32,
    pub rate_limit_high: u32,
    pub risk_multiplier: u32,
    pub audit_queue_capacity: usize,
    pub audit_max_attempts: u32,
    pub tenant_plan: String,
}

impl std::fmt::Debug for Args {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Args")
            .field("port", &self.port)
            .field("redis_url", &self.redis_url)
            .field("policy_url", &self.policy_url)
            .field("policy_wasm", &self.policy_wasm)
            .field("credential_key_hex", &"***")
            .finish_non_exhaustive()
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if configuration is invalid or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let credential_key = hex::decode(args.credential_key_hex.trim())
        .context("credential key must be hex-encoded")?;
    anyhow::ensure!(
        credential_key.len() >= 32,
        "credential key must be at least 32 bytes"
    );

    let policy = match (args.policy_url, args.policy_wasm) {
        (Some(url), _) => PolicyBackendChoice::Remote(url),
        (None, Some(path)) => PolicyBackendChoice::Embedded(path),
        (None, None) => anyhow::bail!("a policy backend is required"),
    };

    let authz = AuthzConfig::new()
        .with_session_ttl(Duration::from_secs(args.session_ttl_seconds))
        .with_decision_cache_ttl(Duration::from_secs(args.decision_cache_ttl_seconds))
        .with_replay_ttl(Duration::from_secs(args.replay_ttl_seconds))
        .with_rate_limits(RateLimitConfig::new().with_caps(
            args.rate_limit_low,
            args.rate_limit_medium,
            args.rate_limit_high,
        ))
        .with_risk_engine(RiskEngine::new().with_severity_multiplier(args.risk_multiplier))
        .with_tenant_plan(args.tenant_plan, false);

    let audit = AuditWorkerConfig::new()
        .with_queue_capacity(args.audit_queue_capacity)
        .with_max_attempts(args.audit_max_attempts);

    api::serve(ServeOptions {
        port: args.port,
        pg_dsn: args.dsn,
        redis_url: args.redis_url,
        policy,
        credential_key,
        authz,
        audit,
    })
    .await
}
