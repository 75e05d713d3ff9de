//! Policy decisions.
//!
//! `PolicyEngine` is the capability the pipeline consults; which backend sits
//! behind it — the remote HTTP engine, the embedded bytecode module, or a
//! fixture — is invisible to callers. `CachedPolicyEngine` composes over any
//! backend with a short-TTL decision cache in the shared store. The short TTL
//! bounds staleness below the risk-update cadence; revocations kill the
//! sessions whose cached allows would otherwise matter.

pub mod input;
mod remote;
mod wasm;

pub use input::{EntitlementInput, PolicyInput, PolicyInputBuilder};
pub use remote::RemotePolicyEngine;
pub use wasm::WasmPolicyEngine;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::Instrument;
use tracing::{info_span, warn};

/// Reason attached to fail-closed denials when the engine is unreachable.
pub const REASON_POLICY_UNAVAILABLE: &str = "policy_unavailable";

/// Where a deny or allow came from, when the engine explains itself.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Explanation {
    pub package: String,
    pub rule: String,
}

/// Outcome of a policy evaluation. Engines fail closed: unreachable backends
/// produce `allow = false` with [`REASON_POLICY_UNAVAILABLE`] instead of an
/// error the pipeline would have to interpret.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub allow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<Explanation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Decision {
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allow: true,
            explain: None,
            reason: None,
        }
    }

    #[must_use]
    pub fn deny() -> Self {
        Self {
            allow: false,
            explain: None,
            reason: None,
        }
    }

    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            allow: false,
            explain: None,
            reason: Some(REASON_POLICY_UNAVAILABLE.to_string()),
        }
    }

    /// Whether the decision is an authoritative engine answer (cacheable)
    /// rather than a fail-closed fallback.
    #[must_use]
    pub fn is_definitive(&self) -> bool {
        self.reason
            .as_deref()
            .is_none_or(|reason| reason != REASON_POLICY_UNAVAILABLE)
    }
}

/// Reachability of the configured policy backend, reported by `/health`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendStatus {
    /// Remote engine answered its health probe.
    Ok,
    /// Remote engine unreachable or unhealthy; decisions fail closed.
    Error,
    /// Embedded module, loaded at startup; no external dependency.
    Embedded,
}

impl BackendStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Embedded => "embedded",
        }
    }

    #[must_use]
    pub const fn is_healthy(self) -> bool {
        !matches!(self, Self::Error)
    }
}

/// The decision capability the pipeline depends on.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn decide(&self, input: &PolicyInput) -> Decision;

    /// Backend dependency status for health reporting. In-process engines
    /// have nothing to probe.
    async fn status(&self) -> BackendStatus {
        BackendStatus::Embedded
    }
}

/// Fixture engine returning a preset decision; for tests and local runs.
#[derive(Clone, Debug)]
pub struct StaticPolicyEngine {
    decision: Decision,
}

impl StaticPolicyEngine {
    #[must_use]
    pub fn new(decision: Decision) -> Self {
        Self { decision }
    }

    #[must_use]
    pub fn allowing() -> Self {
        Self::new(Decision::allow())
    }

    #[must_use]
    pub fn denying() -> Self {
        Self::new(Decision::deny())
    }
}

#[async_trait]
impl PolicyEngine for StaticPolicyEngine {
    async fn decide(&self, _input: &PolicyInput) -> Decision {
        self.decision.clone()
    }
}

fn cache_key(fingerprint: &str) -> String {
    format!("opa:{fingerprint}")
}

/// Shared-store decision cache wrapped around any [`PolicyEngine`].
///
/// Cache faults degrade to the inner engine; they never flip a decision.
/// Fail-closed fallbacks are not cached, so a recovering backend is retried
/// on the next request.
pub struct CachedPolicyEngine {
    inner: std::sync::Arc<dyn PolicyEngine>,
    conn: ConnectionManager,
    ttl: Duration,
}

impl CachedPolicyEngine {
    #[must_use]
    pub fn new(inner: std::sync::Arc<dyn PolicyEngine>, conn: ConnectionManager, ttl: Duration) -> Self {
        Self { inner, conn, ttl }
    }
}

#[async_trait]
impl PolicyEngine for CachedPolicyEngine {
    async fn status(&self) -> BackendStatus {
        self.inner.status().await
    }

    async fn decide(&self, input: &PolicyInput) -> Decision {
        let key = cache_key(&input.fingerprint());
        let mut conn = self.conn.clone();

        let span = info_span!("kv.decision_cache_get", kv.system = "redis", kv.key = %key);
        let cached: Option<String> = match async { conn.get(&key).await }.instrument(span).await {
            Ok(value) => value,
            Err(err) => {
                warn!("decision cache read failed: {err}");
                None
            }
        };
        if let Some(json) = cached
            && let Ok(decision) = serde_json::from_str::<Decision>(&json)
        {
            return decision;
        }

        let decision = self.inner.decide(input).await;

        if decision.is_definitive()
            && let Ok(json) = serde_json::to_string(&decision)
        {
            let span = info_span!("kv.decision_cache_set", kv.system = "redis", kv.key = %key);
            let outcome: redis::RedisResult<()> = async {
                conn.set_ex(&key, json, self.ttl.as_secs().max(1)).await
            }
            .instrument(span)
            .await;
            if let Err(err) = outcome {
                warn!("decision cache write failed: {err}");
            }
        }

        decision
    }
}
