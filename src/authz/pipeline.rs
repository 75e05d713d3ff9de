//! The admission pipeline.
//!
//! An explicit ordered sequence of steps, each implementing one capability:
//! `apply(facts, context) -> Continue | Halt(denial)`. Order is the trust
//! contract — a step runs only when every earlier step passed, and the
//! session is always re-fetched (step 0) before any cached decision is
//! consulted (step 5), which is what keeps the short-lived decision cache
//! safe against revocation. The handler behind the pipeline sees either a
//! fully populated [`AccessContext`] or nothing: denials are written as
//! responses before the handler runs.
//!
//! Phase 1 (cheap, deterministic): require_session, enforce_device_binding.
//! Phase 2 (context-aware): continuous_access_evaluation, risk_throttle,
//! build_policy_input, authorize, and the final audit append.

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use super::audit::{ACTION_REQUEST, AuditDecision, AuditEvent, AuditLog};
use super::credential::{CredentialError, CredentialSigner};
use super::entitlement::EntitlementDirectory;
use super::policy::{Decision, PolicyEngine, PolicyInput, PolicyInputBuilder};
use super::rate_limit::{RateLimitDecision, RateLimiter};
use super::replay::ReplayGuard;
use super::risk::{RiskProfile, RiskService};
use super::session::{RiskLevel, Session, SessionLookup};
use super::signals::RequestFacts;
use super::store::SessionStore;

/// A short-circuited request: status, response body, and what the audit
/// record should say about it.
#[derive(Clone, Debug)]
pub struct Denial {
    status: StatusCode,
    body: Value,
    reason: Option<String>,
    /// Set when the halting step already wrote its own audit record.
    audited: bool,
}

impl Denial {
    #[must_use]
    pub fn unauthorized(message: &str, reason: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: json!({ "error": message }),
            reason: Some(reason.to_string()),
            audited: false,
        }
    }

    #[must_use]
    pub fn forbidden(reason: Option<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            body: json!({ "error": "Forbidden" }),
            reason,
            audited: false,
        }
    }

    /// The 403 written when this request's evaluation terminated the session.
    #[must_use]
    pub fn session_terminated() -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            body: json!({ "message": "Session terminated" }),
            reason: Some("critical_risk".to_string()),
            audited: true,
        }
    }

    #[must_use]
    pub fn bad_request(message: &str, reason: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "error": message }),
            reason: Some(reason.to_string()),
            audited: false,
        }
    }

    #[must_use]
    pub fn throttled() -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: json!({ "error": "Too many requests, try again later" }),
            reason: Some("rate_limit".to_string()),
            audited: false,
        }
    }

    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: json!({ "error": "Service unavailable" }),
            reason: Some("dependency_outage".to_string()),
            audited: false,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

impl IntoResponse for Denial {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// What one step returns.
pub enum StepOutcome {
    Continue,
    Halt(Denial),
}

/// Mutable state threaded through the steps of one request.
#[derive(Default)]
pub struct PipelineContext {
    pub session: Option<Session>,
    pub risk: Option<RiskProfile>,
    pub policy_input: Option<PolicyInput>,
    pub decision: Option<Decision>,
}

/// One ordered capability in the chain.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> &'static str;
    async fn apply(&self, facts: &RequestFacts, cx: &mut PipelineContext) -> StepOutcome;
}

/// The populated context a handler receives once every step passed.
#[derive(Clone, Debug)]
pub struct AccessContext {
    pub session: Session,
    pub risk: RiskProfile,
    pub policy_input: PolicyInput,
    pub decision: Decision,
}

struct RequireSession {
    signer: CredentialSigner,
    sessions: Arc<dyn SessionStore>,
}

#[async_trait]
impl PipelineStep for RequireSession {
    fn name(&self) -> &'static str {
        "require_session"
    }

    async fn apply(&self, facts: &RequestFacts, cx: &mut PipelineContext) -> StepOutcome {
        let Some(token) = facts.access_token.as_deref() else {
            return StepOutcome::Halt(Denial::unauthorized(
                "Missing credentials",
                "missing_credential",
            ));
        };

        let session_id = match self.signer.verify(token, Utc::now()) {
            Ok(session_id) => session_id,
            Err(CredentialError::Expired) => {
                return StepOutcome::Halt(Denial::unauthorized(
                    "Credential expired",
                    "credential_expired",
                ));
            }
            Err(CredentialError::Malformed | CredentialError::BadSignature) => {
                return StepOutcome::Halt(Denial::unauthorized(
                    "Invalid credentials",
                    "invalid_credential",
                ));
            }
        };

        match self.sessions.get(session_id).await {
            Ok(SessionLookup::Live(session)) => {
                cx.session = Some(session);
                StepOutcome::Continue
            }
            Ok(SessionLookup::Revoked) => StepOutcome::Halt(Denial::unauthorized(
                "Invalid session",
                "session_revoked",
            )),
            Ok(SessionLookup::Absent) => StepOutcome::Halt(Denial::unauthorized(
                "Invalid session",
                "session_absent",
            )),
            Err(err) => {
                debug!("session lookup failed: {err}");
                StepOutcome::Halt(Denial::unavailable())
            }
        }
    }
}

struct EnforceDeviceBinding;

#[async_trait]
impl PipelineStep for EnforceDeviceBinding {
    fn name(&self) -> &'static str {
        "enforce_device_binding"
    }

    async fn apply(&self, facts: &RequestFacts, cx: &mut PipelineContext) -> StepOutcome {
        let Some(session) = cx.session.as_ref() else {
            return StepOutcome::Halt(Denial::unavailable());
        };
        let Some(bound) = session.device_id.as_deref() else {
            // Session was opened without a device binding; nothing to enforce.
            return StepOutcome::Continue;
        };
        match facts.device_id.as_deref() {
            Some(device) if device == bound => StepOutcome::Continue,
            _ => StepOutcome::Halt(Denial::unauthorized("Device mismatch", "device_mismatch")),
        }
    }
}

struct ContinuousEvaluation {
    risk: RiskService,
}

#[async_trait]
impl PipelineStep for ContinuousEvaluation {
    fn name(&self) -> &'static str {
        "continuous_access_evaluation"
    }

    async fn apply(&self, facts: &RequestFacts, cx: &mut PipelineContext) -> StepOutcome {
        let Some(session) = cx.session.as_ref() else {
            return StepOutcome::Halt(Denial::unavailable());
        };
        match self.risk.evaluate_and_enforce(session, facts).await {
            Ok(outcome) if outcome.terminated => {
                cx.risk = Some(outcome.profile);
                StepOutcome::Halt(Denial::session_terminated())
            }
            Ok(outcome) => {
                cx.risk = Some(outcome.profile);
                StepOutcome::Continue
            }
            Err(err) => {
                debug!("risk enforcement failed: {err}");
                StepOutcome::Halt(Denial::unavailable())
            }
        }
    }
}

struct RiskThrottle {
    limiter: Arc<dyn RateLimiter>,
}

#[async_trait]
impl PipelineStep for RiskThrottle {
    fn name(&self) -> &'static str {
        "risk_throttle"
    }

    async fn apply(&self, _facts: &RequestFacts, cx: &mut PipelineContext) -> StepOutcome {
        let (Some(session), Some(risk)) = (cx.session.as_ref(), cx.risk.as_ref()) else {
            return StepOutcome::Halt(Denial::unavailable());
        };
        match self.limiter.register(session.id, risk.level).await {
            Ok(RateLimitDecision::Allowed) => StepOutcome::Continue,
            Ok(RateLimitDecision::Limited) => StepOutcome::Halt(Denial::throttled()),
            Err(err) => {
                // Fail closed: an unreachable counter throttles.
                debug!("rate counter failed: {err}");
                StepOutcome::Halt(Denial::throttled())
            }
        }
    }
}

struct BuildPolicyInput {
    builder: PolicyInputBuilder,
    entitlements: Arc<dyn EntitlementDirectory>,
}

#[async_trait]
impl PipelineStep for BuildPolicyInput {
    fn name(&self) -> &'static str {
        "build_policy_input"
    }

    async fn apply(&self, facts: &RequestFacts, cx: &mut PipelineContext) -> StepOutcome {
        let (Some(session), Some(risk)) = (cx.session.as_ref(), cx.risk.as_ref()) else {
            return StepOutcome::Halt(Denial::unavailable());
        };
        let projection = match self.entitlements.policy_projection(&session.subject_id).await {
            Ok(projection) => projection,
            Err(err) => {
                debug!("entitlement projection failed: {err}");
                return StepOutcome::Halt(Denial::unavailable());
            }
        };
        cx.policy_input = Some(self.builder.build(
            session,
            risk,
            &facts.path,
            &facts.method,
            projection,
        ));
        StepOutcome::Continue
    }
}

struct Authorize {
    policy: Arc<dyn PolicyEngine>,
}

#[async_trait]
impl PipelineStep for Authorize {
    fn name(&self) -> &'static str {
        "authorize"
    }

    async fn apply(&self, _facts: &RequestFacts, cx: &mut PipelineContext) -> StepOutcome {
        let Some(input) = cx.policy_input.as_ref() else {
            return StepOutcome::Halt(Denial::unavailable());
        };
        let decision = self.policy.decide(input).await;
        let allow = decision.allow;
        let reason = decision.reason.clone();
        cx.decision = Some(decision);
        if allow {
            StepOutcome::Continue
        } else {
            StepOutcome::Halt(Denial::forbidden(reason.or_else(|| Some("policy_deny".to_string()))))
        }
    }
}

/// The ordered chain plus the audit tail.
pub struct Pipeline {
    steps: Vec<Box<dyn PipelineStep>>,
    replay: Option<ReplayGuard>,
    audit: AuditLog,
}

impl Pipeline {
    /// The canonical step order. This is the only constructor so the
    /// session-refetch-before-cache ordering cannot be assembled wrong.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn standard(
        signer: CredentialSigner,
        sessions: Arc<dyn SessionStore>,
        risk: RiskService,
        limiter: Arc<dyn RateLimiter>,
        builder: PolicyInputBuilder,
        entitlements: Arc<dyn EntitlementDirectory>,
        policy: Arc<dyn PolicyEngine>,
        replay: Option<ReplayGuard>,
        audit: AuditLog,
    ) -> Self {
        let steps: Vec<Box<dyn PipelineStep>> = vec![
            Box::new(RequireSession { signer, sessions }),
            Box::new(EnforceDeviceBinding),
            Box::new(ContinuousEvaluation { risk }),
            Box::new(RiskThrottle { limiter }),
            Box::new(BuildPolicyInput {
                builder,
                entitlements,
            }),
            Box::new(Authorize { policy }),
        ];
        Self {
            steps,
            replay,
            audit,
        }
    }

    /// Run every step in order; the first halt wins.
    ///
    /// A cancelled request unwinds before the tail, so no ALLOW record is
    /// ever written for a response that was not sent.
    ///
    /// # Errors
    /// Returns the denial the halting step produced.
    pub async fn run(&self, facts: &RequestFacts) -> Result<AccessContext, Denial> {
        let mut cx = PipelineContext::default();

        // A presented nonce is consumed before anything else; a replay is
        // rejected even when the rest of the request would pass.
        if let (Some(guard), Some(nonce)) = (self.replay.as_ref(), facts.nonce.as_deref()) {
            match guard.register(nonce).await {
                Ok(crate::authz::replay::ReplayOutcome::Fresh) => {}
                Ok(crate::authz::replay::ReplayOutcome::Seen) => {
                    let denial = Denial::bad_request("Replay detected", "replay");
                    self.audit_denied(facts, &cx, &denial);
                    return Err(denial);
                }
                Err(err) => {
                    debug!("replay guard failed: {err}");
                    let denial = Denial::unavailable();
                    self.audit_denied(facts, &cx, &denial);
                    return Err(denial);
                }
            }
        }

        for step in &self.steps {
            debug!(step = step.name(), "pipeline step");
            if let StepOutcome::Halt(denial) = step.apply(facts, &mut cx).await {
                if !denial.audited {
                    self.audit_denied(facts, &cx, &denial);
                }
                return Err(denial);
            }
        }

        let (Some(session), Some(risk), Some(policy_input), Some(decision)) =
            (cx.session, cx.risk, cx.policy_input, cx.decision)
        else {
            // A step chain that passes must have populated everything.
            return Err(Denial::unavailable());
        };

        self.audit_allowed(facts, &session, &risk, &policy_input, &decision);

        Ok(AccessContext {
            session,
            risk,
            policy_input,
            decision,
        })
    }

    fn audit_allowed(
        &self,
        facts: &RequestFacts,
        session: &Session,
        risk: &RiskProfile,
        policy_input: &PolicyInput,
        decision: &Decision,
    ) {
        let mut event = AuditEvent::new(
            session.subject_id.clone(),
            ACTION_REQUEST,
            AuditDecision::Allow,
        );
        event.session_id = Some(session.id);
        event.resource = Some(facts.path.clone());
        event.mechanism = Some("PBAC".to_string());
        event.risk_level = risk.level;
        event.mfa_verified = session.mfa_verified;
        event.ip = facts.ip.clone();
        event.user_agent = facts.user_agent.clone();
        event.entitlements = policy_input
            .entitlements
            .iter()
            .flatten()
            .map(|entry| format!("{}:{}", entry.resource_type, entry.resource_id))
            .collect();
        if let Some(explain) = &decision.explain {
            event.policy_package = Some(explain.package.clone());
            event.policy_rule = Some(explain.rule.clone());
        }
        self.audit.append(event);
    }

    fn audit_denied(&self, facts: &RequestFacts, cx: &PipelineContext, denial: &Denial) {
        let subject = cx
            .session
            .as_ref()
            .map_or_else(|| "anonymous".to_string(), |s| s.subject_id.clone());
        let mut event = AuditEvent::new(subject, ACTION_REQUEST, AuditDecision::Deny);
        event.session_id = cx.session.as_ref().map(|s| s.id);
        event.resource = Some(facts.path.clone());
        event.mechanism = Some("PBAC".to_string());
        event.risk_level = cx
            .risk
            .as_ref()
            .map(|risk| risk.level)
            .or_else(|| cx.session.as_ref().map(|s| s.risk_level))
            .unwrap_or(RiskLevel::Low);
        event.mfa_verified = cx.session.as_ref().is_some_and(|s| s.mfa_verified);
        event.ip = facts.ip.clone();
        event.user_agent = facts.user_agent.clone();
        event.reason = denial.reason.clone();
        if let Some(Decision {
            explain: Some(explain),
            ..
        }) = cx.decision.as_ref()
        {
            event.policy_package = Some(explain.package.clone());
            event.policy_rule = Some(explain.rule.clone());
        }
        self.audit.append(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::audit::{AuditWorkerConfig, LogAuditSink};
    use crate::authz::entitlement::StaticEntitlements;
    use crate::authz::policy::StaticPolicyEngine;
    use crate::authz::rate_limit::{InMemoryRateLimiter, NoopRateLimiter, RateLimitConfig};
    use crate::authz::risk::RiskEngine;
    use crate::authz::store::InMemorySessionStore;
    use chrono::Duration;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    struct CountingPolicyEngine {
        calls: AtomicU32,
        decision: Decision,
    }

    #[async_trait]
    impl PolicyEngine for CountingPolicyEngine {
        async fn decide(&self, _input: &PolicyInput) -> Decision {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.decision.clone()
        }
    }

    struct Fixture {
        store: Arc<InMemorySessionStore>,
        signer: CredentialSigner,
        pipeline: Pipeline,
    }

    fn audit() -> AuditLog {
        AuditLog::start(None, Arc::new(LogAuditSink), AuditWorkerConfig::new())
    }

    fn fixture_with(policy: Arc<dyn PolicyEngine>, limiter: Arc<dyn RateLimiter>) -> Fixture {
        let store = Arc::new(InMemorySessionStore::new());
        let signer = CredentialSigner::new(KEY.to_vec());
        let audit = audit();
        let risk = RiskService::new(RiskEngine::new(), store.clone(), audit.clone());
        let pipeline = Pipeline::standard(
            signer.clone(),
            store.clone(),
            risk,
            limiter,
            PolicyInputBuilder::default(),
            Arc::new(StaticEntitlements::default()),
            policy,
            None,
            audit,
        );
        Fixture {
            store,
            signer,
            pipeline,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(StaticPolicyEngine::allowing()), Arc::new(NoopRateLimiter))
    }

    fn seed_session(store: &InMemorySessionStore) -> Session {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            subject_id: "u1".to_string(),
            tenant_id: "t1".to_string(),
            device_id: Some("d1".to_string()),
            created_at: now,
            expires_at: now + Duration::hours(8),
            revoked_at: None,
            risk_level: RiskLevel::Low,
            mfa_verified: true,
            last_evaluated_at: now,
            last_seen_ip: Some("10.0.0.1".to_string()),
            last_user_agent: Some("curl/8".to_string()),
            last_geo: Some("ES".to_string()),
        };
        store.insert(session.clone());
        session
    }

    fn facts_for(fixture: &Fixture, session: &Session) -> RequestFacts {
        let token = fixture
            .signer
            .sign(session.id, Utc::now() + Duration::minutes(15));
        RequestFacts {
            method: "GET".to_string(),
            path: "/api/x".to_string(),
            access_token: Some(token),
            device_id: session.device_id.clone(),
            ip: session.last_seen_ip.clone(),
            user_agent: session.last_user_agent.clone(),
            geo: session.last_geo.clone(),
            automation: None,
            nonce: None,
        }
    }

    #[tokio::test]
    async fn happy_path_populates_access_context() {
        let fixture = fixture();
        let session = seed_session(&fixture.store);
        let facts = facts_for(&fixture, &session);

        let access = fixture.pipeline.run(&facts).await.expect("allowed");
        assert_eq!(access.session.id, session.id);
        assert_eq!(access.risk.level, RiskLevel::Low);
        assert!(access.decision.allow);
        assert_eq!(access.policy_input.subject.id, "u1");
    }

    #[tokio::test]
    async fn missing_credential_is_unauthorized() {
        let fixture = fixture();
        let facts = RequestFacts {
            method: "GET".to_string(),
            path: "/api/x".to_string(),
            ..RequestFacts::default()
        };
        let denial = fixture.pipeline.run(&facts).await.expect_err("denied");
        assert_eq!(denial.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(denial.reason(), Some("missing_credential"));
    }

    #[tokio::test]
    async fn unknown_session_is_unauthorized() {
        let fixture = fixture();
        let token = fixture
            .signer
            .sign(Uuid::new_v4(), Utc::now() + Duration::minutes(15));
        let facts = RequestFacts {
            method: "GET".to_string(),
            path: "/api/x".to_string(),
            access_token: Some(token),
            ..RequestFacts::default()
        };
        let denial = fixture.pipeline.run(&facts).await.expect_err("denied");
        assert_eq!(denial.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(denial.reason(), Some("session_absent"));
    }

    #[tokio::test]
    async fn device_mismatch_halts_before_policy() {
        let policy = Arc::new(CountingPolicyEngine {
            calls: AtomicU32::new(0),
            decision: Decision::allow(),
        });
        let fixture = fixture_with(policy.clone(), Arc::new(NoopRateLimiter));
        let session = seed_session(&fixture.store);
        let mut facts = facts_for(&fixture, &session);
        facts.device_id = Some("d2".to_string());

        let denial = fixture.pipeline.run(&facts).await.expect_err("denied");
        assert_eq!(denial.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(denial.reason(), Some("device_mismatch"));
        // Ordering guarantee: nothing downstream of the halt ran.
        assert_eq!(policy.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn critical_risk_terminates_session() {
        let fixture = fixture();
        let session = seed_session(&fixture.store);
        let mut facts = facts_for(&fixture, &session);
        // Device header passes binding (the session binds d1) but the rest of
        // the context screams: new ip, new geo, automation.
        facts.ip = Some("203.0.113.9".to_string());
        facts.geo = Some("NZ".to_string());
        facts.automation = Some("1".to_string());
        facts.user_agent = Some("python-requests/2".to_string());

        // ip(3) + ua(2) + automation(4) + travel(7) = 16 => 80, CRITICAL.
        let denial = fixture.pipeline.run(&facts).await.expect_err("denied");
        assert_eq!(denial.status(), StatusCode::FORBIDDEN);
        assert!(matches!(
            fixture.store.get(session.id).await.expect("lookup"),
            SessionLookup::Absent
        ));
    }

    #[tokio::test]
    async fn throttle_returns_429_after_cap() {
        let limiter = Arc::new(InMemoryRateLimiter::new(
            RateLimitConfig::new().with_caps(2, 2, 1),
        ));
        let fixture = fixture_with(Arc::new(StaticPolicyEngine::allowing()), limiter);
        let session = seed_session(&fixture.store);
        let facts = facts_for(&fixture, &session);

        for _ in 0..2 {
            fixture.pipeline.run(&facts).await.expect("allowed");
        }
        let denial = fixture.pipeline.run(&facts).await.expect_err("throttled");
        assert_eq!(denial.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denial.reason(), Some("rate_limit"));
    }

    #[tokio::test]
    async fn policy_deny_is_forbidden_and_session_survives() {
        let fixture = fixture_with(
            Arc::new(StaticPolicyEngine::denying()),
            Arc::new(NoopRateLimiter),
        );
        let session = seed_session(&fixture.store);
        let facts = facts_for(&fixture, &session);

        let denial = fixture.pipeline.run(&facts).await.expect_err("denied");
        assert_eq!(denial.status(), StatusCode::FORBIDDEN);
        assert!(matches!(
            fixture.store.get(session.id).await.expect("lookup"),
            SessionLookup::Live(_)
        ));
    }

    #[tokio::test]
    async fn revoked_session_cannot_pass() {
        let fixture = fixture();
        let session = seed_session(&fixture.store);
        fixture.store.revoke(session.id).await.expect("revoke");
        let facts = facts_for(&fixture, &session);

        let denial = fixture.pipeline.run(&facts).await.expect_err("denied");
        assert_eq!(denial.status(), StatusCode::UNAUTHORIZED);
    }
}
