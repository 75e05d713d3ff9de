//! End-to-end pipeline scenarios through the HTTP router.
//!
//! The router is the real one (middleware + protected route); the session
//! store, rate limiter, entitlement directory, policy engine, and audit sink
//! are in-process doubles so the scenarios run hermetically.

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header::COOKIE};
use axum::routing::get;
use chrono::{Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use gardi::api::handlers::{authorize_request, resources};
use gardi::authz::audit::{
    AuditDecision, AuditLog, AuditRecord, AuditSink, AuditWorkerConfig, GENESIS, verify_chain,
};
use gardi::authz::credential::CredentialSigner;
use gardi::authz::entitlement::StaticEntitlements;
use gardi::authz::pipeline::Pipeline;
use gardi::authz::policy::{PolicyInputBuilder, StaticPolicyEngine};
use gardi::authz::rate_limit::{InMemoryRateLimiter, RateLimitConfig};
use gardi::authz::risk::{RiskEngine, RiskService};
use gardi::authz::session::{NewSession, Session, SessionLookup};
use gardi::authz::store::{InMemorySessionStore, SessionStore};

const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

#[derive(Default)]
struct CapturingSink {
    records: tokio::sync::Mutex<Vec<AuditRecord>>,
}

#[async_trait]
impl AuditSink for CapturingSink {
    async fn persist(&self, record: &AuditRecord) -> Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

struct Harness {
    store: Arc<InMemorySessionStore>,
    limiter: Arc<InMemoryRateLimiter>,
    signer: CredentialSigner,
    sink: Arc<CapturingSink>,
    app: Router,
}

impl Harness {
    fn new(policy_allows: bool) -> Self {
        let store = Arc::new(InMemorySessionStore::new());
        let limiter = Arc::new(InMemoryRateLimiter::new(
            RateLimitConfig::new().with_caps(5, 3, 1),
        ));
        let signer = CredentialSigner::new(KEY.to_vec());
        let sink = Arc::new(CapturingSink::default());
        let audit = AuditLog::start(None, sink.clone(), AuditWorkerConfig::new());

        let policy = if policy_allows {
            StaticPolicyEngine::allowing()
        } else {
            StaticPolicyEngine::denying()
        };
        let risk = RiskService::new(RiskEngine::new(), store.clone(), audit.clone());
        let pipeline = Arc::new(Pipeline::standard(
            signer.clone(),
            store.clone(),
            risk,
            limiter.clone(),
            PolicyInputBuilder::default(),
            Arc::new(StaticEntitlements::default()),
            Arc::new(policy),
            None,
            audit,
        ));

        let app = Router::new()
            .route("/v1/resources/{resource_id}", get(resources::get_resource))
            .route_layer(axum::middleware::from_fn(authorize_request))
            .layer(axum::Extension(pipeline));

        Self {
            store,
            limiter,
            signer,
            sink,
            app,
        }
    }

    async fn open_session(&self, subject: &str, device: &str) -> Result<(Session, String)> {
        let session = self
            .store
            .create(NewSession {
                subject_id: subject.to_string(),
                tenant_id: "t1".to_string(),
                device_id: Some(device.to_string()),
                mfa_verified: true,
                ip: Some("10.0.0.1".to_string()),
                user_agent: Some("curl/8".to_string()),
                geo: Some("ES".to_string()),
            })
            .await?;
        let token = self
            .signer
            .sign(session.id, Utc::now() + Duration::minutes(15));
        Ok((session, token))
    }

    fn request(&self, token: &str, device: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri("/v1/resources/x")
            .header(COOKIE, format!("accessToken={token}"))
            .header("x-device-id", device)
            .header("x-forwarded-for", "10.0.0.1")
            .header("user-agent", "curl/8")
            .header("x-geo", "ES")
            .body(Body::empty())
            .expect("request")
    }

    async fn send(&self, request: Request<Body>) -> Result<(StatusCode, Value)> {
        let response = self.app.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((status, body))
    }

    async fn wait_for_records(&self, at_least: usize) -> Vec<AuditRecord> {
        for _ in 0..100 {
            {
                let records = self.sink.records.lock().await;
                if records.len() >= at_least {
                    return records.clone();
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        self.sink.records.lock().await.clone()
    }
}

#[tokio::test]
async fn happy_path_allows_and_audits() -> Result<()> {
    let harness = Harness::new(true);
    let (session, token) = harness.open_session("u1", "d1").await?;

    let (status, body) = harness.send(harness.request(&token, "d1")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subject_id"], "u1");
    assert_eq!(body["session_id"], session.id.to_string());
    assert_eq!(body["risk_level"], "LOW");

    let records = harness.wait_for_records(1).await;
    let allow = records
        .iter()
        .find(|record| record.decision == AuditDecision::Allow)
        .context("missing ALLOW record")?;
    assert_eq!(allow.mechanism.as_deref(), Some("PBAC"));
    assert_eq!(allow.subject_id, "u1");
    assert!(verify_chain(&records, GENESIS).intact);
    Ok(())
}

#[tokio::test]
async fn device_mismatch_is_rejected_before_policy() -> Result<()> {
    let harness = Harness::new(true);
    let (_session, token) = harness.open_session("u1", "d1").await?;

    let (status, body) = harness.send(harness.request(&token, "d2")).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Device mismatch");

    let records = harness.wait_for_records(1).await;
    let deny = records
        .iter()
        .find(|record| record.decision == AuditDecision::Deny)
        .context("missing DENY record")?;
    assert_eq!(deny.reason.as_deref(), Some("device_mismatch"));
    Ok(())
}

#[tokio::test]
async fn policy_deny_is_forbidden_but_session_survives() -> Result<()> {
    let harness = Harness::new(false);
    let (session, token) = harness.open_session("u1", "d1").await?;

    let (status, body) = harness.send(harness.request(&token, "d1")).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Forbidden");

    assert!(matches!(
        harness.store.get(session.id).await?,
        SessionLookup::Live(_)
    ));
    Ok(())
}

#[tokio::test]
async fn critical_risk_terminates_the_session() -> Result<()> {
    let harness = Harness::new(true);
    let (session, token) = harness.open_session("u1", "d1").await?;

    // Same device, but everything else changed: new ip (3), new user agent
    // (2), automation (4), impossible travel (7) = 16 severity => score 80.
    let request = Request::builder()
        .method("GET")
        .uri("/v1/resources/x")
        .header(COOKIE, format!("accessToken={token}"))
        .header("x-device-id", "d1")
        .header("x-forwarded-for", "203.0.113.9")
        .header("user-agent", "python-requests/2")
        .header("x-automation", "1")
        .header("x-geo", "NZ")
        .body(Body::empty())?;

    let (status, body) = harness.send(request).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Session terminated");

    assert!(matches!(
        harness.store.get(session.id).await?,
        SessionLookup::Absent
    ));

    // The next request with the same cookie is unauthorized.
    let (status, _body) = harness.send(harness.request(&token, "d1")).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let records = harness.wait_for_records(1).await;
    assert!(
        records
            .iter()
            .any(|record| record.action == "SESSION_TERMINATED_HIGH_RISK")
    );
    Ok(())
}

#[tokio::test]
async fn throttle_kicks_in_after_cap_and_resets_with_window() -> Result<()> {
    let harness = Harness::new(true);
    let (_session, token) = harness.open_session("u1", "d1").await?;

    // LOW cap in this harness is 5.
    for _ in 0..5 {
        let (status, _) = harness.send(harness.request(&token, "d1")).await?;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = harness.send(harness.request(&token, "d1")).await?;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "Too many requests, try again later");

    // Window expiry clears the counter and traffic resumes.
    harness.limiter.reset();
    let (status, _) = harness.send(harness.request(&token, "d1")).await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn subject_sweep_forces_reauthentication() -> Result<()> {
    let harness = Harness::new(true);
    let (first, first_token) = harness.open_session("u2", "d1").await?;
    let (second, second_token) = harness.open_session("u2", "d1").await?;

    // Both sessions are usable.
    let (status, _) = harness.send(harness.request(&first_token, "d1")).await?;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = harness.send(harness.request(&second_token, "d1")).await?;
    assert_eq!(status, StatusCode::OK);

    // Entitlement revocation sweeps every session of the subject.
    assert_eq!(harness.store.revoke_all_for_subject("u2").await?, 2);
    assert!(matches!(
        harness.store.get(first.id).await?,
        SessionLookup::Absent
    ));
    assert!(matches!(
        harness.store.get(second.id).await?,
        SessionLookup::Absent
    ));

    let (status, _) = harness.send(harness.request(&first_token, "d1")).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = harness.send(harness.request(&second_token, "d1")).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn missing_cookie_is_unauthorized() -> Result<()> {
    let harness = Harness::new(true);
    let request = Request::builder()
        .method("GET")
        .uri("/v1/resources/x")
        .header("x-device-id", "d1")
        .body(Body::empty())?;
    let (status, body) = harness.send(request).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Missing credentials");
    Ok(())
}

#[tokio::test]
async fn forged_cookie_is_unauthorized() -> Result<()> {
    let harness = Harness::new(true);
    let forged = CredentialSigner::new(b"another-key-entirely-another-key".to_vec())
        .sign(Uuid::new_v4(), Utc::now() + Duration::minutes(15));
    let (status, _body) = harness.send(harness.request(&forged, "d1")).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}
