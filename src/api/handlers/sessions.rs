//! Collaborator-facing session endpoints.
//!
//! The authentication service calls these after it has authenticated a user:
//! create a session (returns the signed `accessToken` cookie), introspect the
//! session bound to a presented credential, and revoke a session.

use axum::Json;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, StatusCode, header::SET_COOKIE};
use axum::response::IntoResponse;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{ErrorResponse, extract_client_ip};
use crate::authz::AuthzState;
use crate::authz::credential::{ACCESS_TTL_SECONDS, access_cookie, extract_access_token};
use crate::authz::session::{NewSession, RiskLevel, SessionLookup};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CreateSessionRequest {
    pub subject_id: String,
    pub tenant_id: String,
    pub device_id: Option<String>,
    pub mfa_verified: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionCreatedResponse {
    pub session_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionView {
    pub session_id: Uuid,
    pub subject_id: String,
    pub tenant_id: String,
    pub risk_level: RiskLevel,
    pub mfa_verified: bool,
    pub expires_at: DateTime<Utc>,
}

#[utoipa::path(
    post,
    path = "/v1/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created; the signed credential is set as a cookie", body = SessionCreatedResponse),
        (status = 503, description = "Session store unavailable", body = ErrorResponse)
    ),
    tag = "sessions"
)]
pub async fn create_session(
    headers: HeaderMap,
    state: Extension<Arc<AuthzState>>,
    Json(request): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    let new = NewSession {
        subject_id: request.subject_id,
        tenant_id: request.tenant_id,
        device_id: request.device_id,
        mfa_verified: request.mfa_verified,
        ip: extract_client_ip(&headers),
        user_agent: headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        geo: headers
            .get("x-geo")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    };

    let session = match state.sessions().create(new).await {
        Ok(session) => session,
        Err(err) => {
            error!("Failed to create session: {err}");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "Session store unavailable" })),
            )
                .into_response();
        }
    };

    let credential_expiry = Utc::now() + Duration::seconds(ACCESS_TTL_SECONDS);
    let token = state.signer().sign(session.id, credential_expiry);

    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = access_cookie(&token) {
        response_headers.insert(SET_COOKIE, cookie);
    }

    (
        StatusCode::CREATED,
        response_headers,
        Json(SessionCreatedResponse {
            session_id: session.id,
            expires_at: session.expires_at,
        }),
    )
        .into_response()
}

#[utoipa::path(
    get,
    path = "/v1/session",
    responses(
        (status = 200, description = "Session is live", body = SessionView),
        (status = 204, description = "No live session for the presented credential")
    ),
    tag = "sessions"
)]
pub async fn introspect_session(
    headers: HeaderMap,
    state: Extension<Arc<AuthzState>>,
) -> impl IntoResponse {
    // Missing or invalid credentials read as "no session" so this endpoint
    // cannot be used to probe auth state.
    let Some(token) = extract_access_token(&headers) else {
        return StatusCode::NO_CONTENT.into_response();
    };
    let Ok(session_id) = state.signer().verify(&token, Utc::now()) else {
        return StatusCode::NO_CONTENT.into_response();
    };

    match state.sessions().get(session_id).await {
        Ok(SessionLookup::Live(session)) => (
            StatusCode::OK,
            Json(SessionView {
                session_id: session.id,
                subject_id: session.subject_id,
                tenant_id: session.tenant_id,
                risk_level: session.risk_level,
                mfa_verified: session.mfa_verified,
                expires_at: session.expires_at,
            }),
        )
            .into_response(),
        Ok(SessionLookup::Revoked | SessionLookup::Absent) => {
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            error!("Failed to lookup session: {err}");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/revoke",
    params(("session_id" = Uuid, Path, description = "Session to revoke")),
    responses(
        (status = 204, description = "Session revoked (or already gone)"),
        (status = 503, description = "Session store unavailable", body = ErrorResponse)
    ),
    tag = "sessions"
)]
pub async fn revoke_session(
    state: Extension<Arc<AuthzState>>,
    Path(session_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.sessions().revoke(session_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            error!("Failed to revoke session: {err}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "Session store unavailable" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_session_request_round_trips() {
        let json = r#"{"subject_id":"u1","tenant_id":"t1","device_id":"d1","mfa_verified":true}"#;
        let request: CreateSessionRequest = serde_json::from_str(json).expect("deserialize");
        assert_eq!(request.subject_id, "u1");
        assert_eq!(request.device_id.as_deref(), Some("d1"));
        assert!(request.mfa_verified);
    }

    #[test]
    fn session_view_serializes_risk_level() {
        let view = SessionView {
            session_id: Uuid::nil(),
            subject_id: "u1".to_string(),
            tenant_id: "t1".to_string(),
            risk_level: RiskLevel::High,
            mfa_verified: false,
            expires_at: Utc::now(),
        };
        let value = serde_json::to_value(&view).expect("serialize");
        assert_eq!(value["risk_level"], "HIGH");
    }
}
