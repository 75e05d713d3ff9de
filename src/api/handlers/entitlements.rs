//! Entitlement administration endpoints.

use axum::Json;
use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use utoipa::ToSchema;
use uuid::Uuid;

use super::ErrorResponse;
use crate::authz::AuthzState;
use crate::authz::entitlement::{Entitlement, NewEntitlement, RevokeOutcome, SubjectType};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct GrantEntitlementRequest {
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub scopes: Vec<String>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub granted_by: String,
    pub grant_reason: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RevokeEntitlementResponse {
    pub subject_id: String,
    /// Sessions terminated to force re-authorization.
    pub sessions_revoked: u64,
}

#[utoipa::path(
    post,
    path = "/v1/entitlements",
    request_body = GrantEntitlementRequest,
    responses(
        (status = 201, description = "Entitlement granted", body = Entitlement),
        (status = 500, description = "Grant failed", body = ErrorResponse)
    ),
    tag = "entitlements"
)]
pub async fn grant_entitlement(
    state: Extension<Arc<AuthzState>>,
    Json(request): Json<GrantEntitlementRequest>,
) -> impl IntoResponse {
    let new = NewEntitlement {
        subject_type: request.subject_type,
        subject_id: request.subject_id,
        resource_type: request.resource_type,
        resource_id: request.resource_id,
        scopes: request.scopes,
        valid_from: request.valid_from.unwrap_or_else(Utc::now),
        valid_until: request.valid_until,
        granted_by: request.granted_by,
        grant_reason: request.grant_reason,
    };

    match state.entitlements().grant(new).await {
        Ok(entitlement) => (StatusCode::CREATED, Json(entitlement)).into_response(),
        Err(err) => {
            error!("Failed to grant entitlement: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Failed to grant entitlement" })),
            )
                .into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/entitlements/{entitlement_id}/revoke",
    params(("entitlement_id" = Uuid, Path, description = "Entitlement to revoke")),
    responses(
        (status = 200, description = "Entitlement revoked; subject sessions terminated", body = RevokeEntitlementResponse),
        (status = 404, description = "No such entitlement", body = ErrorResponse),
        (status = 409, description = "Entitlement already inactive", body = ErrorResponse),
        (status = 500, description = "Revoke failed", body = ErrorResponse)
    ),
    tag = "entitlements"
)]
pub async fn revoke_entitlement(
    state: Extension<Arc<AuthzState>>,
    Path(entitlement_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.entitlements().revoke(entitlement_id).await {
        Ok(RevokeOutcome::Revoked {
            subject_id,
            sessions_revoked,
        }) => (
            StatusCode::OK,
            Json(RevokeEntitlementResponse {
                subject_id,
                sessions_revoked,
            }),
        )
            .into_response(),
        Ok(RevokeOutcome::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Entitlement not found" })),
        )
            .into_response(),
        Ok(RevokeOutcome::AlreadyInactive) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "Entitlement is not active" })),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to revoke entitlement: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Failed to revoke entitlement" })),
            )
                .into_response()
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/subjects/{subject_id}/entitlements",
    params(("subject_id" = String, Path, description = "Subject to list")),
    responses(
        (status = 200, description = "Active entitlements", body = [Entitlement]),
        (status = 500, description = "Listing failed", body = ErrorResponse)
    ),
    tag = "entitlements"
)]
pub async fn list_entitlements(
    state: Extension<Arc<AuthzState>>,
    Path(subject_id): Path<String>,
) -> impl IntoResponse {
    match state.entitlements().get_active_for_subject(&subject_id).await {
        Ok(entitlements) => (StatusCode::OK, Json(entitlements)).into_response(),
        Err(err) => {
            error!("Failed to list entitlements: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Failed to list entitlements" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_request_round_trips() {
        let json = r#"{
            "subject_type": "USER",
            "subject_id": "u2",
            "resource_type": "doc",
            "resource_id": "42",
            "scopes": ["read", "write"],
            "granted_by": "admin",
            "grant_reason": "project onboarding"
        }"#;
        let request: GrantEntitlementRequest = serde_json::from_str(json).expect("deserialize");
        assert_eq!(request.subject_type, SubjectType::User);
        assert_eq!(request.scopes.len(), 2);
        assert!(request.valid_from.is_none());
    }

    #[test]
    fn revoke_response_reports_session_count() {
        let response = RevokeEntitlementResponse {
            subject_id: "u2".to_string(),
            sessions_revoked: 2,
        };
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["sessions_revoked"], 2);
    }
}
