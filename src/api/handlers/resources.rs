//! Example protected resource route.
//!
//! Sits behind the full pipeline: by the time the handler runs, the request
//! extension carries the populated access context, and the audit record for
//! the decision has already been appended.

use axum::Json;
use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::authz::pipeline::AccessContext;
use crate::authz::session::RiskLevel;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ResourceView {
    pub resource_id: String,
    pub subject_id: String,
    pub tenant_id: String,
    pub session_id: Uuid,
    pub risk_level: RiskLevel,
}

#[utoipa::path(
    get,
    path = "/v1/resources/{resource_id}",
    params(("resource_id" = String, Path, description = "Resource to read")),
    responses(
        (status = 200, description = "Resource visible to the authorized subject", body = ResourceView),
        (status = 401, description = "Missing or invalid session / device mismatch"),
        (status = 403, description = "Policy deny or terminated session"),
        (status = 429, description = "Throttled")
    ),
    tag = "resources"
)]
pub async fn get_resource(
    Extension(access): Extension<AccessContext>,
    Path(resource_id): Path<String>,
) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ResourceView {
            resource_id,
            subject_id: access.session.subject_id,
            tenant_id: access.session.tenant_id,
            session_id: access.session.id,
            risk_level: access.risk.level,
        }),
    )
}
