use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgPool};
use std::sync::Arc;
use tracing::{Instrument, error, info_span};
use utoipa::ToSchema;

use crate::authz::AuthzState;
use crate::authz::policy::PolicyEngine;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    name: String,
    version: String,
    database: String,
    session_store: String,
    policy_backend: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Database, session store, and policy backend are healthy", body = Health),
        (status = 503, description = "A dependency is unhealthy", body = Health)
    ),
    tag = "health"
)]
pub async fn health(
    pool: Extension<PgPool>,
    redis: Extension<ConnectionManager>,
    state: Extension<Arc<AuthzState>>,
) -> impl IntoResponse {
    let acquire_span = info_span!(
        "db.acquire",
        db.system = "postgresql",
        db.operation = "ACQUIRE"
    );
    let database_ok = match pool.0.acquire().instrument(acquire_span).await {
        Ok(mut conn) => {
            let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
            match conn.ping().instrument(ping_span).await {
                Ok(()) => true,
                Err(err) => {
                    error!("Failed to ping database: {err}");
                    false
                }
            }
        }
        Err(err) => {
            error!("Failed to acquire database connection: {err}");
            false
        }
    };

    let mut conn = redis.0.clone();
    let ping_span = info_span!("kv.ping", kv.system = "redis");
    let store_ok = match redis::cmd("PING")
        .query_async::<String>(&mut conn)
        .instrument(ping_span)
        .await
    {
        Ok(_) => true,
        Err(err) => {
            error!("Failed to ping session store: {err}");
            false
        }
    };

    // Probes the remote engine; embedded modules report without I/O.
    let policy_status = state.0.policy().status().await;

    let health = Health {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: if database_ok { "ok" } else { "error" }.to_string(),
        session_store: if store_ok { "ok" } else { "error" }.to_string(),
        policy_backend: policy_status.as_str().to_string(),
    };

    let status = if database_ok && store_ok && policy_status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(health))
}
