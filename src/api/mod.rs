use anyhow::{Context, Result};
use axum::Extension;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, MatchedPath};
use axum::http::{HeaderName, HeaderValue, Request};
use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;

use crate::authz::audit::{
    AuditLog, AuditWorkerConfig, PostgresAuditSink, load_chain_head,
};
use crate::authz::credential::CredentialSigner;
use crate::authz::entitlement::EntitlementService;
use crate::authz::policy::{
    CachedPolicyEngine, PolicyEngine, RemotePolicyEngine, WasmPolicyEngine,
};
use crate::authz::rate_limit::RedisRateLimiter;
use crate::authz::replay::ReplayGuard;
use crate::authz::store::RedisSessionStore;
use crate::authz::{AuthzConfig, AuthzState};

pub mod handlers;
mod openapi;

pub use openapi::openapi;

/// Which policy backend to evaluate against; invisible to the pipeline.
#[derive(Clone, Debug)]
pub enum PolicyBackendChoice {
    /// Remote HTTP engine at this base URL.
    Remote(String),
    /// Embedded module compiled from this bytecode artifact.
    Embedded(PathBuf),
}

/// Everything the server action resolved from CLI/env.
#[derive(Clone)]
pub struct ServeOptions {
    pub port: u16,
    pub pg_dsn: String,
    pub redis_url: String,
    pub policy: PolicyBackendChoice,
    pub credential_key: Vec<u8>,
    pub authz: AuthzConfig,
    pub audit: AuditWorkerConfig,
}

impl std::fmt::Debug for ServeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServeOptions")
            .field("port", &self.port)
            .field("policy", &self.policy)
            .field("credential_key", &"***")
            .field("authz", &self.authz)
            .field("audit", &self.audit)
            .finish_non_exhaustive()
    }
}

/// Start the server.
///
/// # Errors
/// Returns an error if a backing store cannot be reached at startup or the
/// listener cannot bind.
pub async fn serve(options: ServeOptions) -> Result<()> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&options.pg_dsn)
        .await
        .context("Failed to connect to database")?;

    let redis_client =
        redis::Client::open(options.redis_url.as_str()).context("Invalid Redis URL")?;
    let redis = ConnectionManager::new(redis_client)
        .await
        .context("Failed to connect to session store")?;

    // Continue this instance's audit chain from the newest persisted record.
    let chain_head = load_chain_head(&pool)
        .await
        .context("Failed to load audit chain head")?;
    let audit = AuditLog::start(
        chain_head,
        Arc::new(PostgresAuditSink::new(pool.clone())),
        options.audit,
    );

    let config = options.authz;
    let sessions = Arc::new(RedisSessionStore::new(
        redis.clone(),
        config.session_ttl(),
        config.store_budget(),
        audit.clone(),
    ));
    let limiter = Arc::new(RedisRateLimiter::new(
        redis.clone(),
        config.rate(),
        config.store_budget(),
    ));
    let replay = ReplayGuard::new(redis.clone(), config.replay_ttl(), config.store_budget());

    let backend: Arc<dyn PolicyEngine> = match &options.policy {
        PolicyBackendChoice::Remote(url) => {
            info!(url = %url, "using remote policy engine");
            Arc::new(RemotePolicyEngine::new(url, config.policy_timeout())?)
        }
        PolicyBackendChoice::Embedded(path) => {
            info!(artifact = %path.display(), "using embedded policy engine");
            Arc::new(WasmPolicyEngine::from_artifact(path)?)
        }
    };
    let policy = Arc::new(CachedPolicyEngine::new(
        backend,
        redis.clone(),
        config.decision_cache_ttl(),
    ));

    let entitlements = Arc::new(EntitlementService::new(
        pool.clone(),
        sessions.clone(),
        audit.clone(),
    ));

    let state = Arc::new(AuthzState::new(
        config,
        CredentialSigner::new(options.credential_key),
        sessions,
        limiter,
        policy,
        entitlements,
        audit,
        Some(replay),
    ));
    let pipeline = Arc::new(state.pipeline());

    let (public, _spec) = openapi::public_router().split_for_parts();
    let (protected, _spec) = openapi::protected_router().split_for_parts();
    let protected =
        protected.route_layer(axum::middleware::from_fn(handlers::authorize_request));

    let app = public
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &Request<Body>| {
                        HeaderValue::from_str(Ulid::new().to_string().as_str()).ok()
                    },
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(DefaultBodyLimit::max(handlers::MAX_BODY_BYTES))
                .layer(Extension(state))
                .layer(Extension(pipeline))
                .layer(Extension(pool))
                .layer(Extension(redis)),
        );

    let listener = TcpListener::bind(format!("::0:{}", options.port)).await?;

    info!("Listening on [::]:{}", options.port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("none")
            .to_string()
    };
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    // The device binding is part of the trust decision, so it is tagged on
    // every request span alongside the propagated request id.
    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = route,
        request_id = %header("x-request-id"),
        device_id = %header("x-device-id"),
    )
}
