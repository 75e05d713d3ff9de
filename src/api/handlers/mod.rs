//! Route handlers and the request-side glue around the pipeline.

pub mod entitlements;
pub mod health;
pub mod resources;
pub mod sessions;

use axum::extract::{Extension, Request};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::authz::credential::extract_access_token;
use crate::authz::pipeline::Pipeline;
use crate::authz::signals::RequestFacts;

/// Secure-route gate limits; anything past them is rejected before the
/// pipeline runs.
pub const MAX_BODY_BYTES: usize = 100 * 1024;
pub const MAX_QUERY_KEYS: usize = 50;
pub const MAX_PATH_SEGMENTS: usize = 20;

const DEVICE_ID_HEADER: &str = "x-device-id";
const GEO_HEADER: &str = "x-geo";
const AUTOMATION_HEADER: &str = "x-automation";
const NONCE_HEADER: &str = "x-request-nonce";

/// Error body shared by the documented endpoints.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

/// Extract a client IP from common proxy headers.
#[must_use]
pub fn extract_client_ip(headers: &axum::http::HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn header_value(headers: &axum::http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Everything the pipeline needs from the raw request.
#[must_use]
pub fn request_facts(request: &Request) -> RequestFacts {
    let headers = request.headers();
    RequestFacts {
        method: request.method().to_string(),
        path: request.uri().path().to_string(),
        access_token: extract_access_token(headers),
        device_id: header_value(headers, DEVICE_ID_HEADER),
        ip: extract_client_ip(headers),
        user_agent: header_value(headers, axum::http::header::USER_AGENT.as_str()),
        geo: header_value(headers, GEO_HEADER),
        automation: header_value(headers, AUTOMATION_HEADER),
        nonce: header_value(headers, NONCE_HEADER),
    }
}

/// Reject structurally abusive requests before any store is touched.
fn gate_request(request: &Request) -> Option<Response> {
    let query_keys = request
        .uri()
        .query()
        .map_or(0, |query| query.split('&').filter(|pair| !pair.is_empty()).count());
    if query_keys > MAX_QUERY_KEYS {
        return Some(
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Too many query parameters" })),
            )
                .into_response(),
        );
    }

    let segments = request
        .uri()
        .path()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .count();
    if segments > MAX_PATH_SEGMENTS {
        return Some(
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Path too deep" })),
            )
                .into_response(),
        );
    }

    None
}

/// Middleware wrapping protected routes in the admission pipeline.
///
/// On success the request carries a populated
/// [`crate::authz::pipeline::AccessContext`]; otherwise the denial has
/// already been written and the handler never runs.
pub async fn authorize_request(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(response) = gate_request(&request) {
        return response;
    }

    let facts = request_facts(&request);
    match pipeline.run(&facts).await {
        Ok(access) => {
            request.extensions_mut().insert(access);
            next.run(request).await
        }
        Err(denial) => denial.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::HeaderValue;

    #[test]
    fn extract_client_ip_prefers_forwarded() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 5.6.7.8"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("1.2.3.4".to_string()));
    }

    #[test]
    fn extract_client_ip_falls_back_to_real_ip() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("9.9.9.9".to_string()));
    }

    fn request(uri: &str) -> Request {
        axum::http::Request::builder()
            .method("GET")
            .uri(uri)
            .header("x-device-id", "d1")
            .header("x-geo", "ES")
            .header("user-agent", "curl/8")
            .header("cookie", "accessToken=tok")
            .body(Body::empty())
            .expect("request")
    }

    #[test]
    fn request_facts_reads_headers() {
        let facts = request_facts(&request("/api/x?a=1"));
        assert_eq!(facts.method, "GET");
        assert_eq!(facts.path, "/api/x");
        assert_eq!(facts.device_id.as_deref(), Some("d1"));
        assert_eq!(facts.geo.as_deref(), Some("ES"));
        assert_eq!(facts.user_agent.as_deref(), Some("curl/8"));
        assert_eq!(facts.access_token.as_deref(), Some("tok"));
        assert!(facts.automation.is_none());
    }

    #[test]
    fn gate_allows_reasonable_requests() {
        assert!(gate_request(&request("/api/x?a=1&b=2")).is_none());
    }

    #[test]
    fn gate_rejects_query_floods() {
        let query: Vec<String> = (0..60).map(|i| format!("k{i}=v")).collect();
        let uri = format!("/api/x?{}", query.join("&"));
        assert!(gate_request(&request(&uri)).is_some());
    }

    #[test]
    fn gate_rejects_deep_paths() {
        let path = format!("/{}", vec!["a"; 25].join("/"));
        assert!(gate_request(&request(&path)).is_some());
    }
}
