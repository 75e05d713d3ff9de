//! Remote HTTP policy backend.
//!
//! Speaks the engine's data API: `POST {base}/v1/data/authz/adaptive` with
//! `{"input": ...}`, expecting `{"result": {"allow": bool, ...}}`. Timeouts,
//! transport errors, non-2xx statuses, and unparseable bodies all collapse to
//! a fail-closed deny; nothing raises past this boundary.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::Instrument;
use tracing::{info_span, warn};
use url::Url;

use super::input::PolicyInput;
use super::{BackendStatus, Decision, Explanation, PolicyEngine};

const DECISION_PATH: &str = "/v1/data/authz/adaptive";
const HEALTH_PATH: &str = "/health";

#[derive(Deserialize, Debug)]
struct DecisionEnvelope {
    result: Option<DecisionResult>,
}

#[derive(Deserialize, Debug)]
struct DecisionResult {
    #[serde(default)]
    allow: bool,
    package: Option<String>,
    rule: Option<String>,
}

/// [`PolicyEngine`] backed by a remote evaluation endpoint.
pub struct RemotePolicyEngine {
    client: Client,
    decide_url: String,
    health_url: String,
}

impl RemotePolicyEngine {
    /// Build the engine with its dedicated client and request timeout.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid or the client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url).context("Invalid policy engine URL")?;
        let base = base.as_str().trim_end_matches('/').to_string();
        let client = Client::builder()
            .use_rustls_tls()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Failed to build policy engine HTTP client")?;
        Ok(Self {
            client,
            decide_url: format!("{base}{DECISION_PATH}"),
            health_url: format!("{base}{HEALTH_PATH}"),
        })
    }
}

#[async_trait]
impl PolicyEngine for RemotePolicyEngine {
    async fn status(&self) -> BackendStatus {
        let span = info_span!(
            "policy.health",
            http.method = "GET",
            url = %self.health_url
        );
        let outcome = async { self.client.get(&self.health_url).send().await }
            .instrument(span)
            .await;
        match outcome {
            Ok(response) if response.status().is_success() => BackendStatus::Ok,
            Ok(response) => {
                warn!("policy engine health probe returned {}", response.status());
                BackendStatus::Error
            }
            Err(err) => {
                warn!("policy engine health probe failed: {err}");
                BackendStatus::Error
            }
        }
    }

    async fn decide(&self, input: &PolicyInput) -> Decision {
        let span = info_span!(
            "policy.decide",
            http.method = "POST",
            url = %self.decide_url
        );
        let outcome = async {
            let response = self
                .client
                .post(&self.decide_url)
                .json(&json!({ "input": input }))
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                anyhow::bail!("policy engine returned {status}");
            }
            let envelope: DecisionEnvelope = response.json().await?;
            anyhow::Ok(envelope)
        }
        .instrument(span)
        .await;

        match outcome {
            Ok(DecisionEnvelope {
                result: Some(result),
            }) => Decision {
                allow: result.allow,
                explain: match (result.package, result.rule) {
                    (Some(package), Some(rule)) => Some(Explanation { package, rule }),
                    _ => None,
                },
                reason: None,
            },
            Ok(DecisionEnvelope { result: None }) => {
                // An empty result means the rule is undefined for this input.
                Decision::deny()
            }
            Err(err) => {
                warn!("policy engine unavailable, denying: {err}");
                Decision::unavailable()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decide_url_joins_base_and_path() -> Result<()> {
        let engine = RemotePolicyEngine::new("https://opa.internal:8181/", Duration::from_secs(5))?;
        assert_eq!(
            engine.decide_url,
            "https://opa.internal:8181/v1/data/authz/adaptive"
        );
        assert_eq!(engine.health_url, "https://opa.internal:8181/health");
        Ok(())
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(RemotePolicyEngine::new("not a url", Duration::from_secs(5)).is_err());
    }

    #[test]
    fn envelope_parses_allow_and_explanation() -> Result<()> {
        let envelope: DecisionEnvelope = serde_json::from_str(
            r#"{"result":{"allow":true,"package":"authz.adaptive","rule":"allow"}}"#,
        )?;
        let result = envelope.result.context("missing result")?;
        assert!(result.allow);
        assert_eq!(result.package.as_deref(), Some("authz.adaptive"));
        Ok(())
    }

    #[test]
    fn envelope_defaults_allow_to_false() -> Result<()> {
        let envelope: DecisionEnvelope = serde_json::from_str(r#"{"result":{}}"#)?;
        let result = envelope.result.context("missing result")?;
        assert!(!result.allow);
        Ok(())
    }
}
