//! Policy input assembly and fingerprinting.
//!
//! The input schema is part of the wire contract with the policy engine, and
//! its canonical serialization doubles as the decision-cache key, so the same
//! logical input must fingerprint identically on every host.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::authz::canonical::{canonical_json, canonical_sha256};
use crate::authz::risk::RiskProfile;
use crate::authz::session::{RiskLevel, Session};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TenantInput {
    pub id: String,
    pub plan: String,
    pub throttled: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SubjectInput {
    pub id: String,
    pub mfa_verified: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RiskInput {
    #[serde(rename = "riskLevel")]
    pub risk_level: RiskLevel,
}

/// Compact entitlement projection produced by the entitlement service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EntitlementInput {
    pub resource_type: String,
    pub resource_id: String,
    pub scopes: Vec<String>,
}

/// The fixed input schema sent to the policy engine.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PolicyInput {
    pub tenant: TenantInput,
    pub subject: SubjectInput,
    pub risk: RiskInput,
    pub resource: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitlements: Option<Vec<EntitlementInput>>,
}

impl PolicyInput {
    /// Canonical serialization: sorted keys, UTF-8, compact.
    #[must_use]
    pub fn canonical(&self) -> String {
        canonical_json(&self.as_value())
    }

    /// Stable fingerprint used as the decision-cache key.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        canonical_sha256(&self.as_value())
    }

    fn as_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Assembles [`PolicyInput`] values from the request context.
///
/// Tenant plan/throttle flags come from configuration; a directory service
/// can replace them without touching the schema.
#[derive(Clone, Debug)]
pub struct PolicyInputBuilder {
    tenant_plan: String,
    tenant_throttled: bool,
}

impl PolicyInputBuilder {
    #[must_use]
    pub fn new(tenant_plan: String, tenant_throttled: bool) -> Self {
        Self {
            tenant_plan,
            tenant_throttled,
        }
    }

    #[must_use]
    pub fn build(
        &self,
        session: &Session,
        risk: &RiskProfile,
        resource: &str,
        action: &str,
        entitlements: Vec<EntitlementInput>,
    ) -> PolicyInput {
        PolicyInput {
            tenant: TenantInput {
                id: session.tenant_id.clone(),
                plan: self.tenant_plan.clone(),
                throttled: self.tenant_throttled,
            },
            subject: SubjectInput {
                id: session.subject_id.clone(),
                mfa_verified: session.mfa_verified,
            },
            risk: RiskInput {
                risk_level: risk.level,
            },
            resource: resource.to_string(),
            action: action.to_string(),
            entitlements: if entitlements.is_empty() {
                None
            } else {
                Some(entitlements)
            },
        }
    }
}

impl Default for PolicyInputBuilder {
    fn default() -> Self {
        Self::new("standard".to_string(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn session() -> Session {
        let now = Utc::now();
        Session {
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
            last_seen_ip: None,
            last_user_agent: None,
            last_geo: None,
        }
    }

    fn profile(session: &Session, level: RiskLevel) -> RiskProfile {
        RiskProfile {
            session_id: session.id,
            subject_id: session.subject_id.clone(),
            score: 0,
            level,
            signals: Vec::new(),
            evaluated_at: Utc::now(),
        }
    }

    #[test]
    fn builder_fills_the_fixed_schema() {
        let session = session();
        let input = PolicyInputBuilder::default().build(
            &session,
            &profile(&session, RiskLevel::Medium),
            "/api/x",
            "GET",
            Vec::new(),
        );
        let value = serde_json::to_value(&input).expect("serialize");
        assert_eq!(value["tenant"]["id"], "t1");
        assert_eq!(value["tenant"]["plan"], "standard");
        assert_eq!(value["subject"]["mfa_verified"], true);
        assert_eq!(value["risk"]["riskLevel"], "MEDIUM");
        assert_eq!(value["resource"], "/api/x");
        assert_eq!(value["action"], "GET");
        assert!(value.get("entitlements").is_none());
    }

    #[test]
    fn entitlements_are_included_when_present() {
        let session = session();
        let input = PolicyInputBuilder::default().build(
            &session,
            &profile(&session, RiskLevel::Low),
            "doc:1",
            "read",
            vec![EntitlementInput {
                resource_type: "doc".to_string(),
                resource_id: "1".to_string(),
                scopes: vec!["read".to_string()],
            }],
        );
        let value = serde_json::to_value(&input).expect("serialize");
        assert_eq!(value["entitlements"][0]["resource_type"], "doc");
    }

    #[test]
    fn fingerprint_is_stable_for_identical_inputs() {
        let session = session();
        let builder = PolicyInputBuilder::default();
        let risk = profile(&session, RiskLevel::Low);
        let first = builder.build(&session, &risk, "/api/x", "GET", Vec::new());
        let second = builder.build(&session, &risk, "/api/x", "GET", Vec::new());
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_inputs() {
        let session = session();
        let builder = PolicyInputBuilder::default();
        let risk = profile(&session, RiskLevel::Low);
        let read = builder.build(&session, &risk, "/api/x", "GET", Vec::new());
        let write = builder.build(&session, &risk, "/api/x", "POST", Vec::new());
        assert_ne!(read.fingerprint(), write.fingerprint());
    }

    #[test]
    fn canonical_form_has_sorted_keys() {
        let session = session();
        let input = PolicyInputBuilder::default().build(
            &session,
            &profile(&session, RiskLevel::Low),
            "/api/x",
            "GET",
            Vec::new(),
        );
        let canonical = input.canonical();
        let action_at = canonical.find("\"action\"").expect("action key");
        let tenant_at = canonical.find("\"tenant\"").expect("tenant key");
        assert!(action_at < tenant_at);
        assert!(!canonical.contains(' '));
    }
}
