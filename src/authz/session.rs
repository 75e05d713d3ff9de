//! Session records and the tagged lookup state returned by the store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Risk classification assigned to a session.
///
/// Ordering follows escalation: `Low < Medium < High < Critical`.
#[derive(
    ToSchema, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative session record stored at `session:{id}`.
///
/// Created by the authentication collaborator on login. Only `risk_level`,
/// `last_evaluated_at`, and `revoked_at` (set once) mutate in place; revoke
/// or TTL expiry removes the record.
#[derive(ToSchema, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub subject_id: String,
    pub tenant_id: String,
    pub device_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub risk_level: RiskLevel,
    pub mfa_verified: bool,
    pub last_evaluated_at: DateTime<Utc>,
    /// Client address observed at creation, compared on every request.
    pub last_seen_ip: Option<String>,
    pub last_user_agent: Option<String>,
    pub last_geo: Option<String>,
}

impl Session {
    /// Whether the record represents a live session at `now`.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && now < self.expires_at
    }

    /// Remaining lifetime at `now`, zero when already expired.
    #[must_use]
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

/// Inputs the authentication collaborator supplies when opening a session.
#[derive(Clone, Debug)]
pub struct NewSession {
    pub subject_id: String,
    pub tenant_id: String,
    pub device_id: Option<String>,
    pub mfa_verified: bool,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub geo: Option<String>,
}

/// Result of a session lookup as a tagged state rather than an option.
///
/// `Revoked` surfaces when a reader races a revocation and still observes a
/// record carrying `revoked_at`; it is never treated as live.
#[derive(Clone, Debug)]
pub enum SessionLookup {
    Live(Session),
    Revoked,
    Absent,
}

impl SessionLookup {
    /// The live session, if any.
    #[must_use]
    pub fn into_live(self) -> Option<Session> {
        match self {
            Self::Live(session) => Some(session),
            Self::Revoked | Self::Absent => None,
        }
    }

    /// Classify a raw record read from the store at `now`.
    #[must_use]
    pub fn from_record(session: Session, now: DateTime<Utc>) -> Self {
        if session.revoked_at.is_some() {
            Self::Revoked
        } else if now >= session.expires_at {
            // The store TTL normally reaps expired keys; guard the window
            // between logical expiry and key eviction.
            Self::Absent
        } else {
            Self::Live(session)
        }
    }
}
