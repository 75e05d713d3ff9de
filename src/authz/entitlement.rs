//! Entitlement lifecycle.
//!
//! Entitlements are the durable, revocable grants the policy input carries.
//! They live in Postgres; the status machine only moves forward (a REVOKED or
//! EXPIRED entitlement never returns to ACTIVE), and revocation forces
//! re-authorization by killing every session of the grant's subject.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::Instrument;
use tracing::info_span;
use utoipa::ToSchema;
use uuid::Uuid;

use super::audit::{
    ACTION_ENTITLEMENT_GRANTED, ACTION_ENTITLEMENT_REVOKED, AuditDecision, AuditEvent, AuditLog,
};
use super::policy::EntitlementInput;
use super::store::SessionStore;

#[derive(ToSchema, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubjectType {
    User,
    Service,
    ThirdParty,
}

impl SubjectType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Service => "SERVICE",
            Self::ThirdParty => "THIRD_PARTY",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "SERVICE" => Self::Service,
            "THIRD_PARTY" => Self::ThirdParty,
            _ => Self::User,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitlementStatus {
    Active,
    Revoked,
    Expired,
    Suspended,
}

impl EntitlementStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Revoked => "REVOKED",
            Self::Expired => "EXPIRED",
            Self::Suspended => "SUSPENDED",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "ACTIVE" => Self::Active,
            "EXPIRED" => Self::Expired,
            "SUSPENDED" => Self::Suspended,
            _ => Self::Revoked,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Clone, Debug)]
pub struct Entitlement {
    pub id: Uuid,
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub scopes: Vec<String>,
    pub status: EntitlementStatus,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub granted_by: String,
    pub grant_reason: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Inputs for a new grant.
#[derive(Clone, Debug)]
pub struct NewEntitlement {
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub scopes: Vec<String>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub granted_by: String,
    pub grant_reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RevokeOutcome {
    /// The grant was revoked; carries the subject and how many of their
    /// sessions were terminated.
    Revoked {
        subject_id: String,
        sessions_revoked: u64,
    },
    /// No entitlement with that id.
    NotFound,
    /// The grant was already REVOKED or EXPIRED; nothing changed.
    AlreadyInactive,
}

/// The slice of the entitlement surface the pipeline needs: the compact
/// projection fed into policy input.
#[async_trait::async_trait]
pub trait EntitlementDirectory: Send + Sync {
    /// Projection of the subject's currently active entitlements.
    async fn policy_projection(&self, subject_id: &str) -> Result<Vec<EntitlementInput>>;
}

/// Directory returning a fixed projection; for tests and local runs.
#[derive(Clone, Debug, Default)]
pub struct StaticEntitlements {
    projection: Vec<EntitlementInput>,
}

impl StaticEntitlements {
    #[must_use]
    pub fn new(projection: Vec<EntitlementInput>) -> Self {
        Self { projection }
    }
}

#[async_trait::async_trait]
impl EntitlementDirectory for StaticEntitlements {
    async fn policy_projection(&self, _subject_id: &str) -> Result<Vec<EntitlementInput>> {
        Ok(self.projection.clone())
    }
}

/// Grants, revokes, and projects entitlements for policy input.
#[derive(Clone)]
pub struct EntitlementService {
    pool: PgPool,
    sessions: Arc<dyn SessionStore>,
    audit: AuditLog,
}

impl EntitlementService {
    #[must_use]
    pub fn new(pool: PgPool, sessions: Arc<dyn SessionStore>, audit: AuditLog) -> Self {
        Self {
            pool,
            sessions,
            audit,
        }
    }

    /// Record a new ACTIVE grant.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub async fn grant(&self, new: NewEntitlement) -> Result<Entitlement> {
        let query = r"
            INSERT INTO entitlements
                (subject_type, subject_id, resource_type, resource_id, scopes,
                 status, valid_from, valid_until, granted_by, grant_reason)
            VALUES ($1, $2, $3, $4, $5, 'ACTIVE', $6, $7, $8, $9)
            RETURNING id, created_at, updated_at
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(new.subject_type.as_str())
            .bind(&new.subject_id)
            .bind(&new.resource_type)
            .bind(&new.resource_id)
            .bind(&new.scopes)
            .bind(new.valid_from)
            .bind(new.valid_until)
            .bind(&new.granted_by)
            .bind(&new.grant_reason)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert entitlement")?;

        let entitlement = Entitlement {
            id: row.get("id"),
            subject_type: new.subject_type,
            subject_id: new.subject_id,
            resource_type: new.resource_type,
            resource_id: new.resource_id,
            scopes: new.scopes,
            status: EntitlementStatus::Active,
            valid_from: new.valid_from,
            valid_until: new.valid_until,
            granted_by: new.granted_by,
            grant_reason: new.grant_reason,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            revoked_at: None,
        };

        let mut event = AuditEvent::new(
            entitlement.subject_id.clone(),
            ACTION_ENTITLEMENT_GRANTED,
            AuditDecision::Granted,
        );
        event.resource = Some(format!(
            "{}:{}",
            entitlement.resource_type, entitlement.resource_id
        ));
        event.entitlements = vec![entitlement.id.to_string()];
        self.audit.append(event);

        Ok(entitlement)
    }

    /// Revoke a grant and force re-authorization for its subject.
    ///
    /// The subject's sessions are swept before the status flips: if anything
    /// fails partway, a retry repeats the sweep (idempotent) instead of
    /// finding an already-revoked grant and skipping it. After this returns,
    /// no request can ride a cached allow for a session that outlived the
    /// grant.
    ///
    /// # Errors
    /// Returns an error when the database or the session store fails.
    pub async fn revoke(&self, id: Uuid) -> Result<RevokeOutcome> {
        let query = "SELECT subject_id, status FROM entitlements WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to load entitlement for revoke")?;

        let Some(row) = row else {
            return Ok(RevokeOutcome::NotFound);
        };
        let status: String = row.get("status");
        if !matches!(status.as_str(), "ACTIVE" | "SUSPENDED") {
            return Ok(RevokeOutcome::AlreadyInactive);
        }

        let subject_id: String = row.get("subject_id");
        let sessions_revoked = self
            .sessions
            .revoke_all_for_subject(&subject_id)
            .await
            .context("failed to revoke subject sessions")?;

        // Forward-only transition; a concurrent revoke winning the race is
        // fine, the sweep above already happened.
        let query = r"
            UPDATE entitlements
            SET status = 'REVOKED',
                revoked_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status IN ('ACTIVE', 'SUSPENDED')
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke entitlement")?;

        let mut event = AuditEvent::new(
            subject_id.clone(),
            ACTION_ENTITLEMENT_REVOKED,
            AuditDecision::Revoked,
        );
        event.entitlements = vec![id.to_string()];
        event.reason = Some(format!("sessions_revoked={sessions_revoked}"));
        self.audit.append(event);

        Ok(RevokeOutcome::Revoked {
            subject_id,
            sessions_revoked,
        })
    }

    /// Entitlements that are ACTIVE and inside their validity window now.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub async fn get_active_for_subject(&self, subject_id: &str) -> Result<Vec<Entitlement>> {
        let query = r"
            SELECT id, subject_type, subject_id, resource_type, resource_id, scopes,
                   status, valid_from, valid_until, granted_by, grant_reason,
                   created_at, updated_at, revoked_at
            FROM entitlements
            WHERE subject_id = $1
              AND status = 'ACTIVE'
              AND valid_from <= NOW()
              AND (valid_until IS NULL OR valid_until > NOW())
            ORDER BY created_at ASC
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(subject_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to list active entitlements")?;

        Ok(rows.into_iter().map(|row| row_to_entitlement(&row)).collect())
    }

}

#[async_trait::async_trait]
impl EntitlementDirectory for EntitlementService {
    async fn policy_projection(&self, subject_id: &str) -> Result<Vec<EntitlementInput>> {
        let active = self.get_active_for_subject(subject_id).await?;
        Ok(active
            .into_iter()
            .map(|entitlement| EntitlementInput {
                resource_type: entitlement.resource_type,
                resource_id: entitlement.resource_id,
                scopes: entitlement.scopes,
            })
            .collect())
    }
}

fn row_to_entitlement(row: &sqlx::postgres::PgRow) -> Entitlement {
    let subject_type: String = row.get("subject_type");
    let status: String = row.get("status");
    Entitlement {
        id: row.get("id"),
        subject_type: SubjectType::parse(&subject_type),
        subject_id: row.get("subject_id"),
        resource_type: row.get("resource_type"),
        resource_id: row.get("resource_id"),
        scopes: row.get("scopes"),
        status: EntitlementStatus::parse(&status),
        valid_from: row.get("valid_from"),
        valid_until: row.get("valid_until"),
        granted_by: row.get("granted_by"),
        grant_reason: row.get("grant_reason"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        revoked_at: row.get("revoked_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_type_round_trips() {
        for kind in [SubjectType::User, SubjectType::Service, SubjectType::ThirdParty] {
            assert_eq!(SubjectType::parse(kind.as_str()), kind);
        }
    }

    #[test]
    fn status_round_trips() {
        for status in [
            EntitlementStatus::Active,
            EntitlementStatus::Revoked,
            EntitlementStatus::Expired,
            EntitlementStatus::Suspended,
        ] {
            assert_eq!(EntitlementStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn status_serializes_screaming() {
        let json = serde_json::to_string(&EntitlementStatus::Suspended).expect("serialize");
        assert_eq!(json, "\"SUSPENDED\"");
        let json = serde_json::to_string(&SubjectType::ThirdParty).expect("serialize");
        assert_eq!(json, "\"THIRD_PARTY\"");
    }

    #[test]
    fn revoke_outcome_distinguishes_cases() {
        let revoked = RevokeOutcome::Revoked {
            subject_id: "u2".to_string(),
            sessions_revoked: 2,
        };
        assert_ne!(revoked, RevokeOutcome::NotFound);
        assert_ne!(RevokeOutcome::NotFound, RevokeOutcome::AlreadyInactive);
    }
}
