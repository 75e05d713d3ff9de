//! Authoritative session store.
//!
//! Sessions live in the shared Redis keyspace so every instance observes the
//! same state: `session:{id}` holds the JSON record with the session TTL, and
//! the set at `subject:sessions:{subject_id}` indexes live session ids per
//! subject with a 60 s safety margin over the session TTL. All mutations go
//! through Redis atomics; nothing is cached in-process beyond one request.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::Instrument;
use tracing::{info_span, warn};
use uuid::Uuid;

use super::audit::{
    ACTION_SESSION_REVOKED, ACTION_SESSIONS_REVOKED_SUBJECT, AuditDecision, AuditEvent, AuditLog,
};
use super::session::{NewSession, RiskLevel, Session, SessionLookup};

/// Extra lifetime on the subject index beyond the session TTL.
pub const SUBJECT_INDEX_MARGIN_SECONDS: i64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
    #[error("session store call exceeded its budget")]
    Timeout,
    #[error("session record corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Session persistence capability consumed by the pipeline, the risk service,
/// and the entitlement service.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Open a session with the configured TTL. Fails only when the backing
    /// store is unreachable.
    async fn create(&self, new: NewSession) -> Result<Session, StoreError>;

    /// Current state of a session id.
    async fn get(&self, id: Uuid) -> Result<SessionLookup, StoreError>;

    /// Update the risk fields in place, preserving the remaining TTL.
    /// No-op when the session no longer exists; never recreates it.
    async fn update_risk(
        &self,
        id: Uuid,
        level: RiskLevel,
        evaluated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Remove the session and its index entry. Idempotent.
    async fn revoke(&self, id: Uuid) -> Result<(), StoreError>;

    /// Remove every session of a subject in one batched step; returns the
    /// number of sessions removed. Idempotent.
    async fn revoke_all_for_subject(&self, subject_id: &str) -> Result<u64, StoreError>;
}

fn session_key(id: Uuid) -> String {
    format!("session:{id}")
}

fn subject_key(subject_id: &str) -> String {
    format!("subject:sessions:{subject_id}")
}

/// Redis-backed [`SessionStore`].
#[derive(Clone)]
pub struct RedisSessionStore {
    conn: ConnectionManager,
    session_ttl: Duration,
    io_budget: Duration,
    audit: AuditLog,
}

impl RedisSessionStore {
    #[must_use]
    pub fn new(
        conn: ConnectionManager,
        session_ttl: Duration,
        io_budget: Duration,
        audit: AuditLog,
    ) -> Self {
        Self {
            conn,
            session_ttl,
            io_budget,
            audit,
        }
    }

    async fn with_budget<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.io_budget, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(StoreError::Unavailable(err)),
            Err(_) => Err(StoreError::Timeout),
        }
    }

    fn ttl_seconds(&self) -> u64 {
        self.session_ttl.as_secs().max(1)
    }

    async fn read_record(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        let mut conn = self.conn.clone();
        let key = session_key(id);
        let span = info_span!("kv.get", kv.system = "redis", kv.key = %key);
        let raw: Option<String> = self
            .with_budget(async { conn.get(&key).await }.instrument(span))
            .await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create(&self, new: NewSession) -> Result<Session, StoreError> {
        let now = Utc::now();
        let ttl = self.ttl_seconds();
        let session = Session {
            id: Uuid::new_v4(),
            subject_id: new.subject_id,
            tenant_id: new.tenant_id,
            device_id: new.device_id,
            created_at: now,
            expires_at: now + ChronoDuration::seconds(i64::try_from(ttl).unwrap_or(i64::MAX)),
            revoked_at: None,
            risk_level: RiskLevel::Low,
            mfa_verified: new.mfa_verified,
            last_evaluated_at: now,
            last_seen_ip: new.ip,
            last_user_agent: new.user_agent,
            last_geo: new.geo,
        };

        let json = serde_json::to_string(&session)?;
        let mut conn = self.conn.clone();
        let key = session_key(session.id);
        let index = subject_key(&session.subject_id);
        let index_ttl = i64::try_from(ttl).unwrap_or(i64::MAX) + SUBJECT_INDEX_MARGIN_SECONDS;
        let session_id = session.id.to_string();
        let span = info_span!("kv.create_session", kv.system = "redis", kv.key = %key);
        self.with_budget(
            async {
                let () = conn.set_ex(&key, json, ttl).await?;
                let () = conn.sadd(&index, &session_id).await?;
                let () = conn.expire(&index, index_ttl).await?;
                Ok(())
            }
            .instrument(span),
        )
        .await?;

        Ok(session)
    }

    async fn get(&self, id: Uuid) -> Result<SessionLookup, StoreError> {
        Ok(match self.read_record(id).await? {
            Some(record) => SessionLookup::from_record(record, Utc::now()),
            None => SessionLookup::Absent,
        })
    }

    async fn update_risk(
        &self,
        id: Uuid,
        level: RiskLevel,
        evaluated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let Some(mut record) = self.read_record(id).await? else {
            return Ok(());
        };
        if record.revoked_at.is_some() {
            return Ok(());
        }
        record.risk_level = level;
        record.last_evaluated_at = evaluated_at;

        let json = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();
        let key = session_key(id);
        // SET XX KEEPTTL: only touch a key that still exists, keep its expiry.
        let span = info_span!("kv.update_risk", kv.system = "redis", kv.key = %key);
        let outcome: Option<String> = self
            .with_budget(
                async {
                    redis::cmd("SET")
                        .arg(&key)
                        .arg(json)
                        .arg("XX")
                        .arg("KEEPTTL")
                        .query_async(&mut conn)
                        .await
                }
                .instrument(span),
            )
            .await?;
        if outcome.is_none() {
            // Session vanished between read and write; never recreate it.
            warn!(session_id = %id, "risk update skipped, session gone");
        }
        Ok(())
    }

    async fn revoke(&self, id: Uuid) -> Result<(), StoreError> {
        let Some(record) = self.read_record(id).await? else {
            return Ok(());
        };

        let mut conn = self.conn.clone();
        let key = session_key(id);
        let index = subject_key(&record.subject_id);
        let session_id = id.to_string();
        let span = info_span!("kv.revoke_session", kv.system = "redis", kv.key = %key);
        self.with_budget(
            async {
                let () = conn.del(&key).await?;
                let () = conn.srem(&index, &session_id).await?;
                Ok(())
            }
            .instrument(span),
        )
        .await?;

        // Audit emission never fails the revoke.
        let mut event = AuditEvent::new(
            record.subject_id.clone(),
            ACTION_SESSION_REVOKED,
            AuditDecision::Revoked,
        );
        event.session_id = Some(id);
        event.risk_level = record.risk_level;
        event.mfa_verified = record.mfa_verified;
        self.audit.append(event);

        Ok(())
    }

    async fn revoke_all_for_subject(&self, subject_id: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let index = subject_key(subject_id);
        let span = info_span!("kv.revoke_subject", kv.system = "redis", kv.key = %index);
        let count = self
            .with_budget(
                async {
                    let ids: Vec<String> = conn.smembers(&index).await?;
                    if !ids.is_empty() {
                        let keys: Vec<String> = ids.iter().map(|id| format!("session:{id}")).collect();
                        // One batched DEL over the snapshot, then the index itself.
                        let () = conn.del(keys).await?;
                    }
                    let () = conn.del(&index).await?;
                    Ok(ids.len() as u64)
                }
                .instrument(span),
            )
            .await?;

        if count > 0 {
            let mut event = AuditEvent::new(
                subject_id,
                ACTION_SESSIONS_REVOKED_SUBJECT,
                AuditDecision::Revoked,
            );
            event.reason = Some(format!("count={count}"));
            self.audit.append(event);
        }

        Ok(count)
    }
}

/// In-process [`SessionStore`] for tests and local development.
///
/// Production deployments must share state through [`RedisSessionStore`];
/// this double only mirrors its observable semantics.
#[derive(Default)]
pub struct InMemorySessionStore {
    records: std::sync::Mutex<std::collections::HashMap<Uuid, Session>>,
    session_ttl: Option<Duration>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = Some(ttl);
        self
    }

    /// Seed a specific record, bypassing creation defaults.
    pub fn insert(&self, session: Session) {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(session.id, session);
    }

    /// Live session ids for a subject, the in-memory view of the subject index.
    #[must_use]
    pub fn subject_sessions(&self, subject_id: &str) -> Vec<Uuid> {
        let now = Utc::now();
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .filter(|session| session.subject_id == subject_id && session.is_live(now))
            .map(|session| session.id)
            .collect()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, new: NewSession) -> Result<Session, StoreError> {
        let now = Utc::now();
        let ttl = self
            .session_ttl
            .map_or(ChronoDuration::hours(8), |ttl| {
                ChronoDuration::seconds(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
            });
        let session = Session {
            id: Uuid::new_v4(),
            subject_id: new.subject_id,
            tenant_id: new.tenant_id,
            device_id: new.device_id,
            created_at: now,
            expires_at: now + ttl,
            revoked_at: None,
            risk_level: RiskLevel::Low,
            mfa_verified: new.mfa_verified,
            last_evaluated_at: now,
            last_seen_ip: new.ip,
            last_user_agent: new.user_agent,
            last_geo: new.geo,
        };
        self.insert(session.clone());
        Ok(session)
    }

    async fn get(&self, id: Uuid) -> Result<SessionLookup, StoreError> {
        let records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(records
            .get(&id)
            .cloned()
            .map_or(SessionLookup::Absent, |record| {
                SessionLookup::from_record(record, Utc::now())
            }))
    }

    async fn update_risk(
        &self,
        id: Uuid,
        level: RiskLevel,
        evaluated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(record) = records.get_mut(&id)
            && record.revoked_at.is_none()
        {
            record.risk_level = level;
            record.last_evaluated_at = evaluated_at;
        }
        Ok(())
    }

    async fn revoke(&self, id: Uuid) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&id);
        Ok(())
    }

    async fn revoke_all_for_subject(&self, subject_id: &str) -> Result<u64, StoreError> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, session| session.subject_id != subject_id);
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_stable() {
        let id = Uuid::nil();
        assert_eq!(
            session_key(id),
            "session:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(subject_key("u1"), "subject:sessions:u1");
    }

    #[test]
    fn store_error_messages() {
        let err = StoreError::Timeout;
        assert_eq!(err.to_string(), "session store call exceeded its budget");
    }

    fn new_session(subject: &str) -> NewSession {
        NewSession {
            subject_id: subject.to_string(),
            tenant_id: "t1".to_string(),
            device_id: Some("d1".to_string()),
            mfa_verified: true,
            ip: None,
            user_agent: None,
            geo: None,
        }
    }

    #[tokio::test]
    async fn in_memory_store_revokes_idempotently() -> Result<(), StoreError> {
        let store = InMemorySessionStore::new();
        let session = store.create(new_session("u1")).await?;
        store.revoke(session.id).await?;
        store.revoke(session.id).await?;
        assert!(matches!(store.get(session.id).await?, SessionLookup::Absent));
        Ok(())
    }

    #[tokio::test]
    async fn in_memory_store_revokes_all_for_subject() -> Result<(), StoreError> {
        let store = InMemorySessionStore::new();
        let first = store.create(new_session("u2")).await?;
        let second = store.create(new_session("u2")).await?;
        let other = store.create(new_session("u3")).await?;

        assert_eq!(store.revoke_all_for_subject("u2").await?, 2);
        assert!(matches!(store.get(first.id).await?, SessionLookup::Absent));
        assert!(matches!(store.get(second.id).await?, SessionLookup::Absent));
        assert!(matches!(store.get(other.id).await?, SessionLookup::Live(_)));
        // A second pass finds nothing left.
        assert_eq!(store.revoke_all_for_subject("u2").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn in_memory_update_risk_never_recreates() -> Result<(), StoreError> {
        let store = InMemorySessionStore::new();
        let gone = Uuid::new_v4();
        store
            .update_risk(gone, RiskLevel::High, Utc::now())
            .await?;
        assert!(matches!(store.get(gone).await?, SessionLookup::Absent));
        Ok(())
    }
}
