//! Tamper-evident audit log.
//!
//! Every record embeds the previous record's id and its own content hash, so
//! the whole log verifies offline: recomputing `H(canonical(record minus
//! id/content_hash) || prev_hash)` for each record in order must reproduce the
//! stored ids. Appends are cheap for the request path: the chain advances
//! under a short lock and the record is handed to a bounded queue whose
//! consumer persists it with retries. Emission failures never reach callers;
//! they surface as counters and error logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use super::canonical::canonical_json;
use super::session::RiskLevel;

/// `prev_hash` of the first record in a chain.
pub const GENESIS: &str = "GENESIS";

pub const ACTION_REQUEST: &str = "http.request";
pub const ACTION_SESSION_REVOKED: &str = "SESSION_REVOKED";
pub const ACTION_SESSIONS_REVOKED_SUBJECT: &str = "SESSIONS_REVOKED_SUBJECT";
pub const ACTION_SESSION_TERMINATED_HIGH_RISK: &str = "SESSION_TERMINATED_HIGH_RISK";
pub const ACTION_ENTITLEMENT_GRANTED: &str = "ENTITLEMENT_GRANTED";
pub const ACTION_ENTITLEMENT_REVOKED: &str = "ENTITLEMENT_REVOKED";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditDecision {
    Allow,
    Deny,
    Challenge,
    Granted,
    Revoked,
}

impl AuditDecision {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Deny => "DENY",
            Self::Challenge => "CHALLENGE",
            Self::Granted => "GRANTED",
            Self::Revoked => "REVOKED",
        }
    }
}

/// What a caller knows about an auditable outcome before sealing.
#[derive(Clone, Debug)]
pub struct AuditEvent {
    pub subject_id: String,
    pub session_id: Option<Uuid>,
    pub action: String,
    pub resource: Option<String>,
    pub decision: AuditDecision,
    pub reason: Option<String>,
    pub mechanism: Option<String>,
    pub policy_package: Option<String>,
    pub policy_rule: Option<String>,
    pub roles: Vec<String>,
    pub entitlements: Vec<String>,
    pub risk_level: RiskLevel,
    pub mfa_verified: bool,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditEvent {
    /// Minimal event for a decision on `action` by `subject_id`.
    #[must_use]
    pub fn new(subject_id: impl Into<String>, action: impl Into<String>, decision: AuditDecision) -> Self {
        Self {
            subject_id: subject_id.into(),
            session_id: None,
            action: action.into(),
            resource: None,
            decision,
            reason: None,
            mechanism: None,
            policy_package: None,
            policy_rule: None,
            roles: Vec::new(),
            entitlements: Vec::new(),
            risk_level: RiskLevel::Low,
            mfa_verified: false,
            ip: None,
            user_agent: None,
        }
    }
}

/// A sealed, chain-linked audit record. `id == content_hash`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AuditRecord {
    pub id: String,
    pub prev_hash: String,
    pub subject_id: String,
    pub session_id: Option<Uuid>,
    pub action: String,
    pub resource: Option<String>,
    pub decision: AuditDecision,
    pub reason: Option<String>,
    pub mechanism: Option<String>,
    pub policy_package: Option<String>,
    pub policy_rule: Option<String>,
    pub roles: Vec<String>,
    pub entitlements: Vec<String>,
    pub risk_level: RiskLevel,
    pub mfa_verified: bool,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub evaluated_at: DateTime<Utc>,
    pub content_hash: String,
}

impl AuditRecord {
    /// Recompute this record's content hash from its own fields.
    #[must_use]
    pub fn recompute_hash(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("id");
            map.remove("content_hash");
        }
        hash_with_prev(&value, &self.prev_hash)
    }
}

fn hash_with_prev(value: &Value, prev_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Seal an event into a record linked to `prev_hash`.
#[must_use]
pub fn seal(event: AuditEvent, prev_hash: &str, evaluated_at: DateTime<Utc>) -> AuditRecord {
    let mut record = AuditRecord {
        id: String::new(),
        prev_hash: prev_hash.to_string(),
        subject_id: event.subject_id,
        session_id: event.session_id,
        action: event.action,
        resource: event.resource,
        decision: event.decision,
        reason: event.reason,
        mechanism: event.mechanism,
        policy_package: event.policy_package,
        policy_rule: event.policy_rule,
        roles: event.roles,
        entitlements: event.entitlements,
        risk_level: event.risk_level,
        mfa_verified: event.mfa_verified,
        ip: event.ip,
        user_agent: event.user_agent,
        evaluated_at,
        content_hash: String::new(),
    };
    let hash = record.recompute_hash();
    record.content_hash = hash.clone();
    record.id = hash;
    record
}

/// Result of offline chain verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainVerification {
    pub total: usize,
    pub intact: bool,
    /// Id of the first record failing verification, if any.
    pub first_break: Option<String>,
}

/// Verify an ordered slice of records against `expected_prev` (use [`GENESIS`]
/// when verifying from the beginning). Any mutation, deletion, or reorder
/// breaks verification at that record and every successor.
#[must_use]
pub fn verify_chain(records: &[AuditRecord], expected_prev: &str) -> ChainVerification {
    let mut prev = expected_prev.to_string();
    for record in records {
        let valid = record.prev_hash == prev
            && record.id == record.content_hash
            && record.recompute_hash() == record.id;
        if !valid {
            return ChainVerification {
                total: records.len(),
                intact: false,
                first_break: Some(record.id.clone()),
            };
        }
        prev = record.id.clone();
    }
    ChainVerification {
        total: records.len(),
        intact: true,
        first_break: None,
    }
}

/// Durable destination for sealed records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one record, or return an error to trigger a retry.
    async fn persist(&self, record: &AuditRecord) -> anyhow::Result<()>;
}

/// Dev sink that only emits the structured log stream.
#[derive(Clone, Debug)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn persist(&self, record: &AuditRecord) -> anyhow::Result<()> {
        info!(
            target: "audit",
            id = %record.id,
            action = %record.action,
            decision = record.decision.as_str(),
            "audit sink stub"
        );
        Ok(())
    }
}

/// Append-only table sink. Retries are idempotent: the record id is the
/// primary key and conflicts are ignored.
#[derive(Clone)]
pub struct PostgresAuditSink {
    pool: PgPool,
}

impl PostgresAuditSink {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PostgresAuditSink {
    async fn persist(&self, record: &AuditRecord) -> anyhow::Result<()> {
        let query = r"
            INSERT INTO audit_records
                (id, prev_hash, subject_id, session_id, action, resource, decision,
                 reason, mechanism, policy_package, policy_rule, roles, entitlements,
                 risk_level, mfa_verified, ip, user_agent, evaluated_at, content_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (id) DO NOTHING
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&record.id)
            .bind(&record.prev_hash)
            .bind(&record.subject_id)
            .bind(record.session_id)
            .bind(&record.action)
            .bind(&record.resource)
            .bind(record.decision.as_str())
            .bind(&record.reason)
            .bind(&record.mechanism)
            .bind(&record.policy_package)
            .bind(&record.policy_rule)
            .bind(&record.roles)
            .bind(&record.entitlements)
            .bind(record.risk_level.as_str())
            .bind(record.mfa_verified)
            .bind(&record.ip)
            .bind(&record.user_agent)
            .bind(record.evaluated_at)
            .bind(&record.content_hash)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }
}

/// Load the id of the newest persisted record so a restarted instance
/// continues its chain instead of starting a second genesis.
///
/// # Errors
/// Returns an error when the audit table cannot be queried.
pub async fn load_chain_head(pool: &PgPool) -> anyhow::Result<Option<String>> {
    let query = "SELECT id FROM audit_records ORDER BY evaluated_at DESC, id DESC LIMIT 1";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row: Option<(String,)> = sqlx::query_as(query)
        .fetch_optional(pool)
        .instrument(span)
        .await?;
    Ok(row.map(|(id,)| id))
}

#[derive(Clone, Copy, Debug)]
pub struct AuditWorkerConfig {
    queue_capacity: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl AuditWorkerConfig {
    /// Defaults: 1024 queued records, 5 attempts, 100ms->5s backoff with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    #[must_use]
    pub fn with_backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = max;
        self
    }
}

impl Default for AuditWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct AuditLogInner {
    tx: mpsc::Sender<AuditRecord>,
    last_hash: Mutex<String>,
    dropped: AtomicU64,
    dead_lettered: Arc<AtomicU64>,
}

/// Handle shared by every component that records outcomes.
///
/// `append` is synchronous and infallible from the caller's point of view:
/// the chain advances in memory, the record goes to the structured `audit`
/// log stream, and durable persistence happens on the consumer task.
#[derive(Clone)]
pub struct AuditLog {
    inner: Arc<AuditLogInner>,
}

impl AuditLog {
    /// Start the log with its consumer task.
    ///
    /// `chain_head` is the id of the newest already-persisted record, or
    /// `None` to start a fresh chain at [`GENESIS`].
    #[must_use]
    pub fn start(
        chain_head: Option<String>,
        sink: Arc<dyn AuditSink>,
        config: AuditWorkerConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let dead_lettered = Arc::new(AtomicU64::new(0));
        tokio::spawn(run_sink_worker(rx, sink, config, Arc::clone(&dead_lettered)));
        Self {
            inner: Arc::new(AuditLogInner {
                tx,
                last_hash: Mutex::new(chain_head.unwrap_or_else(|| GENESIS.to_string())),
                dropped: AtomicU64::new(0),
                dead_lettered,
            }),
        }
    }

    /// Seal and enqueue an event, returning the chained record.
    pub fn append(&self, event: AuditEvent) -> AuditRecord {
        let record = {
            let mut last = self
                .inner
                .last_hash
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let record = seal(event, &last, Utc::now());
            last.clone_from(&record.id);
            // Enqueue under the lock so queue order matches chain order;
            // try_send never blocks.
            if self.inner.tx.try_send(record.clone()).is_err() {
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    record_id = %record.id,
                    dropped_total = dropped,
                    "audit queue full, record shed"
                );
            }
            record
        };

        info!(
            target: "audit",
            id = %record.id,
            prev_hash = %record.prev_hash,
            subject_id = %record.subject_id,
            action = %record.action,
            decision = record.decision.as_str(),
            risk_level = record.risk_level.as_str(),
            "audit record"
        );

        record
    }

    /// Records shed because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Records abandoned after exhausting persistence retries.
    #[must_use]
    pub fn dead_lettered(&self) -> u64 {
        self.inner.dead_lettered.load(Ordering::Relaxed)
    }
}

async fn run_sink_worker(
    mut rx: mpsc::Receiver<AuditRecord>,
    sink: Arc<dyn AuditSink>,
    config: AuditWorkerConfig,
    dead_lettered: Arc<AtomicU64>,
) {
    while let Some(record) = rx.recv().await {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match sink.persist(&record).await {
                Ok(()) => break,
                Err(err) if attempt >= config.max_attempts => {
                    let total = dead_lettered.fetch_add(1, Ordering::Relaxed) + 1;
                    error!(
                        record_id = %record.id,
                        attempts = attempt,
                        dead_lettered_total = total,
                        "audit record dead-lettered: {err}"
                    );
                    break;
                }
                Err(err) => {
                    warn!(
                        record_id = %record.id,
                        attempt,
                        "audit persist failed, retrying: {err}"
                    );
                    sleep(backoff_delay(
                        attempt,
                        config.backoff_base,
                        config.backoff_max,
                    ))
                    .await;
                }
            }
        }
    }
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    let capped = if delay > max { max } else { delay };
    jitter_delay(capped)
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}
