//! Deterministic risk scoring and its enforcement.
//!
//! Scoring is intentionally explainable: severities add up, a fixed
//! multiplier scales them, and fixed thresholds map the bounded score to a
//! level. Enforcement is where scoring meets the store: CRITICAL terminates
//! the session immediately, anything else updates the record in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::audit::{
    ACTION_SESSION_TERMINATED_HIGH_RISK, AuditDecision, AuditEvent, AuditLog,
};
use super::session::{RiskLevel, Session};
use super::signals::{RequestFacts, Signal, derive_signals};
use super::store::{SessionStore, StoreError};

/// Derived risk view of one request; the session record stays authoritative.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RiskProfile {
    pub session_id: Uuid,
    pub subject_id: String,
    pub score: u8,
    pub level: RiskLevel,
    pub signals: Vec<Signal>,
    pub evaluated_at: DateTime<Utc>,
}

/// Scoring parameters; defaults match the documented model.
#[derive(Clone, Copy, Debug)]
pub struct RiskEngine {
    severity_multiplier: u32,
    medium_at: u8,
    high_at: u8,
    critical_at: u8,
}

impl RiskEngine {
    /// Default model: `score = min(100, Σ severity × 5)`, levels at 30/60/80.
    #[must_use]
    pub fn new() -> Self {
        Self {
            severity_multiplier: 5,
            medium_at: 30,
            high_at: 60,
            critical_at: 80,
        }
    }

    #[must_use]
    pub fn with_severity_multiplier(mut self, multiplier: u32) -> Self {
        self.severity_multiplier = multiplier.max(1);
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, medium_at: u8, high_at: u8, critical_at: u8) -> Self {
        self.medium_at = medium_at;
        self.high_at = high_at;
        self.critical_at = critical_at;
        self
    }

    /// Score a signal set for a session.
    #[must_use]
    pub fn evaluate(&self, session: &Session, signals: Vec<Signal>) -> RiskProfile {
        let raw: u32 = signals
            .iter()
            .map(|signal| u32::from(signal.severity))
            .sum::<u32>()
            .saturating_mul(self.severity_multiplier);
        let score = u8::try_from(raw.min(100)).unwrap_or(100);

        RiskProfile {
            session_id: session.id,
            subject_id: session.subject_id.clone(),
            score,
            level: self.level_for(score),
            signals,
            evaluated_at: Utc::now(),
        }
    }

    /// Level thresholds are inclusive at their lower bound.
    #[must_use]
    pub fn level_for(&self, score: u8) -> RiskLevel {
        if score >= self.critical_at {
            RiskLevel::Critical
        } else if score >= self.high_at {
            RiskLevel::High
        } else if score >= self.medium_at {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

impl Default for RiskEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one continuous-evaluation pass.
#[derive(Clone, Debug)]
pub struct RiskOutcome {
    pub profile: RiskProfile,
    /// The session was revoked because the evaluation reached CRITICAL.
    pub terminated: bool,
}

/// Binds the engine to enforcement against the session store.
#[derive(Clone)]
pub struct RiskService {
    engine: RiskEngine,
    sessions: Arc<dyn SessionStore>,
    audit: AuditLog,
}

impl RiskService {
    #[must_use]
    pub fn new(engine: RiskEngine, sessions: Arc<dyn SessionStore>, audit: AuditLog) -> Self {
        Self {
            engine,
            sessions,
            audit,
        }
    }

    /// Evaluate the request and enforce the result.
    ///
    /// CRITICAL revokes the session and emits the termination audit event so
    /// the caller can short-circuit with 403. Any other level persists the new
    /// risk fields. Audit failures never surface; store failures do.
    ///
    /// # Errors
    /// Propagates store errors so the pipeline can fail closed.
    pub async fn evaluate_and_enforce(
        &self,
        session: &Session,
        facts: &RequestFacts,
    ) -> Result<RiskOutcome, StoreError> {
        let signals = derive_signals(facts, session);
        let profile = self.engine.evaluate(session, signals);

        if profile.level == RiskLevel::Critical {
            warn!(
                session_id = %session.id,
                subject_id = %session.subject_id,
                score = profile.score,
                "critical risk, terminating session"
            );
            // Revocation failures still deny the request upstream; report and
            // continue so the caller can send the 403.
            if let Err(err) = self.sessions.revoke(session.id).await {
                warn!(session_id = %session.id, "revoke on critical risk failed: {err}");
            }

            let mut event = AuditEvent::new(
                session.subject_id.clone(),
                ACTION_SESSION_TERMINATED_HIGH_RISK,
                AuditDecision::Deny,
            );
            event.session_id = Some(session.id);
            event.risk_level = RiskLevel::Critical;
            event.mfa_verified = session.mfa_verified;
            event.ip = facts.ip.clone();
            event.user_agent = facts.user_agent.clone();
            event.reason = Some(format!("score={}", profile.score));
            self.audit.append(event);

            return Ok(RiskOutcome {
                profile,
                terminated: true,
            });
        }

        self.sessions
            .update_risk(session.id, profile.level, profile.evaluated_at)
            .await?;

        Ok(RiskOutcome {
            profile,
            terminated: false,
        })
    }
}
