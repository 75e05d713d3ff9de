//! Risk-adaptive request throttling.
//!
//! One counter per session at `rate:{session_id}` in a fixed 60 s window:
//! INCR on every protected request, EXPIRE on the first increment. The cap
//! depends on the session's current risk level; CRITICAL is rejected outright
//! as defense in depth behind the risk service.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::time::timeout;
use tracing::Instrument;
use tracing::info_span;
use uuid::Uuid;

use super::session::RiskLevel;

/// Cap applied when no cap is configured for a level.
pub const DEFAULT_WINDOW_LIMIT: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate counter unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
    #[error("rate counter call exceeded its budget")]
    Timeout,
}

/// Throttling capability consumed by the pipeline.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count this request against the session's window and decide.
    async fn register(
        &self,
        session_id: Uuid,
        level: RiskLevel,
    ) -> Result<RateLimitDecision, RateLimitError>;
}

/// Per-level caps for one 60 s window.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    low: u32,
    medium: u32,
    high: u32,
    window: Duration,
}

impl RateLimitConfig {
    /// Defaults: LOW=1000, MEDIUM=200, HIGH=20, CRITICAL rejected.
    #[must_use]
    pub fn new() -> Self {
        Self {
            low: 1000,
            medium: 200,
            high: 20,
            window: Duration::from_secs(60),
        }
    }

    #[must_use]
    pub fn with_caps(mut self, low: u32, medium: u32, high: u32) -> Self {
        self.low = low;
        self.medium = medium;
        self.high = high;
        self
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Cap for a level; `None` means reject without counting.
    #[must_use]
    pub fn cap_for(&self, level: RiskLevel) -> Option<u32> {
        match level {
            RiskLevel::Low => Some(if self.low == 0 { DEFAULT_WINDOW_LIMIT } else { self.low }),
            RiskLevel::Medium => Some(if self.medium == 0 {
                DEFAULT_WINDOW_LIMIT
            } else {
                self.medium
            }),
            RiskLevel::High => Some(if self.high == 0 {
                DEFAULT_WINDOW_LIMIT
            } else {
                self.high
            }),
            RiskLevel::Critical => None,
        }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn rate_key(session_id: Uuid) -> String {
    format!("rate:{session_id}")
}

/// Redis-backed fixed-window [`RateLimiter`].
#[derive(Clone)]
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    config: RateLimitConfig,
    io_budget: Duration,
}

impl RedisRateLimiter {
    #[must_use]
    pub fn new(conn: ConnectionManager, config: RateLimitConfig, io_budget: Duration) -> Self {
        Self {
            conn,
            config,
            io_budget,
        }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn register(
        &self,
        session_id: Uuid,
        level: RiskLevel,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let Some(cap) = self.config.cap_for(level) else {
            return Ok(RateLimitDecision::Limited);
        };

        let mut conn = self.conn.clone();
        let key = rate_key(session_id);
        let window = i64::try_from(self.config.window().as_secs()).unwrap_or(60);
        let span = info_span!("kv.rate_incr", kv.system = "redis", kv.key = %key);
        let count: u64 = match timeout(
            self.io_budget,
            async {
                let count: u64 = conn.incr(&key, 1u64).await?;
                if count == 1 {
                    let () = conn.expire(&key, window).await?;
                }
                redis::RedisResult::Ok(count)
            }
            .instrument(span),
        )
        .await
        {
            Ok(Ok(count)) => count,
            Ok(Err(err)) => return Err(RateLimitError::Unavailable(err)),
            Err(_) => return Err(RateLimitError::Timeout),
        };

        if count > u64::from(cap) {
            Ok(RateLimitDecision::Limited)
        } else {
            Ok(RateLimitDecision::Allowed)
        }
    }
}

/// Limiter that admits everything; for tests and local development.
#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn register(
        &self,
        _session_id: Uuid,
        level: RiskLevel,
    ) -> Result<RateLimitDecision, RateLimitError> {
        // Even the noop limiter refuses CRITICAL; that rejection is part of
        // the contract, not a tuning knob.
        if level == RiskLevel::Critical {
            return Ok(RateLimitDecision::Limited);
        }
        Ok(RateLimitDecision::Allowed)
    }
}

/// Counting in-memory limiter for tests; one fixed window per session.
#[derive(Default)]
pub struct InMemoryRateLimiter {
    config: RateLimitConfig,
    counters: std::sync::Mutex<std::collections::HashMap<Uuid, u64>>,
}

impl InMemoryRateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            counters: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Clear all counters, as the window expiry would.
    pub fn reset(&self) {
        self.counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn register(
        &self,
        session_id: Uuid,
        level: RiskLevel,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let Some(cap) = self.config.cap_for(level) else {
            return Ok(RateLimitDecision::Limited);
        };
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let count = counters.entry(session_id).or_insert(0);
        *count += 1;
        if *count > u64::from(cap) {
            Ok(RateLimitDecision::Limited)
        } else {
            Ok(RateLimitDecision::Allowed)
        }
    }
}
