//! Replay-nonce sentinels.
//!
//! A nonce is accepted exactly once across all instances sharing the store:
//! SET NX on `anti-replay:{sha256(nonce)}` with the replay TTL. Only the hash
//! ever reaches the store.

use redis::aio::ConnectionManager;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::timeout;
use tracing::Instrument;
use tracing::info_span;

use super::store::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// First sighting inside the TTL window.
    Fresh,
    /// The nonce was already registered.
    Seen,
}

fn nonce_key(nonce: &str) -> String {
    format!("anti-replay:{}", hex::encode(Sha256::digest(nonce.as_bytes())))
}

/// Shared-store replay guard.
#[derive(Clone)]
pub struct ReplayGuard {
    conn: ConnectionManager,
    ttl: Duration,
    io_budget: Duration,
}

impl ReplayGuard {
    #[must_use]
    pub fn new(conn: ConnectionManager, ttl: Duration, io_budget: Duration) -> Self {
        Self {
            conn,
            ttl,
            io_budget,
        }
    }

    /// Register a nonce; `Seen` means a replay within the TTL.
    ///
    /// # Errors
    /// Propagates store errors; callers fail closed.
    pub async fn register(&self, nonce: &str) -> Result<ReplayOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let key = nonce_key(nonce);
        let ttl = self.ttl.as_secs().max(1);
        let span = info_span!("kv.replay_setnx", kv.system = "redis", kv.key = %key);
        let stored: Option<String> = match timeout(
            self.io_budget,
            async {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(chrono::Utc::now().timestamp())
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl)
                    .query_async(&mut conn)
                    .await
            }
            .instrument(span),
        )
        .await
        {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => return Err(StoreError::Unavailable(err)),
            Err(_) => return Err(StoreError::Timeout),
        };

        Ok(if stored.is_some() {
            ReplayOutcome::Fresh
        } else {
            ReplayOutcome::Seen
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_key_is_hashed() {
        let key = nonce_key("nonce-1");
        assert!(key.starts_with("anti-replay:"));
        assert!(!key.contains("nonce-1"));
        // 64 hex chars of SHA-256.
        assert_eq!(key.len(), "anti-replay:".len() + 64);
    }

    #[test]
    fn same_nonce_hashes_identically_across_instances() {
        assert_eq!(nonce_key("abc"), nonce_key("abc"));
        assert_ne!(nonce_key("abc"), nonce_key("abd"));
    }
}
