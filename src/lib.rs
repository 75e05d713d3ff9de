//! # Gardi (Zero-Trust Authorization Core)
//!
//! `gardi` re-evaluates every inbound request: verified session, bound
//! device, live risk signals, risk-adaptive throttling, and an external
//! policy decision, with a tamper-evident audit record for the outcome. No
//! trust is inferred from prior success.
//!
//! ## Admission pipeline
//!
//! Protected routes sit behind a strictly ordered step chain:
//!
//! 1. `require_session` — signed `accessToken` cookie → live session record.
//! 2. `enforce_device_binding` — `X-Device-Id` must match the bound device.
//! 3. `continuous_access_evaluation` — deterministic risk scoring; CRITICAL
//!    terminates the session mid-flight.
//! 4. `risk_throttle` — per-session fixed-window caps keyed by risk level.
//! 5. `build_policy_input` — canonical input from session, tenant, risk, and
//!    active entitlements.
//! 6. `authorize` — policy engine decision, cached for at most 5 seconds.
//! 7. Audit append — hash-chained record of the outcome.
//!
//! ## State layout
//!
//! Request-time shared state (sessions, subject index, rate counters,
//! decision cache, replay sentinels) lives in Redis so instances scale
//! horizontally; durable records (entitlements, audit log) live in
//! PostgreSQL. Every dependency failure fails closed.

pub mod api;
pub mod authz;
pub mod cli;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
