//! Per-request risk signal derivation.
//!
//! Pure comparison of the current request against the session's bound device
//! and last-seen context. Signals are ephemeral: produced, scored, and folded
//! into audit records, never persisted raw.

use serde::{Deserialize, Serialize};

use super::session::Session;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    IpAnomaly,
    GeoAnomaly,
    DeviceMismatch,
    ImpossibleTravel,
    BehaviorAnomaly,
    ThreatIntel,
    SessionReuse,
}

/// One observed anomaly with a severity in `[1, 10]`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Signal {
    #[serde(rename = "type")]
    pub kind: SignalType,
    pub severity: u8,
    pub evidence: String,
}

impl Signal {
    fn new(kind: SignalType, severity: u8, evidence: String) -> Self {
        Self {
            kind,
            severity,
            evidence,
        }
    }
}

/// Facts extracted from the inbound request before any store access.
#[derive(Clone, Debug, Default)]
pub struct RequestFacts {
    pub method: String,
    pub path: String,
    pub access_token: Option<String>,
    pub device_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub geo: Option<String>,
    pub automation: Option<String>,
    pub nonce: Option<String>,
}

const SEVERITY_IP_ANOMALY: u8 = 3;
const SEVERITY_DEVICE_MISMATCH: u8 = 7;
const SEVERITY_USER_AGENT_CHANGE: u8 = 2;
const SEVERITY_AUTOMATION: u8 = 4;
const SEVERITY_IMPOSSIBLE_TRAVEL: u8 = 7;

/// Derive all signals for one request against the current session.
#[must_use]
pub fn derive_signals(facts: &RequestFacts, session: &Session) -> Vec<Signal> {
    let mut signals = Vec::new();

    if let (Some(ip), Some(last_ip)) = (facts.ip.as_deref(), session.last_seen_ip.as_deref())
        && ip != last_ip
    {
        signals.push(Signal::new(
            SignalType::IpAnomaly,
            SEVERITY_IP_ANOMALY,
            format!("ip changed from {last_ip} to {ip}"),
        ));
    }

    if let (Some(device), Some(bound)) = (facts.device_id.as_deref(), session.device_id.as_deref())
        && device != bound
    {
        signals.push(Signal::new(
            SignalType::DeviceMismatch,
            SEVERITY_DEVICE_MISMATCH,
            format!("device {device} does not match bound device"),
        ));
    }

    if let (Some(agent), Some(last_agent)) =
        (facts.user_agent.as_deref(), session.last_user_agent.as_deref())
        && agent != last_agent
    {
        signals.push(Signal::new(
            SignalType::BehaviorAnomaly,
            SEVERITY_USER_AGENT_CHANGE,
            "user agent changed mid-session".to_string(),
        ));
    }

    if facts.automation.is_some() {
        signals.push(Signal::new(
            SignalType::BehaviorAnomaly,
            SEVERITY_AUTOMATION,
            "automation header present".to_string(),
        ));
    }

    if let (Some(geo), Some(last_geo)) = (facts.geo.as_deref(), session.last_geo.as_deref())
        && geo != last_geo
    {
        signals.push(Signal::new(
            SignalType::ImpossibleTravel,
            SEVERITY_IMPOSSIBLE_TRAVEL,
            format!("geolocation jumped from {last_geo} to {geo}"),
        ));
    }

    signals
}
