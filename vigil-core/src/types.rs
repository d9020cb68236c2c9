//! Shared types for the violation engine, escalation scanner, and store.

use std::fmt;

/// Check protocols a component can be monitored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Protocol {
    Icmp,
    Http,
    Https,
    HeaderSecurity,
    Encryption,
    Waf,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Icmp => "icmp",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::HeaderSecurity => "header-security",
            Protocol::Encryption => "encryption",
            Protocol::Waf => "waf",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "icmp" => Some(Protocol::Icmp),
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            "header-security" => Some(Protocol::HeaderSecurity),
            "encryption" => Some(Protocol::Encryption),
            "waf" => Some(Protocol::Waf),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of endpoint a component names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ComponentKind {
    Address,
    Domain,
    Url,
    Volume,
}

/// A monitored endpoint. Registered by operators; soft-deleted via
/// `active = false` rather than purged while history references it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Component {
    pub id: u64,
    pub name: String,
    pub kind: ComponentKind,
    pub protocols: Vec<Protocol>,
    pub active: bool,
}

/// Probe outcome for a single check cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Outcome {
    Success,
    Failure,
}

/// Optional numeric payload attached to an observation.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Measurement {
    /// Round-trip or response latency in milliseconds.
    LatencyMs(f64),
    /// Bitmask of failing sub-checks (see `signature` module for bit layout).
    FailedChecks(u16),
    /// Encryption flag reported by a storage/volume scan.
    Encrypted(bool),
}

/// Immutable record handed to the engine by a probe collaborator.
/// One per probe cycle per (component, protocol); never mutated.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Observation {
    pub component_id: u64,
    pub protocol: Protocol,
    /// Epoch seconds. Must be non-decreasing within a (component, protocol) pair.
    pub timestamp: i64,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement: Option<Measurement>,
}

/// Key identifying the unit of violation state.
pub type PairKey = (u64, Protocol);

impl Observation {
    pub fn pair(&self) -> PairKey {
        (self.component_id, self.protocol)
    }
}

/// Fingerprint of *why* a pair is violating. Identical signatures mean
/// the same issue persisting; a changed signature while still failing is
/// a new incident replacing the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Signature {
    /// Binary reachability check failed (ping / GET did not succeed).
    Unreachable,
    /// Composite check: bitmask of the sub-checks currently failing.
    FailedChecks(u16),
    /// Volume or storage account found unencrypted.
    Unencrypted,
    /// Expected block-log entries were absent for the probe window.
    DetectionMiss,
}

/// Violation tiers. Independently activatable: the engine owns Primary,
/// the scanner owns Extended and Additional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Tier {
    Primary,
    Extended,
    Additional,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Primary => "primary",
            Tier::Extended => "extended",
            Tier::Additional => "additional",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type EventId = u64;

/// Immutable violation history row. `closed_at = None` means still open.
/// At most one open event exists per (component, protocol, tier).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ViolationEvent {
    pub id: EventId,
    pub component_id: u64,
    pub protocol: Protocol,
    pub tier: Tier,
    /// Signature for Primary events; scanner-opened tiers carry None.
    pub signature: Option<Signature>,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
}

impl ViolationEvent {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    pub fn pair(&self) -> PairKey {
        (self.component_id, self.protocol)
    }
}

/// Live engine-owned state for one (component, protocol) pair. Created
/// lazily on first observation; reset to cleared, never deleted.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ActiveViolation {
    pub component_id: u64,
    pub protocol: Protocol,
    /// Signature of the open Primary incident, None when cleared.
    pub signature: Option<Signature>,
    pub consecutive_failures: u32,
    pub first_failure_time: Option<i64>,
    pub last_transition_time: i64,
    /// Timestamp of the most recently ingested observation, for the
    /// ordering precondition and duplicate-delivery detection.
    pub last_observation_time: Option<i64>,
    pub last_outcome: Option<Outcome>,
    /// Optimistic-lock version; bumped by the store on every accepted write.
    pub version: u64,
}

impl ActiveViolation {
    pub fn cleared(component_id: u64, protocol: Protocol) -> Self {
        Self {
            component_id,
            protocol,
            signature: None,
            consecutive_failures: 0,
            first_failure_time: None,
            last_transition_time: 0,
            last_observation_time: None,
            last_outcome: None,
            version: 0,
        }
    }

    pub fn pair(&self) -> PairKey {
        (self.component_id, self.protocol)
    }

    pub fn is_open(&self) -> bool {
        self.signature.is_some()
    }
}

/// Tier transition produced by one `ingest` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Transition {
    /// Nothing changed (healthy observation with nothing open, or a
    /// duplicate redelivery).
    None,
    /// A Primary violation was opened.
    Opened,
    /// All open tiers were closed by a recovery.
    Closed,
    /// The open incident was replaced by one with a different signature.
    Reclassified,
    /// The open incident persisted with the same signature.
    Persisted,
}

/// What happened to a specific tier, for the alert sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NoticeAction {
    Opened,
    Closed,
    Persisted,
}

/// Structured record handed to the alert sink. The core never formats
/// human paging text.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EscalationNotice {
    pub component_id: u64,
    pub protocol: Protocol,
    pub tier: Tier,
    pub signature: Option<Signature>,
    pub action: NoticeAction,
    pub timestamp: i64,
}

/// Result of one `ingest` call.
#[derive(Debug, Clone)]
pub struct EngineResult {
    pub component_id: u64,
    pub protocol: Protocol,
    pub transition: Transition,
    pub notices: Vec<EscalationNotice>,
    pub uptime: crate::uptime::UptimeStats,
}
