//! Per-protocol signature adapters.
//!
//! One generalized engine serves every check protocol; each protocol
//! supplies only the mapping from a raw observation to a violation
//! signature. A `None` signature means the observation is healthy.

use std::collections::HashMap;

use crate::types::{Measurement, Observation, Outcome, Protocol, Signature};

// Bit layout for HeaderSecurity check masks. A set bit marks a FAILING check.
pub const CHECK_HSTS: u16 = 1 << 0;
pub const CHECK_CONTENT_TYPE_OPTIONS: u16 = 1 << 1;
pub const CHECK_XSS_PROTECTION: u16 = 1 << 2;
pub const CHECK_FORWARD_SECRECY: u16 = 1 << 3;
pub const CHECK_TLS_GRADE: u16 = 1 << 4;

pub const ALL_HEADER_CHECKS: u16 = CHECK_HSTS
    | CHECK_CONTENT_TYPE_OPTIONS
    | CHECK_XSS_PROTECTION
    | CHECK_FORWARD_SECRECY
    | CHECK_TLS_GRADE;

const CHECK_NAMES: &[(u16, &str)] = &[
    (CHECK_HSTS, "strict-transport-security"),
    (CHECK_CONTENT_TYPE_OPTIONS, "x-content-type-options"),
    (CHECK_XSS_PROTECTION, "x-xss-protection"),
    (CHECK_FORWARD_SECRECY, "forward-secrecy"),
    (CHECK_TLS_GRADE, "tls-grade"),
];

/// Names of the failing checks in a HeaderSecurity mask.
pub fn failing_check_names(mask: u16) -> Vec<&'static str> {
    CHECK_NAMES
        .iter()
        .filter(|(bit, _)| mask & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Maps an observation to the signature of the condition it reports.
pub trait SignatureScheme: Send + Sync {
    /// `None` means healthy; `Some` identifies the failing condition.
    fn signature(&self, obs: &Observation) -> Option<Signature>;
}

/// Binary up/down checks (ICMP ping, HTTP/HTTPS GET).
pub struct ReachabilityScheme;

impl SignatureScheme for ReachabilityScheme {
    fn signature(&self, obs: &Observation) -> Option<Signature> {
        match obs.outcome {
            Outcome::Success => None,
            Outcome::Failure => Some(Signature::Unreachable),
        }
    }
}

/// Security-header probe: the signature is the set of failing checks,
/// so an unchanged mask is the same issue persisting while a different
/// mask is a new incident.
pub struct HeaderScheme;

impl SignatureScheme for HeaderScheme {
    fn signature(&self, obs: &Observation) -> Option<Signature> {
        match obs.outcome {
            Outcome::Success => None,
            Outcome::Failure => match obs.measurement {
                Some(Measurement::FailedChecks(mask)) if mask != 0 => {
                    Some(Signature::FailedChecks(mask & ALL_HEADER_CHECKS))
                }
                // Probe errored before it could grade individual headers.
                _ => Some(Signature::Unreachable),
            },
        }
    }
}

/// Encryption-status scan over volumes and storage accounts.
pub struct EncryptionScheme;

impl SignatureScheme for EncryptionScheme {
    fn signature(&self, obs: &Observation) -> Option<Signature> {
        match (obs.outcome, obs.measurement) {
            (Outcome::Success, _) => None,
            (Outcome::Failure, Some(Measurement::Encrypted(true))) => None,
            (Outcome::Failure, _) => Some(Signature::Unencrypted),
        }
    }
}

/// WAF block-log evaluation: a Failure marks a probe window in which the
/// expected block entries never appeared.
pub struct WafScheme;

impl SignatureScheme for WafScheme {
    fn signature(&self, obs: &Observation) -> Option<Signature> {
        match obs.outcome {
            Outcome::Success => None,
            Outcome::Failure => Some(Signature::DetectionMiss),
        }
    }
}

/// The stock adapter set covering every supported protocol.
pub fn default_schemes() -> HashMap<Protocol, Box<dyn SignatureScheme>> {
    let mut m: HashMap<Protocol, Box<dyn SignatureScheme>> = HashMap::new();
    m.insert(Protocol::Icmp, Box::new(ReachabilityScheme));
    m.insert(Protocol::Http, Box::new(ReachabilityScheme));
    m.insert(Protocol::Https, Box::new(ReachabilityScheme));
    m.insert(Protocol::HeaderSecurity, Box::new(HeaderScheme));
    m.insert(Protocol::Encryption, Box::new(EncryptionScheme));
    m.insert(Protocol::Waf, Box::new(WafScheme));
    m
}
