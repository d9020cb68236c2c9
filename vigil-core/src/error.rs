use thiserror::Error;

use crate::types::{Protocol, Tier};

pub type VigilResult<T> = Result<T, VigilError>;

#[derive(Error, Debug)]
pub enum VigilError {
    #[error("Out-of-order or malformed observation for component {component_id} ({protocol}): {reason}")]
    InvalidObservation {
        component_id: u64,
        protocol: Protocol,
        reason: String,
    },

    #[error("Violation store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Concurrent update on active violation for component {component_id} ({protocol}): expected version {expected}, found {found}")]
    ConcurrentUpdateConflict {
        component_id: u64,
        protocol: Protocol,
        expected: u64,
        found: u64,
    },

    #[error("Engine gave up after {attempts} conflicting updates for component {component_id} ({protocol})")]
    EngineUnavailable {
        component_id: u64,
        protocol: Protocol,
        attempts: u32,
    },

    #[error("Data integrity: open {tier} event {event_id} has no matching active violation for component {component_id} ({protocol})")]
    DataIntegrity {
        event_id: u64,
        component_id: u64,
        protocol: Protocol,
        tier: Tier,
    },

    #[error("Unknown violation event id {0}")]
    UnknownEvent(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
