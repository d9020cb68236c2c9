//! # Vigil Core — Tiered SLO Violation Detection
//!
//! One generalized violation state machine replaces the per-protocol
//! monitor variants: probes hand in [`types::Observation`] records, the
//! [`engine::ViolationEngine`] tracks per-(component, protocol) active
//! violations and opens/closes history events, and the
//! [`scanner::EscalationScanner`] periodically detects the multi-event
//! patterns (repeated short outages, cumulative downtime) that escalate
//! a pair to the Extended and Additional tiers.
//!
//! Probe implementations, relational storage backends, and report
//! rendering live outside this crate; they meet it at [`types::Observation`],
//! the [`store::ViolationStore`] trait, and [`uptime::uptime_report`].

pub mod alert;
pub mod config;
pub mod engine;
pub mod error;
pub mod persistence;
pub mod scanner;
pub mod signature;
pub mod store;
pub mod types;
pub mod uptime;

pub use alert::{AlertSink, FanoutSink, JsonlSink, TracingSink};
pub use config::VigilConfig;
pub use engine::ViolationEngine;
pub use error::{VigilError, VigilResult};
pub use persistence::{Persistable, SnapshotManager, SnapshotMeta};
pub use scanner::{EscalationPolicy, EscalationScanner, ScanReport};
pub use signature::{default_schemes, SignatureScheme};
pub use store::{MemoryStore, ViolationStore};
pub use types::{
    ActiveViolation, Component, ComponentKind, EngineResult, EscalationNotice, Measurement,
    NoticeAction, Observation, Outcome, PairKey, Protocol, Signature, Tier, Transition,
    ViolationEvent,
};
pub use uptime::{uptime, uptime_report, UptimeStats};
