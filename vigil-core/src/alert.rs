//! Alert sinks — where escalation notices go.
//!
//! The engine and scanner hand off structured [`EscalationNotice`]
//! values; sinks decide how to record or page on them. The core never
//! formats human-facing text.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::types::{EscalationNotice, NoticeAction};

pub trait AlertSink: Send + Sync {
    fn notify(&self, notice: &EscalationNotice);
}

/// Emits notices as structured tracing records.
pub struct TracingSink;

impl AlertSink for TracingSink {
    fn notify(&self, notice: &EscalationNotice) {
        match notice.action {
            NoticeAction::Opened => warn!(
                component_id = notice.component_id,
                protocol = %notice.protocol,
                tier = %notice.tier,
                signature = ?notice.signature,
                "Violation opened"
            ),
            NoticeAction::Closed => info!(
                component_id = notice.component_id,
                protocol = %notice.protocol,
                tier = %notice.tier,
                "Violation closed"
            ),
            NoticeAction::Persisted => debug!(
                component_id = notice.component_id,
                protocol = %notice.protocol,
                tier = %notice.tier,
                "Violation persisting"
            ),
        }
    }
}

/// Appends one JSON line per notice to a log file, creating parent
/// directories on first write. Write failures are logged and dropped;
/// alerting must never fail an ingest.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AlertSink for JsonlSink {
    fn notify(&self, notice: &EscalationNotice) {
        use std::io::Write;

        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let line = match serde_json::to_string(notice) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "Failed to serialize escalation notice");
                return;
            }
        };
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            Ok(mut f) => {
                if let Err(e) = writeln!(f, "{line}") {
                    warn!(error = %e, path = %self.path.display(), "Alert log write failed");
                }
            }
            Err(e) => warn!(error = %e, path = %self.path.display(), "Alert log open failed"),
        }
    }
}

/// Delivers every notice to each inner sink in order.
pub struct FanoutSink {
    sinks: Vec<Box<dyn AlertSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn AlertSink>>) -> Self {
        Self { sinks }
    }
}

impl AlertSink for FanoutSink {
    fn notify(&self, notice: &EscalationNotice) {
        for sink in &self.sinks {
            sink.notify(notice);
        }
    }
}
