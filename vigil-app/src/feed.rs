//! Observation feed — the probe boundary.
//!
//! Probe collaborators (ping workers, header scanners, encryption scans,
//! WAF log evaluators) emit one JSON observation record per line; this
//! adapter parses them and drives the engine. Malformed lines and
//! out-of-order observations are counted and skipped — ordering is the
//! upstream producer's responsibility — while store-level failures abort
//! the feed.

use std::io::BufRead;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};
use vigil_core::{Observation, Transition, VigilError, ViolationEngine, ViolationStore};

#[derive(Debug, Default, Clone, Copy)]
pub struct FeedSummary {
    pub ingested: u64,
    pub transitions: u64,
    pub parse_errors: u64,
    pub rejected: u64,
}

pub struct ObservationFeed {
    engine: Arc<ViolationEngine>,
    registry: Option<Arc<dyn ViolationStore>>,
    lines_seen: AtomicU64,
}

impl ObservationFeed {
    pub fn new(engine: Arc<ViolationEngine>) -> Self {
        Self {
            engine,
            registry: None,
            lines_seen: AtomicU64::new(0),
        }
    }

    /// Consult the component registry: observations for components
    /// registered as inactive are dropped before the engine sees them.
    pub fn with_registry(mut self, store: Arc<dyn ViolationStore>) -> Self {
        self.registry = Some(store);
        self
    }

    pub fn lines_seen(&self) -> u64 {
        self.lines_seen.load(Ordering::Relaxed)
    }

    /// Feed a single JSONL record. `Ok(None)` when the line was skipped.
    pub fn ingest_line(&self, line: &str) -> anyhow::Result<Option<Transition>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        self.lines_seen.fetch_add(1, Ordering::Relaxed);

        let obs: Observation = match serde_json::from_str(line) {
            Ok(obs) => obs,
            Err(e) => {
                warn!(error = %e, "Skipping malformed observation line");
                return Err(e.into());
            }
        };

        if let Some(registry) = &self.registry {
            if let Some(component) = registry.component(obs.component_id)? {
                if !component.active {
                    debug!(
                        component_id = obs.component_id,
                        name = %component.name,
                        "Observation for paused component dropped"
                    );
                    return Ok(None);
                }
            }
        }

        match self.engine.ingest(&obs) {
            Ok(result) => Ok(Some(result.transition)),
            Err(err @ VigilError::InvalidObservation { .. }) => {
                error!(error = %err, "Observation rejected");
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Drain a reader of JSONL observation records.
    pub fn ingest_reader(&self, reader: impl BufRead) -> anyhow::Result<FeedSummary> {
        let mut summary = FeedSummary::default();
        for line in reader.lines() {
            let line = line?;
            match self.ingest_line(&line) {
                Ok(None) => {}
                Ok(Some(transition)) => {
                    summary.ingested += 1;
                    if transition != Transition::None {
                        summary.transitions += 1;
                    }
                }
                Err(e) => match e.downcast_ref::<VigilError>() {
                    Some(VigilError::InvalidObservation { .. }) => summary.rejected += 1,
                    Some(other) => {
                        return Err(anyhow::anyhow!("feed aborted: {other}"));
                    }
                    None => summary.parse_errors += 1,
                },
            }
        }
        Ok(summary)
    }
}
