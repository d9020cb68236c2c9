//! Uptime/SLO aggregation over recorded observation history.

use crate::error::VigilResult;
use crate::store::ViolationStore;
use crate::types::{PairKey, Protocol};

/// Running success tally for one (component, protocol) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UptimeStats {
    pub success: u64,
    pub total: u64,
}

impl UptimeStats {
    pub fn new(success: u64, total: u64) -> Self {
        Self { success, total }
    }

    /// Uptime percentage over all recorded history, `None` when no
    /// observations exist for the pair.
    pub fn pct(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.success as f64 / self.total as f64 * 100.0)
        }
    }
}

/// Read-only uptime lookup for the reporting collaborator.
pub fn uptime(store: &dyn ViolationStore, pair: PairKey) -> VigilResult<UptimeStats> {
    let (success, total) = store.observation_counts(pair)?;
    Ok(UptimeStats::new(success, total))
}

/// One row of the SLO summary.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PairUptime {
    pub component_id: u64,
    pub protocol: Protocol,
    pub stats: UptimeStats,
    pub open_violation: bool,
}

/// Uptime across every pair the store has seen, for reporting.
pub fn uptime_report(store: &dyn ViolationStore) -> VigilResult<Vec<PairUptime>> {
    let mut rows = Vec::new();
    for active in store.actives()? {
        let stats = uptime(store, active.pair())?;
        rows.push(PairUptime {
            component_id: active.component_id,
            protocol: active.protocol,
            stats,
            open_violation: active.is_open(),
        });
    }
    rows.sort_by_key(|r| (r.component_id, r.protocol));
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{ActiveViolation, Observation, Outcome};

    #[test]
    fn zero_observations_is_no_data() {
        let stats = UptimeStats::new(0, 0);
        assert_eq!(stats.pct(), None);
    }

    #[test]
    fn pct_matches_tally() {
        let stats = UptimeStats::new(2, 5);
        assert_eq!(stats.pct(), Some(40.0));
        let perfect = UptimeStats::new(10, 10);
        assert_eq!(perfect.pct(), Some(100.0));
    }

    #[test]
    fn report_covers_all_known_pairs() {
        let store = MemoryStore::new();
        for protocol in [Protocol::Icmp, Protocol::Http] {
            store
                .put_active(ActiveViolation::cleared(1, protocol))
                .unwrap();
            store
                .record_observation(&Observation {
                    component_id: 1,
                    protocol,
                    timestamp: 10,
                    outcome: Outcome::Success,
                    measurement: None,
                })
                .unwrap();
        }
        let report = uptime_report(&store).unwrap();
        assert_eq!(report.len(), 2);
        assert!(report.iter().all(|r| r.stats.pct() == Some(100.0)));
        assert!(report.iter().all(|r| !r.open_violation));
    }
}
