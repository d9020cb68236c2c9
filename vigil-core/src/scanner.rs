//! Escalation scanner — periodic batch detection of multi-event patterns.
//!
//! The per-observation engine cannot cheaply see patterns spanning many
//! past events, so two timer-driven scans walk the violation history:
//!
//! - **Short-window scan**: opens an Extended violation when the count
//!   of Primary events opened inside the trailing window exceeds the
//!   threshold, and closes it once the windowed count falls back under.
//! - **Long-window scan**: opens an Additional violation when cumulative
//!   downtime — the summed gaps between consecutive Primary opened_at
//!   stamps inside the window — exceeds the duration threshold.
//!
//! Both scans only read Primary rows and write Extended/Additional rows,
//! so their write set is disjoint from the engine's. Re-running a pass
//! never duplicates an open event: inserts go through the store's
//! `open_event_if_absent`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::alert::AlertSink;
use crate::error::VigilResult;
use crate::store::ViolationStore;
use crate::types::{EscalationNotice, NoticeAction, PairKey, Protocol, Tier};

/// Per-protocol escalation thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EscalationPolicy {
    /// Extended opens when the windowed Primary count strictly exceeds this.
    pub extended_count_threshold: u32,
    /// Additional opens when windowed cumulative downtime exceeds this.
    pub additional_downtime_threshold_secs: i64,
    pub short_window_secs: i64,
    pub long_window_secs: i64,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            extended_count_threshold: 3,
            additional_downtime_threshold_secs: 300,
            short_window_secs: 3_600,
            long_window_secs: 86_400,
        }
    }
}

/// Outcome of one scan pass, for logging and stats.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScanReport {
    pub tier: Tier,
    pub pairs_scanned: usize,
    pub opened: u64,
    pub closed: u64,
    pub notices: Vec<EscalationNotice>,
}

pub struct EscalationScanner {
    store: Arc<dyn ViolationStore>,
    default_policy: EscalationPolicy,
    per_protocol: HashMap<Protocol, EscalationPolicy>,
    sink: Option<Arc<dyn AlertSink>>,
    scans_completed: AtomicU64,
    events_opened: AtomicU64,
    events_closed: AtomicU64,
}

impl EscalationScanner {
    pub fn new(store: Arc<dyn ViolationStore>) -> Self {
        Self {
            store,
            default_policy: EscalationPolicy::default(),
            per_protocol: HashMap::new(),
            sink: None,
            scans_completed: AtomicU64::new(0),
            events_opened: AtomicU64::new(0),
            events_closed: AtomicU64::new(0),
        }
    }

    pub fn with_default_policy(mut self, policy: EscalationPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_protocol_policy(mut self, protocol: Protocol, policy: EscalationPolicy) -> Self {
        self.per_protocol.insert(protocol, policy);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn policy_for(&self, protocol: Protocol) -> EscalationPolicy {
        self.per_protocol
            .get(&protocol)
            .copied()
            .unwrap_or(self.default_policy)
    }

    pub fn scans_completed(&self) -> u64 {
        self.scans_completed.load(Ordering::Relaxed)
    }

    pub fn events_opened(&self) -> u64 {
        self.events_opened.load(Ordering::Relaxed)
    }

    pub fn events_closed(&self) -> u64 {
        self.events_closed.load(Ordering::Relaxed)
    }

    /// Count Primary events opened in the trailing short window per pair;
    /// open or close Extended violations accordingly.
    pub fn short_window_scan(&self, now: i64) -> VigilResult<ScanReport> {
        let mut report = ScanReport {
            tier: Tier::Extended,
            pairs_scanned: 0,
            opened: 0,
            closed: 0,
            notices: Vec::new(),
        };

        for active in self.store.actives()? {
            let pair = active.pair();
            let policy = self.policy_for(pair.1);
            let since = now - policy.short_window_secs;
            report.pairs_scanned += 1;

            let count = self
                .store
                .events_in_window(pair, Tier::Primary, since)?
                .len() as u32;
            let open_extended = self
                .store
                .open_events(pair)?
                .into_iter()
                .find(|e| e.tier == Tier::Extended);

            if count > policy.extended_count_threshold {
                let (_, created) =
                    self.store
                        .open_event_if_absent(pair, Tier::Extended, None, now)?;
                if created {
                    warn!(
                        component_id = pair.0,
                        protocol = %pair.1,
                        primary_count = count,
                        window_secs = policy.short_window_secs,
                        "Extended violation opened"
                    );
                    report.opened += 1;
                    self.push_notice(&mut report, pair, Tier::Extended, NoticeAction::Opened, now);
                }
            } else if let Some(event) = open_extended {
                // Windowed count recovered; the sustained condition ended.
                self.store.close_event(event.id, now)?;
                info!(
                    component_id = pair.0,
                    protocol = %pair.1,
                    primary_count = count,
                    "Extended violation closed"
                );
                report.closed += 1;
                self.push_notice(&mut report, pair, Tier::Extended, NoticeAction::Closed, now);
            }
        }

        self.finish_scan(&report);
        Ok(report)
    }

    /// Sum downtime gaps between consecutive Primary events in the long
    /// window per pair; open Additional violations for sustained outages.
    pub fn long_window_scan(&self, now: i64) -> VigilResult<ScanReport> {
        let mut report = ScanReport {
            tier: Tier::Additional,
            pairs_scanned: 0,
            opened: 0,
            closed: 0,
            notices: Vec::new(),
        };

        for active in self.store.actives()? {
            let pair = active.pair();
            let policy = self.policy_for(pair.1);
            let since = now - policy.long_window_secs;
            report.pairs_scanned += 1;

            let mut events = self.store.events_in_window(pair, Tier::Primary, since)?;
            events.sort_by_key(|e| e.opened_at);
            let downtime: i64 = events
                .windows(2)
                .map(|w| w[1].opened_at - w[0].opened_at)
                .sum();

            if downtime > policy.additional_downtime_threshold_secs {
                let (_, created) =
                    self.store
                        .open_event_if_absent(pair, Tier::Additional, None, now)?;
                if created {
                    warn!(
                        component_id = pair.0,
                        protocol = %pair.1,
                        downtime_secs = downtime,
                        window_secs = policy.long_window_secs,
                        "Additional violation opened"
                    );
                    report.opened += 1;
                    self.push_notice(&mut report, pair, Tier::Additional, NoticeAction::Opened, now);
                }
            } else {
                debug!(
                    component_id = pair.0,
                    protocol = %pair.1,
                    downtime_secs = downtime,
                    "Cumulative downtime under threshold"
                );
            }
        }

        self.finish_scan(&report);
        Ok(report)
    }

    fn push_notice(
        &self,
        report: &mut ScanReport,
        pair: PairKey,
        tier: Tier,
        action: NoticeAction,
        now: i64,
    ) {
        let notice = EscalationNotice {
            component_id: pair.0,
            protocol: pair.1,
            tier,
            signature: None,
            action,
            timestamp: now,
        };
        if let Some(sink) = &self.sink {
            sink.notify(&notice);
        }
        report.notices.push(notice);
    }

    fn finish_scan(&self, report: &ScanReport) {
        self.scans_completed.fetch_add(1, Ordering::Relaxed);
        self.events_opened.fetch_add(report.opened, Ordering::Relaxed);
        self.events_closed.fetch_add(report.closed, Ordering::Relaxed);
        debug!(
            tier = %report.tier,
            pairs = report.pairs_scanned,
            opened = report.opened,
            closed = report.closed,
            "Escalation scan pass complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{ActiveViolation, Signature, ViolationEvent};

    const PAIR: PairKey = (1, Protocol::Icmp);

    fn seed_pair(store: &MemoryStore, pair: PairKey) {
        store
            .put_active(ActiveViolation::cleared(pair.0, pair.1))
            .unwrap();
    }

    fn primary_event(pair: PairKey, opened_at: i64, closed_at: Option<i64>) -> ViolationEvent {
        ViolationEvent {
            id: 0,
            component_id: pair.0,
            protocol: pair.1,
            tier: Tier::Primary,
            signature: Some(Signature::Unreachable),
            opened_at,
            closed_at,
        }
    }

    fn scanner(store: Arc<MemoryStore>) -> EscalationScanner {
        EscalationScanner::new(store)
    }

    #[test]
    fn four_primaries_in_window_open_one_extended() {
        let store = Arc::new(MemoryStore::new());
        seed_pair(&store, PAIR);
        let now = 10_000;
        for opened in [7_000, 7_600, 8_200, 9_000] {
            store
                .append_event(primary_event(PAIR, opened, Some(opened + 30)))
                .unwrap();
        }

        let scanner = scanner(store.clone());
        let report = scanner.short_window_scan(now).unwrap();
        assert_eq!(report.opened, 1);

        // A second pass with the count still over threshold must not
        // create a second open Extended event.
        let report2 = scanner.short_window_scan(now + 60).unwrap();
        assert_eq!(report2.opened, 0);
        let open: Vec<_> = store
            .open_events(PAIR)
            .unwrap()
            .into_iter()
            .filter(|e| e.tier == Tier::Extended)
            .collect();
        assert_eq!(open.len(), 1);
    }

    #[test]
    fn threshold_is_strictly_exceeds() {
        let store = Arc::new(MemoryStore::new());
        seed_pair(&store, PAIR);
        for opened in [7_000, 8_000, 9_000] {
            store
                .append_event(primary_event(PAIR, opened, Some(opened + 30)))
                .unwrap();
        }
        let report = scanner(store).short_window_scan(10_000).unwrap();
        assert_eq!(report.opened, 0);
    }

    #[test]
    fn extended_closes_when_count_drops_out_of_window() {
        let store = Arc::new(MemoryStore::new());
        seed_pair(&store, PAIR);
        for opened in [7_000, 7_600, 8_200, 9_000] {
            store
                .append_event(primary_event(PAIR, opened, Some(opened + 30)))
                .unwrap();
        }
        let scanner = scanner(store.clone());
        scanner.short_window_scan(10_000).unwrap();

        // An hour later the old Primary events have left the window.
        let report = scanner.short_window_scan(13_700).unwrap();
        assert_eq!(report.closed, 1);
        assert!(store
            .open_events(PAIR)
            .unwrap()
            .iter()
            .all(|e| e.tier != Tier::Extended));
        assert_eq!(report.notices[0].action, NoticeAction::Closed);
    }

    #[test]
    fn cumulative_downtime_opens_additional_once() {
        let store = Arc::new(MemoryStore::new());
        seed_pair(&store, PAIR);
        // Gaps: 200 + 200 = 400s of accumulated downtime, over the 300s default.
        for opened in [1_000, 1_200, 1_400] {
            store
                .append_event(primary_event(PAIR, opened, Some(opened + 30)))
                .unwrap();
        }
        let scanner = scanner(store.clone());
        let report = scanner.long_window_scan(2_000).unwrap();
        assert_eq!(report.opened, 1);
        assert_eq!(report.notices[0].tier, Tier::Additional);

        let replay = scanner.long_window_scan(2_060).unwrap();
        assert_eq!(replay.opened, 0);
    }

    #[test]
    fn downtime_under_threshold_opens_nothing() {
        let store = Arc::new(MemoryStore::new());
        seed_pair(&store, PAIR);
        for opened in [1_000, 1_100, 1_200] {
            store
                .append_event(primary_event(PAIR, opened, Some(opened + 10)))
                .unwrap();
        }
        let report = scanner(store).long_window_scan(2_000).unwrap();
        assert_eq!(report.opened, 0);
    }

    #[test]
    fn per_protocol_policy_overrides_default() {
        let store = Arc::new(MemoryStore::new());
        let waf_pair: PairKey = (2, Protocol::Waf);
        seed_pair(&store, waf_pair);
        store
            .append_event(ViolationEvent {
                id: 0,
                component_id: waf_pair.0,
                protocol: waf_pair.1,
                tier: Tier::Primary,
                signature: Some(Signature::DetectionMiss),
                opened_at: 9_500,
                closed_at: None,
            })
            .unwrap();
        store
            .append_event(ViolationEvent {
                id: 0,
                component_id: waf_pair.0,
                protocol: waf_pair.1,
                tier: Tier::Primary,
                signature: Some(Signature::DetectionMiss),
                opened_at: 9_800,
                closed_at: None,
            })
            .unwrap();

        let scanner = scanner(store).with_protocol_policy(
            Protocol::Waf,
            EscalationPolicy {
                extended_count_threshold: 1,
                ..EscalationPolicy::default()
            },
        );
        let report = scanner.short_window_scan(10_000).unwrap();
        assert_eq!(report.opened, 1);
    }

    #[test]
    fn scans_ignore_events_outside_window() {
        let store = Arc::new(MemoryStore::new());
        seed_pair(&store, PAIR);
        // Plenty of events, all long before the window starts.
        for opened in [100, 200, 300, 400, 500] {
            store
                .append_event(primary_event(PAIR, opened, Some(opened + 10)))
                .unwrap();
        }
        let scanner = scanner(store);
        assert_eq!(scanner.short_window_scan(100_000).unwrap().opened, 0);
        assert_eq!(scanner.long_window_scan(1_000_000).unwrap().opened, 0);
    }
}
