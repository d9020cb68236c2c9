//! Violation engine — the per-observation tiered state machine.
//!
//! Consumes one observation at a time for a (component, protocol) pair,
//! updates the active-violation row, opens/closes violation events, and
//! recomputes the uptime tally. Transition rules:
//!
//! - Failure with nothing open → open Primary, count = 1.
//! - Failure with the same signature → count += 1, no new event.
//! - Failure with a different signature → close the open event, open a
//!   new one; a new incident, not a continuation.
//! - Success with anything open → close every open tier for the pair.
//! - Success with nothing open → no-op, no spurious close events.
//!
//! Observations per pair must arrive in non-decreasing timestamp order;
//! a strictly older timestamp is rejected with `InvalidObservation` and
//! leaves state untouched. A redelivery identical to the last processed
//! observation causes no transition and no counter bump, but its event
//! writes are re-applied idempotently, so `ingest` is safe to replay
//! after a transient store failure, including one that interrupted the
//! call partway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::alert::AlertSink;
use crate::error::{VigilError, VigilResult};
use crate::signature::{default_schemes, ReachabilityScheme, SignatureScheme};
use crate::store::ViolationStore;
use crate::types::{
    ActiveViolation, EngineResult, EscalationNotice, NoticeAction, Observation, Outcome, Protocol,
    Signature, Tier, Transition,
};
use crate::uptime::UptimeStats;

/// Bounded optimistic-retry budget before surfacing `EngineUnavailable`.
const MAX_CAS_ATTEMPTS: u32 = 4;

/// Event writes applied only after the versioned active-row write lands.
enum EventOp {
    OpenPrimary(Signature),
    /// Close open events; Primary only (reclassification) or every tier
    /// (recovery).
    Close { all_tiers: bool },
}

pub struct ViolationEngine {
    store: Arc<dyn ViolationStore>,
    schemes: HashMap<Protocol, Box<dyn SignatureScheme>>,
    sink: Option<Arc<dyn AlertSink>>,
    ingested: AtomicU64,
    rejected: AtomicU64,
    conflicts_retried: AtomicU64,
}

impl ViolationEngine {
    pub fn new(store: Arc<dyn ViolationStore>) -> Self {
        Self {
            store,
            schemes: default_schemes(),
            sink: None,
            ingested: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            conflicts_retried: AtomicU64::new(0),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace the signature adapter for one protocol.
    pub fn with_scheme(mut self, protocol: Protocol, scheme: Box<dyn SignatureScheme>) -> Self {
        self.schemes.insert(protocol, scheme);
        self
    }

    pub fn ingested(&self) -> u64 {
        self.ingested.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn conflicts_retried(&self) -> u64 {
        self.conflicts_retried.load(Ordering::Relaxed)
    }

    pub fn ingest(&self, obs: &Observation) -> VigilResult<EngineResult> {
        let pair = obs.pair();
        let signature = match self.schemes.get(&obs.protocol) {
            Some(scheme) => scheme.signature(obs),
            None => ReachabilityScheme.signature(obs),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut active = self
                .store
                .get_active(pair)?
                .unwrap_or_else(|| ActiveViolation::cleared(pair.0, pair.1));

            if let Some(last_seen) = active.last_observation_time {
                if obs.timestamp < last_seen {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(VigilError::InvalidObservation {
                        component_id: obs.component_id,
                        protocol: obs.protocol,
                        reason: format!(
                            "timestamp {} precedes last-seen {}",
                            obs.timestamp, last_seen
                        ),
                    });
                }
                if obs.timestamp == last_seen
                    && active.last_outcome == Some(obs.outcome)
                    && active.signature == signature
                {
                    // At-least-once redelivery of the observation we just
                    // processed. The active row already reflects it, but
                    // the first delivery may have died between the row
                    // write and the event writes; re-apply those instead
                    // of assuming they landed.
                    return self.reconcile_redelivery(obs, &active);
                }
            }

            let now = obs.timestamp;
            let mut notices = Vec::new();
            let mut ops = Vec::new();

            let transition = match (active.signature, signature) {
                (None, Some(sig)) => {
                    active.signature = Some(sig);
                    active.consecutive_failures = 1;
                    active.first_failure_time = Some(now);
                    active.last_transition_time = now;
                    ops.push(EventOp::OpenPrimary(sig));
                    Transition::Opened
                }
                (Some(current), Some(sig)) if current == sig => {
                    active.signature = Some(current);
                    active.consecutive_failures += 1;
                    notices.push(EscalationNotice {
                        component_id: pair.0,
                        protocol: pair.1,
                        tier: Tier::Primary,
                        signature: Some(sig),
                        action: NoticeAction::Persisted,
                        timestamp: now,
                    });
                    Transition::Persisted
                }
                (Some(_), Some(sig)) => {
                    // Different issue replacing the old one: new incident.
                    active.signature = Some(sig);
                    active.consecutive_failures = 1;
                    active.first_failure_time = Some(now);
                    active.last_transition_time = now;
                    ops.push(EventOp::Close { all_tiers: false });
                    ops.push(EventOp::OpenPrimary(sig));
                    Transition::Reclassified
                }
                (Some(_), None) => {
                    active.signature = None;
                    active.consecutive_failures = 0;
                    active.first_failure_time = None;
                    active.last_transition_time = now;
                    ops.push(EventOp::Close { all_tiers: true });
                    Transition::Closed
                }
                (None, None) => {
                    active.signature = None;
                    Transition::None
                }
            };

            active.last_observation_time = Some(now);
            active.last_outcome = Some(obs.outcome);

            match self.store.put_active(active) {
                Ok(_) => {}
                Err(VigilError::ConcurrentUpdateConflict { .. }) if attempt < MAX_CAS_ATTEMPTS => {
                    // Another writer touched the row; re-read and reapply.
                    self.conflicts_retried.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(VigilError::ConcurrentUpdateConflict { .. }) => {
                    return Err(VigilError::EngineUnavailable {
                        component_id: pair.0,
                        protocol: pair.1,
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e),
            }

            for op in ops {
                match op {
                    EventOp::OpenPrimary(sig) => {
                        self.store
                            .open_event_if_absent(pair, Tier::Primary, Some(sig), now)?;
                        notices.push(EscalationNotice {
                            component_id: pair.0,
                            protocol: pair.1,
                            tier: Tier::Primary,
                            signature: Some(sig),
                            action: NoticeAction::Opened,
                            timestamp: now,
                        });
                    }
                    EventOp::Close { all_tiers } => {
                        for event in self.store.open_events(pair)? {
                            if !all_tiers && event.tier != Tier::Primary {
                                continue;
                            }
                            self.store.close_event(event.id, now)?;
                            notices.push(EscalationNotice {
                                component_id: pair.0,
                                protocol: pair.1,
                                tier: event.tier,
                                signature: event.signature,
                                action: NoticeAction::Closed,
                                timestamp: now,
                            });
                        }
                    }
                }
            }

            self.store.record_observation(obs)?;
            let (success, total) = self.store.observation_counts(pair)?;

            if let Some(sink) = &self.sink {
                for notice in &notices {
                    sink.notify(notice);
                }
            }

            match transition {
                Transition::Opened | Transition::Closed | Transition::Reclassified => info!(
                    component_id = pair.0,
                    protocol = %pair.1,
                    transition = ?transition,
                    signature = ?signature,
                    "Violation transition"
                ),
                _ => debug!(
                    component_id = pair.0,
                    protocol = %pair.1,
                    transition = ?transition,
                    "Observation ingested"
                ),
            }

            self.ingested.fetch_add(1, Ordering::Relaxed);
            return Ok(EngineResult {
                component_id: pair.0,
                protocol: pair.1,
                transition,
                notices,
                uptime: UptimeStats::new(success, total),
            });
        }
    }

    /// Finish the event writes for an observation delivered more than
    /// once. `open_event_if_absent`, first-close-wins `close_event`, and
    /// the tally's last-observation guard all make this safe to repeat.
    fn reconcile_redelivery(
        &self,
        obs: &Observation,
        active: &ActiveViolation,
    ) -> VigilResult<EngineResult> {
        let pair = obs.pair();
        let stamp = active.last_transition_time;
        let mut notices = Vec::new();

        match active.signature {
            Some(sig) => {
                // A reclassified pair can still carry the superseded open
                // Primary event; close it before ensuring the current one.
                for event in self.store.open_events(pair)? {
                    if event.tier == Tier::Primary && event.signature != Some(sig) {
                        self.store.close_event(event.id, stamp)?;
                        notices.push(EscalationNotice {
                            component_id: pair.0,
                            protocol: pair.1,
                            tier: event.tier,
                            signature: event.signature,
                            action: NoticeAction::Closed,
                            timestamp: stamp,
                        });
                    }
                }
                let (_, created) =
                    self.store
                        .open_event_if_absent(pair, Tier::Primary, Some(sig), stamp)?;
                if created {
                    notices.push(EscalationNotice {
                        component_id: pair.0,
                        protocol: pair.1,
                        tier: Tier::Primary,
                        signature: Some(sig),
                        action: NoticeAction::Opened,
                        timestamp: stamp,
                    });
                }
            }
            None => {
                for event in self.store.open_events(pair)? {
                    self.store.close_event(event.id, stamp)?;
                    notices.push(EscalationNotice {
                        component_id: pair.0,
                        protocol: pair.1,
                        tier: event.tier,
                        signature: event.signature,
                        action: NoticeAction::Closed,
                        timestamp: stamp,
                    });
                }
            }
        }

        self.store.record_observation(obs)?;
        let (success, total) = self.store.observation_counts(pair)?;

        if let Some(sink) = &self.sink {
            for notice in &notices {
                sink.notify(notice);
            }
        }

        if notices.is_empty() {
            debug!(
                component_id = pair.0,
                protocol = %pair.1,
                timestamp = obs.timestamp,
                "Duplicate observation delivery ignored"
            );
        } else {
            info!(
                component_id = pair.0,
                protocol = %pair.1,
                repaired = notices.len(),
                "Duplicate delivery completed interrupted event writes"
            );
        }

        Ok(EngineResult {
            component_id: pair.0,
            protocol: pair.1,
            transition: Transition::None,
            notices,
            uptime: UptimeStats::new(success, total),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{CHECK_HSTS, CHECK_XSS_PROTECTION};
    use crate::store::MemoryStore;
    use crate::types::{Measurement, PairKey};

    const C: u64 = 1;

    fn obs(protocol: Protocol, ts: i64, outcome: Outcome) -> Observation {
        Observation {
            component_id: C,
            protocol,
            timestamp: ts,
            outcome,
            measurement: None,
        }
    }

    fn header_obs(ts: i64, outcome: Outcome, mask: u16) -> Observation {
        Observation {
            component_id: C,
            protocol: Protocol::HeaderSecurity,
            timestamp: ts,
            outcome,
            measurement: (outcome == Outcome::Failure).then_some(Measurement::FailedChecks(mask)),
        }
    }

    fn engine() -> (Arc<MemoryStore>, ViolationEngine) {
        let store = Arc::new(MemoryStore::new());
        let engine = ViolationEngine::new(store.clone());
        (store, engine)
    }

    #[test]
    fn failure_opens_primary() {
        let (store, engine) = engine();
        let result = engine.ingest(&obs(Protocol::Icmp, 100, Outcome::Failure)).unwrap();
        assert_eq!(result.transition, Transition::Opened);

        let pair: PairKey = (C, Protocol::Icmp);
        let active = store.get_active(pair).unwrap().unwrap();
        assert_eq!(active.signature, Some(Signature::Unreachable));
        assert_eq!(active.consecutive_failures, 1);
        assert_eq!(active.first_failure_time, Some(100));

        let open = store.open_events(pair).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].tier, Tier::Primary);
        assert_eq!(open[0].opened_at, 100);
    }

    #[test]
    fn same_signature_persists_without_new_event() {
        let (store, engine) = engine();
        let pair: PairKey = (C, Protocol::Icmp);
        engine.ingest(&obs(Protocol::Icmp, 100, Outcome::Failure)).unwrap();
        let mut counts = Vec::new();
        for ts in [160, 220, 280] {
            let result = engine.ingest(&obs(Protocol::Icmp, ts, Outcome::Failure)).unwrap();
            assert_eq!(result.transition, Transition::Persisted);
            counts.push(store.get_active(pair).unwrap().unwrap().consecutive_failures);
        }
        // Non-decreasing counter, and still exactly one open Primary event.
        assert_eq!(counts, vec![2, 3, 4]);
        assert_eq!(store.open_events(pair).unwrap().len(), 1);
        assert_eq!(store.events_for(pair).len(), 1);
    }

    #[test]
    fn two_incidents_back_to_back_and_forty_pct_uptime() {
        let (store, engine) = engine();
        let pair: PairKey = (C, Protocol::HeaderSecurity);
        let sig_a = CHECK_HSTS;
        let sig_b = CHECK_HSTS | CHECK_XSS_PROTECTION;

        engine.ingest(&header_obs(10, Outcome::Success, 0)).unwrap();
        let r2 = engine.ingest(&header_obs(20, Outcome::Failure, sig_a)).unwrap();
        assert_eq!(r2.transition, Transition::Opened);
        let r3 = engine.ingest(&header_obs(30, Outcome::Failure, sig_a)).unwrap();
        assert_eq!(r3.transition, Transition::Persisted);
        assert_eq!(store.get_active(pair).unwrap().unwrap().consecutive_failures, 2);

        let r4 = engine.ingest(&header_obs(40, Outcome::Failure, sig_b)).unwrap();
        assert_eq!(r4.transition, Transition::Reclassified);
        assert_eq!(store.get_active(pair).unwrap().unwrap().consecutive_failures, 1);
        assert_eq!(r4.notices[0].action, NoticeAction::Closed);
        assert_eq!(r4.notices[1].action, NoticeAction::Opened);

        let r5 = engine.ingest(&header_obs(50, Outcome::Success, 0)).unwrap();
        assert_eq!(r5.transition, Transition::Closed);

        let events = store.events_for(pair);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].signature, Some(Signature::FailedChecks(sig_a)));
        assert_eq!(events[0].closed_at, Some(40));
        assert_eq!(events[1].signature, Some(Signature::FailedChecks(sig_b)));
        assert_eq!(events[1].closed_at, Some(50));

        assert_eq!(r5.uptime.pct(), Some(40.0));
    }

    #[test]
    fn recovery_closes_every_open_tier() {
        let (store, engine) = engine();
        let pair: PairKey = (C, Protocol::Icmp);
        engine.ingest(&obs(Protocol::Icmp, 100, Outcome::Failure)).unwrap();
        // Scanner-owned tiers opened out-of-band.
        store.open_event_if_absent(pair, Tier::Extended, None, 150).unwrap();
        store.open_event_if_absent(pair, Tier::Additional, None, 160).unwrap();

        let result = engine.ingest(&obs(Protocol::Icmp, 200, Outcome::Success)).unwrap();
        assert_eq!(result.transition, Transition::Closed);
        assert!(store.open_events(pair).unwrap().is_empty());

        let closed_tiers: Vec<Tier> = result
            .notices
            .iter()
            .filter(|n| n.action == NoticeAction::Closed)
            .map(|n| n.tier)
            .collect();
        assert_eq!(closed_tiers.len(), 3);
        assert!(closed_tiers.contains(&Tier::Primary));
        assert!(closed_tiers.contains(&Tier::Extended));
        assert!(closed_tiers.contains(&Tier::Additional));
    }

    #[test]
    fn success_with_nothing_open_is_noop() {
        let (store, engine) = engine();
        let pair: PairKey = (C, Protocol::Http);
        let result = engine.ingest(&obs(Protocol::Http, 100, Outcome::Success)).unwrap();
        assert_eq!(result.transition, Transition::None);
        assert!(result.notices.is_empty());
        assert!(store.events_for(pair).is_empty());
        assert_eq!(result.uptime.pct(), Some(100.0));
    }

    #[test]
    fn out_of_order_observation_rejected_and_state_unchanged() {
        let (store, engine) = engine();
        let pair: PairKey = (C, Protocol::Icmp);
        engine.ingest(&obs(Protocol::Icmp, 100, Outcome::Failure)).unwrap();
        let before = store.get_active(pair).unwrap().unwrap();

        let err = engine.ingest(&obs(Protocol::Icmp, 90, Outcome::Success)).unwrap_err();
        assert!(matches!(err, VigilError::InvalidObservation { .. }));
        assert_eq!(engine.rejected(), 1);

        let after = store.get_active(pair).unwrap().unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(after.signature, before.signature);
        assert_eq!(store.observation_counts(pair).unwrap(), (0, 1));
    }

    #[test]
    fn duplicate_redelivery_changes_nothing() {
        let (store, engine) = engine();
        let pair: PairKey = (C, Protocol::Icmp);
        engine.ingest(&obs(Protocol::Icmp, 100, Outcome::Success)).unwrap();
        engine.ingest(&obs(Protocol::Icmp, 200, Outcome::Failure)).unwrap();

        let before_active = store.get_active(pair).unwrap().unwrap();
        let before_counts = store.observation_counts(pair).unwrap();

        let replay = engine.ingest(&obs(Protocol::Icmp, 200, Outcome::Failure)).unwrap();
        assert_eq!(replay.transition, Transition::None);

        let after_active = store.get_active(pair).unwrap().unwrap();
        assert_eq!(after_active.version, before_active.version);
        assert_eq!(after_active.consecutive_failures, before_active.consecutive_failures);
        assert_eq!(store.observation_counts(pair).unwrap(), before_counts);
        assert_eq!(store.events_for(pair).len(), 1);
    }

    #[test]
    fn uptime_follows_recorded_outcomes_not_signature_health() {
        let (store, engine) = engine();
        let pair: PairKey = (C, Protocol::Encryption);
        // Encrypted despite a failed probe: no violation opens, but the
        // failed observation still counts against uptime. The percentage
        // comes from the store tally alone; the active row carries no
        // counters of its own.
        let result = engine
            .ingest(&Observation {
                component_id: C,
                protocol: Protocol::Encryption,
                timestamp: 100,
                outcome: Outcome::Failure,
                measurement: Some(Measurement::Encrypted(true)),
            })
            .unwrap();
        assert_eq!(result.transition, Transition::None);
        assert!(store.get_active(pair).unwrap().unwrap().signature.is_none());
        assert_eq!(store.observation_counts(pair).unwrap(), (0, 1));
        assert_eq!(result.uptime.pct(), Some(0.0));
    }

    #[test]
    fn equal_timestamp_with_new_content_is_processed() {
        let (store, engine) = engine();
        let pair: PairKey = (C, Protocol::Icmp);
        engine.ingest(&obs(Protocol::Icmp, 100, Outcome::Failure)).unwrap();
        // Coarse clocks may stamp the recovery with the same second.
        let result = engine.ingest(&obs(Protocol::Icmp, 100, Outcome::Success)).unwrap();
        assert_eq!(result.transition, Transition::Closed);
        assert!(store.open_events(pair).unwrap().is_empty());
    }

    // Store wrapper that injects CAS conflicts for retry testing.
    struct ConflictingStore {
        inner: MemoryStore,
        conflicts_left: AtomicU64,
    }

    impl ConflictingStore {
        fn new(conflicts: u64) -> Self {
            Self {
                inner: MemoryStore::new(),
                conflicts_left: AtomicU64::new(conflicts),
            }
        }
    }

    impl ViolationStore for ConflictingStore {
        fn get_active(&self, pair: PairKey) -> VigilResult<Option<ActiveViolation>> {
            self.inner.get_active(pair)
        }
        fn put_active(&self, row: ActiveViolation) -> VigilResult<u64> {
            if self.conflicts_left.load(Ordering::Relaxed) > 0 {
                self.conflicts_left.fetch_sub(1, Ordering::Relaxed);
                return Err(VigilError::ConcurrentUpdateConflict {
                    component_id: row.component_id,
                    protocol: row.protocol,
                    expected: row.version,
                    found: row.version + 1,
                });
            }
            self.inner.put_active(row)
        }
        fn actives(&self) -> VigilResult<Vec<ActiveViolation>> {
            self.inner.actives()
        }
        fn append_event(&self, event: crate::types::ViolationEvent) -> VigilResult<u64> {
            self.inner.append_event(event)
        }
        fn open_event_if_absent(
            &self,
            pair: PairKey,
            tier: Tier,
            signature: Option<Signature>,
            opened_at: i64,
        ) -> VigilResult<(u64, bool)> {
            self.inner.open_event_if_absent(pair, tier, signature, opened_at)
        }
        fn close_event(&self, id: u64, closed_at: i64) -> VigilResult<()> {
            self.inner.close_event(id, closed_at)
        }
        fn open_events(&self, pair: PairKey) -> VigilResult<Vec<crate::types::ViolationEvent>> {
            self.inner.open_events(pair)
        }
        fn events_in_window(
            &self,
            pair: PairKey,
            tier: Tier,
            since: i64,
        ) -> VigilResult<Vec<crate::types::ViolationEvent>> {
            self.inner.events_in_window(pair, tier, since)
        }
        fn record_observation(&self, o: &Observation) -> VigilResult<()> {
            self.inner.record_observation(o)
        }
        fn observation_counts(&self, pair: PairKey) -> VigilResult<(u64, u64)> {
            self.inner.observation_counts(pair)
        }
        fn register_component(&self, c: crate::types::Component) -> VigilResult<()> {
            self.inner.register_component(c)
        }
        fn set_component_active(&self, id: u64, active: bool) -> VigilResult<()> {
            self.inner.set_component_active(id, active)
        }
        fn component(&self, id: u64) -> VigilResult<Option<crate::types::Component>> {
            self.inner.component(id)
        }
        fn components(&self) -> VigilResult<Vec<crate::types::Component>> {
            self.inner.components()
        }
        fn integrity_check(&self) -> VigilResult<Vec<VigilError>> {
            self.inner.integrity_check()
        }
    }

    #[test]
    fn transient_conflicts_are_retried() {
        let store = Arc::new(ConflictingStore::new(2));
        let engine = ViolationEngine::new(store.clone());
        let result = engine.ingest(&obs(Protocol::Icmp, 100, Outcome::Failure)).unwrap();
        assert_eq!(result.transition, Transition::Opened);
        assert_eq!(engine.conflicts_retried(), 2);
    }

    #[test]
    fn persistent_conflicts_surface_engine_unavailable() {
        let store = Arc::new(ConflictingStore::new(u64::MAX));
        let engine = ViolationEngine::new(store);
        let err = engine.ingest(&obs(Protocol::Icmp, 100, Outcome::Failure)).unwrap_err();
        assert!(matches!(err, VigilError::EngineUnavailable { attempts: 4, .. }));
    }

    // Store wrapper whose event writes fail, for replay testing.
    struct FlakyEventStore {
        inner: MemoryStore,
        failures_left: AtomicU64,
    }

    impl FlakyEventStore {
        fn new(failures: u64) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures_left: AtomicU64::new(failures),
            }
        }
    }

    impl ViolationStore for FlakyEventStore {
        fn get_active(&self, pair: PairKey) -> VigilResult<Option<ActiveViolation>> {
            self.inner.get_active(pair)
        }
        fn put_active(&self, row: ActiveViolation) -> VigilResult<u64> {
            self.inner.put_active(row)
        }
        fn actives(&self) -> VigilResult<Vec<ActiveViolation>> {
            self.inner.actives()
        }
        fn append_event(&self, event: crate::types::ViolationEvent) -> VigilResult<u64> {
            self.inner.append_event(event)
        }
        fn open_event_if_absent(
            &self,
            pair: PairKey,
            tier: Tier,
            signature: Option<Signature>,
            opened_at: i64,
        ) -> VigilResult<(u64, bool)> {
            if self.failures_left.load(Ordering::Relaxed) > 0 {
                self.failures_left.fetch_sub(1, Ordering::Relaxed);
                return Err(VigilError::StoreUnavailable("event insert timed out".into()));
            }
            self.inner.open_event_if_absent(pair, tier, signature, opened_at)
        }
        fn close_event(&self, id: u64, closed_at: i64) -> VigilResult<()> {
            self.inner.close_event(id, closed_at)
        }
        fn open_events(&self, pair: PairKey) -> VigilResult<Vec<crate::types::ViolationEvent>> {
            self.inner.open_events(pair)
        }
        fn events_in_window(
            &self,
            pair: PairKey,
            tier: Tier,
            since: i64,
        ) -> VigilResult<Vec<crate::types::ViolationEvent>> {
            self.inner.events_in_window(pair, tier, since)
        }
        fn record_observation(&self, o: &Observation) -> VigilResult<()> {
            self.inner.record_observation(o)
        }
        fn observation_counts(&self, pair: PairKey) -> VigilResult<(u64, u64)> {
            self.inner.observation_counts(pair)
        }
        fn register_component(&self, c: crate::types::Component) -> VigilResult<()> {
            self.inner.register_component(c)
        }
        fn set_component_active(&self, id: u64, active: bool) -> VigilResult<()> {
            self.inner.set_component_active(id, active)
        }
        fn component(&self, id: u64) -> VigilResult<Option<crate::types::Component>> {
            self.inner.component(id)
        }
        fn components(&self) -> VigilResult<Vec<crate::types::Component>> {
            self.inner.components()
        }
        fn integrity_check(&self) -> VigilResult<Vec<VigilError>> {
            self.inner.integrity_check()
        }
    }

    #[test]
    fn replay_after_failed_event_write_repairs_the_open() {
        let store = Arc::new(FlakyEventStore::new(1));
        let engine = ViolationEngine::new(store.clone());
        let pair: PairKey = (C, Protocol::Icmp);

        // First delivery dies after the active-row write.
        let err = engine.ingest(&obs(Protocol::Icmp, 100, Outcome::Failure)).unwrap_err();
        assert!(matches!(err, VigilError::StoreUnavailable(_)));
        let active = store.get_active(pair).unwrap().unwrap();
        assert_eq!(active.signature, Some(Signature::Unreachable));
        assert!(store.open_events(pair).unwrap().is_empty());
        assert_eq!(store.observation_counts(pair).unwrap(), (0, 0));

        // The caller replays the same observation; the event and tally
        // land and the missed Opened notice is surfaced.
        let replay = engine.ingest(&obs(Protocol::Icmp, 100, Outcome::Failure)).unwrap();
        assert_eq!(replay.transition, Transition::None);
        assert_eq!(replay.notices.len(), 1);
        assert_eq!(replay.notices[0].action, NoticeAction::Opened);
        assert_eq!(replay.notices[0].tier, Tier::Primary);

        let open = store.open_events(pair).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].opened_at, 100);
        assert_eq!(store.observation_counts(pair).unwrap(), (0, 1));

        // A further replay settles into a plain duplicate.
        let again = engine.ingest(&obs(Protocol::Icmp, 100, Outcome::Failure)).unwrap();
        assert_eq!(again.transition, Transition::None);
        assert!(again.notices.is_empty());
        assert_eq!(store.observation_counts(pair).unwrap(), (0, 1));
        assert_eq!(store.inner.events_for(pair).len(), 1);
    }
}
