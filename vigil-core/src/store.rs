//! Violation store — durable keyed state behind the engine and scanner.
//!
//! One active-violation row per (component, protocol), an append-only
//! violation event history, and observation tallies for uptime. Writes
//! to a single active row are serialized by compare-and-swap on its
//! version; lost updates surface as `ConcurrentUpdateConflict` instead
//! of silently winning. `open_event_if_absent` carries the idempotence
//! contract the scanner and engine both rely on: re-running a pass never
//! creates a second open event for the same (component, protocol, tier).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{VigilError, VigilResult};
use crate::types::{
    ActiveViolation, Component, EventId, Observation, Outcome, PairKey, Protocol, Signature, Tier,
    ViolationEvent,
};

/// Cap on retained raw observations; tallies are cumulative regardless.
const MAX_OBSERVATION_HISTORY: usize = 10_000;

/// Store operations the engine and scanner are written against.
pub trait ViolationStore: Send + Sync {
    fn get_active(&self, pair: PairKey) -> VigilResult<Option<ActiveViolation>>;

    /// Compare-and-swap write: accepted only if `row.version` matches the
    /// stored version (0 for a row that does not exist yet). The store
    /// bumps the version on success.
    fn put_active(&self, row: ActiveViolation) -> VigilResult<u64>;

    /// All active-violation rows ever created, cleared or not.
    fn actives(&self) -> VigilResult<Vec<ActiveViolation>>;

    fn append_event(&self, event: ViolationEvent) -> VigilResult<EventId>;

    /// Open an event for (pair, tier) unless one is already open.
    /// Returns the event id and whether a new row was created.
    fn open_event_if_absent(
        &self,
        pair: PairKey,
        tier: Tier,
        signature: Option<Signature>,
        opened_at: i64,
    ) -> VigilResult<(EventId, bool)>;

    fn close_event(&self, id: EventId, closed_at: i64) -> VigilResult<()>;

    fn open_events(&self, pair: PairKey) -> VigilResult<Vec<ViolationEvent>>;

    /// Events of `tier` for `pair` opened at or after `since`.
    fn events_in_window(
        &self,
        pair: PairKey,
        tier: Tier,
        since: i64,
    ) -> VigilResult<Vec<ViolationEvent>>;

    /// Record an observation for uptime counting. Re-recording the
    /// observation recorded last for its pair is a no-op, so replays
    /// after a partial failure cannot double-count the tally.
    fn record_observation(&self, obs: &Observation) -> VigilResult<()>;

    /// (success_count, total_count) over all recorded history for the pair.
    fn observation_counts(&self, pair: PairKey) -> VigilResult<(u64, u64)>;

    // Component registry.
    fn register_component(&self, component: Component) -> VigilResult<()>;
    fn set_component_active(&self, id: u64, active: bool) -> VigilResult<()>;
    fn component(&self, id: u64) -> VigilResult<Option<Component>>;
    fn components(&self) -> VigilResult<Vec<Component>>;

    /// Surface open events with no matching open active row. Persistent
    /// inconsistency is reported, never auto-healed by guessing.
    fn integrity_check(&self) -> VigilResult<Vec<VigilError>>;
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
struct StoreState {
    components: Vec<Component>,
    actives: Vec<ActiveViolation>,
    events: Vec<ViolationEvent>,
    next_event_id: EventId,
    /// (component_id, protocol, success_count, total_count)
    tallies: Vec<(u64, Protocol, u64, u64)>,
    observations: VecDeque<Observation>,
}

/// In-process store. The relational backend of the production deployment
/// sits behind the same trait; this one backs tests, single-node runs,
/// and snapshot persistence.
pub struct MemoryStore {
    state: RwLock<StoreState>,
    events_appended: AtomicU64,
    conflicts_detected: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState {
                next_event_id: 1,
                ..StoreState::default()
            }),
            events_appended: AtomicU64::new(0),
            conflicts_detected: AtomicU64::new(0),
        }
    }

    pub fn events_appended(&self) -> u64 {
        self.events_appended.load(Ordering::Relaxed)
    }

    pub fn conflicts_detected(&self) -> u64 {
        self.conflicts_detected.load(Ordering::Relaxed)
    }

    /// Full event history for a pair, oldest first. Test and report helper.
    pub fn events_for(&self, pair: PairKey) -> Vec<ViolationEvent> {
        self.state
            .read()
            .events
            .iter()
            .filter(|e| e.pair() == pair)
            .cloned()
            .collect()
    }

    pub fn event(&self, id: EventId) -> Option<ViolationEvent> {
        self.state.read().events.iter().find(|e| e.id == id).cloned()
    }
}

impl ViolationStore for MemoryStore {
    fn get_active(&self, pair: PairKey) -> VigilResult<Option<ActiveViolation>> {
        Ok(self
            .state
            .read()
            .actives
            .iter()
            .find(|a| a.pair() == pair)
            .cloned())
    }

    fn put_active(&self, mut row: ActiveViolation) -> VigilResult<u64> {
        let mut st = self.state.write();
        let current = st
            .actives
            .iter()
            .position(|a| a.pair() == row.pair());
        let stored_version = current.map(|i| st.actives[i].version).unwrap_or(0);
        if row.version != stored_version {
            self.conflicts_detected.fetch_add(1, Ordering::Relaxed);
            return Err(VigilError::ConcurrentUpdateConflict {
                component_id: row.component_id,
                protocol: row.protocol,
                expected: row.version,
                found: stored_version,
            });
        }
        row.version += 1;
        let version = row.version;
        match current {
            Some(i) => st.actives[i] = row,
            None => st.actives.push(row),
        }
        Ok(version)
    }

    fn actives(&self) -> VigilResult<Vec<ActiveViolation>> {
        Ok(self.state.read().actives.clone())
    }

    fn append_event(&self, mut event: ViolationEvent) -> VigilResult<EventId> {
        let mut st = self.state.write();
        event.id = st.next_event_id;
        st.next_event_id += 1;
        let id = event.id;
        st.events.push(event);
        self.events_appended.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    fn open_event_if_absent(
        &self,
        pair: PairKey,
        tier: Tier,
        signature: Option<Signature>,
        opened_at: i64,
    ) -> VigilResult<(EventId, bool)> {
        let mut st = self.state.write();
        if let Some(existing) = st
            .events
            .iter()
            .find(|e| e.pair() == pair && e.tier == tier && e.is_open())
        {
            return Ok((existing.id, false));
        }
        let id = st.next_event_id;
        st.next_event_id += 1;
        st.events.push(ViolationEvent {
            id,
            component_id: pair.0,
            protocol: pair.1,
            tier,
            signature,
            opened_at,
            closed_at: None,
        });
        self.events_appended.fetch_add(1, Ordering::Relaxed);
        Ok((id, true))
    }

    fn close_event(&self, id: EventId, closed_at: i64) -> VigilResult<()> {
        let mut st = self.state.write();
        let event = st
            .events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(VigilError::UnknownEvent(id))?;
        // Closing twice is a no-op; the first close wins.
        if event.closed_at.is_none() {
            event.closed_at = Some(closed_at);
        }
        Ok(())
    }

    fn open_events(&self, pair: PairKey) -> VigilResult<Vec<ViolationEvent>> {
        Ok(self
            .state
            .read()
            .events
            .iter()
            .filter(|e| e.pair() == pair && e.is_open())
            .cloned()
            .collect())
    }

    fn events_in_window(
        &self,
        pair: PairKey,
        tier: Tier,
        since: i64,
    ) -> VigilResult<Vec<ViolationEvent>> {
        Ok(self
            .state
            .read()
            .events
            .iter()
            .filter(|e| e.pair() == pair && e.tier == tier && e.opened_at >= since)
            .cloned()
            .collect())
    }

    fn record_observation(&self, obs: &Observation) -> VigilResult<()> {
        let mut st = self.state.write();
        let pair = obs.pair();
        let already_recorded = st
            .observations
            .iter()
            .rev()
            .find(|o| o.pair() == pair)
            .is_some_and(|last| last == obs);
        if already_recorded {
            return Ok(());
        }
        match st
            .tallies
            .iter_mut()
            .find(|(id, p, _, _)| (*id, *p) == pair)
        {
            Some(entry) => {
                if obs.outcome == Outcome::Success {
                    entry.2 += 1;
                }
                entry.3 += 1;
            }
            None => {
                let success = u64::from(obs.outcome == Outcome::Success);
                st.tallies.push((pair.0, pair.1, success, 1));
            }
        }
        if st.observations.len() >= MAX_OBSERVATION_HISTORY {
            st.observations.pop_front();
        }
        st.observations.push_back(obs.clone());
        Ok(())
    }

    fn observation_counts(&self, pair: PairKey) -> VigilResult<(u64, u64)> {
        Ok(self
            .state
            .read()
            .tallies
            .iter()
            .find(|(id, p, _, _)| (*id, *p) == pair)
            .map(|(_, _, s, t)| (*s, *t))
            .unwrap_or((0, 0)))
    }

    fn register_component(&self, component: Component) -> VigilResult<()> {
        let mut st = self.state.write();
        match st.components.iter_mut().find(|c| c.id == component.id) {
            Some(existing) => *existing = component,
            None => st.components.push(component),
        }
        Ok(())
    }

    fn set_component_active(&self, id: u64, active: bool) -> VigilResult<()> {
        let mut st = self.state.write();
        if let Some(c) = st.components.iter_mut().find(|c| c.id == id) {
            c.active = active;
        }
        Ok(())
    }

    fn component(&self, id: u64) -> VigilResult<Option<Component>> {
        Ok(self
            .state
            .read()
            .components
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    fn components(&self) -> VigilResult<Vec<Component>> {
        Ok(self.state.read().components.clone())
    }

    fn integrity_check(&self) -> VigilResult<Vec<VigilError>> {
        let st = self.state.read();
        let mut findings = Vec::new();
        for event in st.events.iter().filter(|e| e.is_open()) {
            let matched = st.actives.iter().any(|a| a.pair() == event.pair());
            if !matched {
                warn!(
                    event_id = event.id,
                    component_id = event.component_id,
                    protocol = %event.protocol,
                    tier = %event.tier,
                    "Open violation event has no active-violation row"
                );
                findings.push(VigilError::DataIntegrity {
                    event_id: event.id,
                    component_id: event.component_id,
                    protocol: event.protocol,
                    tier: event.tier,
                });
            }
        }
        Ok(findings)
    }
}

// Snapshot support lives here so the whole keyed state travels as one unit.
impl crate::persistence::Persistable for MemoryStore {
    fn persist_name(&self) -> &str {
        "violation_store"
    }

    fn snapshot(&self) -> VigilResult<Vec<u8>> {
        let st = self.state.read();
        Ok(serde_json::to_vec(&*st)?)
    }

    fn restore(&self, data: &[u8]) -> VigilResult<()> {
        let restored: StoreState = serde_json::from_slice(data)?;
        *self.state.write() = restored;
        Ok(())
    }
}
