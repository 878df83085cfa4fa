//! The canonical mapping from tab identity to its current record.
//!
//! `TabRegistry` is the single source of truth for which tabs exist, their
//! strip order (insertion order), and their lifecycle states. It holds no
//! references to live UI objects; the association between a record and its
//! view is by id through the collaborator.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::TabId;
use crate::error::EngineError;

/// Lifecycle state of a tab's resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabLifecycle {
    /// Fully live state is resident and ready for immediate interaction.
    Active,
    /// State is compacted into a snapshot; live resources are released.
    Hibernated,
    /// The snapshot has been discarded; only this bookkeeping entry remains.
    Evicted,
}

/// Per-tab metadata and priority inputs.
#[derive(Debug, Clone)]
pub struct TabRecord {
    /// Tab identity, minted by the shell.
    pub id: TabId,
    /// When the tab was registered.
    pub created_at: Instant,
    /// Last time the tab was activated or focused.
    pub last_activated: Instant,
    /// Pinned tabs are never hibernated or evicted automatically.
    pub pinned: bool,
    /// The tab has unsaved or pending edits.
    pub dirty: bool,
    /// Navigation-history depth hint, used for preservation-level selection.
    pub history_depth: usize,
    /// Current lifecycle state.
    pub state: TabLifecycle,
    /// When the tab entered `Hibernated`, for retention decisions.
    pub hibernated_at: Option<Instant>,
    /// Insertion sequence; stable tie-break for scheduling decisions.
    seq: u64,
    /// The cycle that last changed this record's state. Guards the
    /// one-transition-per-cycle invariant.
    transition_cycle: Option<u64>,
}

impl TabRecord {
    fn new(id: TabId, pinned: bool, seq: u64, now: Instant) -> Self {
        Self {
            id,
            created_at: now,
            last_activated: now,
            pinned,
            dirty: false,
            history_depth: 0,
            state: TabLifecycle::Active,
            hibernated_at: None,
            seq,
            transition_cycle: None,
        }
    }

    /// Insertion sequence number (earlier tabs win priority ties).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Time since the tab was last activated.
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activated)
    }

    /// How long the tab has been hibernated, if it is.
    pub fn hibernated_for(&self, now: Instant) -> Option<Duration> {
        self.hibernated_at
            .map(|at| now.saturating_duration_since(at))
    }
}

/// Per-state counts for stats reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub active: usize,
    pub hibernated: usize,
    pub evicted: usize,
    pub pinned: usize,
}

/// Canonical record store plus the strip order.
#[derive(Debug, Clone, Default)]
pub struct TabRegistry {
    records: HashMap<TabId, TabRecord>,
    order: Vec<TabId>,
    next_seq: u64,
}

impl TabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tab in `Active` state. Fails with
    /// [`EngineError::DuplicateId`] if the id is already present.
    pub fn insert(&mut self, id: TabId, pinned: bool, now: Instant) -> Result<(), EngineError> {
        if self.records.contains_key(&id) {
            return Err(EngineError::DuplicateId(id));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.insert(id, TabRecord::new(id, pinned, seq, now));
        self.order.push(id);
        Ok(())
    }

    /// Remove a tab's record. Returns `None` when the id is unknown, which
    /// makes repeated removal idempotent.
    pub fn remove(&mut self, id: TabId) -> Option<TabRecord> {
        let removed = self.records.remove(&id);
        if removed.is_some() {
            self.order.retain(|entry| *entry != id);
        }
        removed
    }

    pub fn get(&self, id: TabId) -> Option<&TabRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: TabId) -> Option<&mut TabRecord> {
        self.records.get_mut(&id)
    }

    pub fn contains(&self, id: TabId) -> bool {
        self.records.contains_key(&id)
    }

    /// Mark the tab as just activated. Returns false for unknown ids.
    pub fn touch(&mut self, id: TabId, now: Instant) -> bool {
        if let Some(record) = self.records.get_mut(&id) {
            record.last_activated = now;
            true
        } else {
            false
        }
    }

    /// Set or clear the pinned flag. Returns false for unknown ids.
    pub fn set_pinned(&mut self, id: TabId, pinned: bool) -> bool {
        if let Some(record) = self.records.get_mut(&id) {
            record.pinned = pinned;
            true
        } else {
            false
        }
    }

    /// Set or clear the dirty (unsaved edits) flag. Returns false for
    /// unknown ids.
    pub fn set_dirty(&mut self, id: TabId, dirty: bool) -> bool {
        if let Some(record) = self.records.get_mut(&id) {
            record.dirty = dirty;
            true
        } else {
            false
        }
    }

    /// Bump the navigation-history depth hint. Returns false for unknown ids.
    pub fn note_navigation(&mut self, id: TabId) -> bool {
        if let Some(record) = self.records.get_mut(&id) {
            record.history_depth = record.history_depth.saturating_add(1);
            true
        } else {
            false
        }
    }

    /// Transition a record's lifecycle state within decision cycle `cycle`.
    ///
    /// A record that already changed state in this cycle refuses a second
    /// change (transitions are monotonic within one pass); re-asserting the
    /// current state is always a no-op success. Returns false when the id is
    /// unknown or the transition was refused.
    pub fn transition(&mut self, id: TabId, next: TabLifecycle, cycle: u64, now: Instant) -> bool {
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };
        if record.state == next {
            return true;
        }
        if record.transition_cycle == Some(cycle) {
            log::warn!(
                "Refusing second transition of tab {} in cycle {} ({:?} -> {:?})",
                id,
                cycle,
                record.state,
                next
            );
            return false;
        }
        record.state = next;
        record.transition_cycle = Some(cycle);
        record.hibernated_at = match next {
            TabLifecycle::Hibernated => Some(now),
            TabLifecycle::Active | TabLifecycle::Evicted => None,
        };
        true
    }

    /// Position of a tab in the strip (insertion order).
    pub fn position(&self, id: TabId) -> Option<usize> {
        self.order.iter().position(|entry| *entry == id)
    }

    /// Strip order: every registered tab id in insertion order.
    pub fn order(&self) -> &[TabId] {
        &self.order
    }

    /// Iterate records in strip order.
    pub fn iter(&self) -> impl Iterator<Item = &TabRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Per-state counts (pinned counted separately, across all states).
    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for record in self.records.values() {
            match record.state {
                TabLifecycle::Active => counts.active += 1,
                TabLifecycle::Hibernated => counts.hibernated += 1,
                TabLifecycle::Evicted => counts.evicted += 1,
            }
            if record.pinned {
                counts.pinned += 1;
            }
        }
        counts
    }

    /// Release spare capacity after a batch of removals.
    pub fn compact(&mut self) {
        self.records.shrink_to_fit();
        self.order.shrink_to_fit();
    }
}
