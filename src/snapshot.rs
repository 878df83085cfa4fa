//! Hibernation snapshot types and the in-memory snapshot store.
//!
//! A [`TabStateSnapshot`] is the portable capture the collaborator produces
//! for a tab; [`HibernationSnapshot`] wraps it with bookkeeping (level,
//! estimated byte size, capture time). The [`SnapshotStore`] owns every
//! snapshot for currently hibernated tabs and keeps a running byte total for
//! pressure-aware decisions. A snapshot's lifetime ends exactly when its tab
//! reactivates (consumed) or is evicted (discarded).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::TabId;

/// How much of a tab's state a hibernation snapshot retains.
///
/// Higher levels cost more retained memory per hibernated tab, so the engine
/// never over-preserves beyond what reactivation plausibly needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreservationLevel {
    /// Directory path and selection only.
    Basic,
    /// Basic plus bounded recent navigation history and scroll position.
    Extended,
    /// Extended plus pending-edit summaries (undo-stack digest).
    Full,
}

/// Portable capture of a tab's essential state, produced by the collaborator.
///
/// Fields beyond `path` and `selection` are populated only at the matching
/// preservation level; [`TabStateSnapshot::truncated_to`] enforces the bound
/// regardless of what the collaborator handed over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabStateSnapshot {
    /// Directory the tab is viewing.
    pub path: String,

    /// Names of the currently selected entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selection: Vec<String>,

    /// Most recent navigation history, newest last (Extended and Full).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_history: Vec<String>,

    /// Scroll offset within the directory view (Extended and Full).
    #[serde(default)]
    pub scroll_offset: f32,

    /// Pending-edit summaries from the undo stack (Full only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_edits: Vec<String>,
}

impl TabStateSnapshot {
    /// A minimal snapshot for the given path.
    pub fn basic(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            selection: Vec::new(),
            recent_history: Vec::new(),
            scroll_offset: 0.0,
            pending_edits: Vec::new(),
        }
    }

    /// Drop everything the requested level does not retain and bound the
    /// history to the most recent `history_keep` entries.
    pub fn truncated_to(mut self, level: PreservationLevel, history_keep: usize) -> Self {
        match level {
            PreservationLevel::Basic => {
                self.recent_history.clear();
                self.scroll_offset = 0.0;
                self.pending_edits.clear();
            }
            PreservationLevel::Extended => {
                self.pending_edits.clear();
            }
            PreservationLevel::Full => {}
        }
        if self.recent_history.len() > history_keep {
            let skip = self.recent_history.len() - history_keep;
            self.recent_history.drain(..skip);
        }
        self
    }
}

/// A stored snapshot plus the bookkeeping the scheduler needs.
#[derive(Debug, Clone)]
pub struct HibernationSnapshot {
    /// Tab this snapshot belongs to.
    pub tab: TabId,
    /// Level the state was captured at.
    pub level: PreservationLevel,
    /// The captured state.
    pub payload: TabStateSnapshot,
    /// Estimated retained size, from the serialized payload length.
    pub estimated_bytes: usize,
    /// When the capture completed.
    pub captured_at: Instant,
}

impl HibernationSnapshot {
    /// Wrap a captured payload, computing its estimated size.
    pub fn new(tab: TabId, level: PreservationLevel, payload: TabStateSnapshot) -> Self {
        let estimated_bytes = estimate_bytes(&payload);
        Self {
            tab,
            level,
            payload,
            estimated_bytes,
            captured_at: Instant::now(),
        }
    }
}

/// Estimated in-memory footprint of a payload, from its serialized length.
pub fn estimate_bytes(payload: &TabStateSnapshot) -> usize {
    serde_json::to_vec(payload).map_or(0, |bytes| bytes.len())
}

/// Owns the snapshots of all currently hibernated tabs.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshots: HashMap<TabId, HibernationSnapshot>,
    total_bytes: usize,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a snapshot, replacing (and re-accounting) any previous one for
    /// the same tab.
    pub fn insert(&mut self, snapshot: HibernationSnapshot) {
        let tab = snapshot.tab;
        self.total_bytes += snapshot.estimated_bytes;
        if let Some(previous) = self.snapshots.insert(tab, snapshot) {
            self.total_bytes = self.total_bytes.saturating_sub(previous.estimated_bytes);
        }
    }

    pub fn get(&self, tab: TabId) -> Option<&HibernationSnapshot> {
        self.snapshots.get(&tab)
    }

    /// Remove and return a tab's snapshot, updating the byte total.
    pub fn remove(&mut self, tab: TabId) -> Option<HibernationSnapshot> {
        let removed = self.snapshots.remove(&tab);
        if let Some(snapshot) = &removed {
            self.total_bytes = self.total_bytes.saturating_sub(snapshot.estimated_bytes);
        }
        removed
    }

    pub fn contains(&self, tab: TabId) -> bool {
        self.snapshots.contains_key(&tab)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Total estimated bytes retained across all stored snapshots.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Tabs whose snapshots were captured more than `older_than` ago.
    /// Ordering is not guaranteed; callers sort as needed.
    pub fn stale(&self, older_than: Duration, now: Instant) -> Vec<TabId> {
        self.snapshots
            .values()
            .filter(|snapshot| now.duration_since(snapshot.captured_at) > older_than)
            .map(|snapshot| snapshot.tab)
            .collect()
    }

    /// Release spare map capacity after a batch of removals.
    pub fn compact(&mut self) {
        self.snapshots.shrink_to_fit();
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
        self.total_bytes = 0;
    }
}
