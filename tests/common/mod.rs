//! Shared integration test helpers for cabinet-tabs.
//!
//! The scripted collaborator and memory source used across the `tests/`
//! integration suite, plus factory functions for engines with test-friendly
//! tuning (tiny timeouts, zero retention). Each test file pulls these in
//! with `mod common;`; not every file uses every helper.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use cabinet_tabs::{
    EngineConfig, MemoryProfile, MemorySource, PreservationLevel, TabCollaborator, TabEngine,
    TabId, TabStateSnapshot,
};

/// Collaborator over an in-memory table of live tab states. Tabs can be
/// scripted slow (operations sleep past any small timeout) or failing.
#[derive(Default)]
pub struct ScriptedCollaborator {
    pub states: Mutex<HashMap<TabId, TabStateSnapshot>>,
    pub visible: Mutex<Vec<TabId>>,
    pub released: Mutex<HashSet<TabId>>,
    pub slow: Mutex<HashSet<TabId>>,
    pub failing: Mutex<HashSet<TabId>>,
    pub captures: Mutex<u64>,
    pub restores: Mutex<u64>,
}

impl ScriptedCollaborator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a tab's live state with a path, one selected entry, history, and
    /// a pending edit.
    pub fn seed(&self, tab: TabId, path: &str) {
        self.states.lock().insert(
            tab,
            TabStateSnapshot {
                path: path.to_string(),
                selection: vec!["selected.txt".to_string()],
                recent_history: vec![format!("{path}/.."), path.to_string()],
                scroll_offset: 42.0,
                pending_edits: vec![format!("pending edit in {path}")],
            },
        );
    }

    pub fn set_visible(&self, tabs: &[TabId]) {
        *self.visible.lock() = tabs.to_vec();
    }

    pub fn mark_slow(&self, tab: TabId) {
        self.slow.lock().insert(tab);
    }

    pub fn mark_failing(&self, tab: TabId) {
        self.failing.lock().insert(tab);
    }

    pub fn state_of(&self, tab: TabId) -> Option<TabStateSnapshot> {
        self.states.lock().get(&tab).cloned()
    }

    pub fn is_released(&self, tab: TabId) -> bool {
        self.released.lock().contains(&tab)
    }
}

impl TabCollaborator for ScriptedCollaborator {
    fn capture(&self, tab: TabId, _level: PreservationLevel) -> anyhow::Result<TabStateSnapshot> {
        *self.captures.lock() += 1;
        if self.slow.lock().contains(&tab) {
            std::thread::sleep(Duration::from_millis(300));
        }
        if self.failing.lock().contains(&tab) {
            anyhow::bail!("scripted capture failure for tab {tab}");
        }
        self.states
            .lock()
            .get(&tab)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no live state for tab {tab}"))
    }

    fn restore(&self, tab: TabId, snapshot: &TabStateSnapshot) -> anyhow::Result<()> {
        if self.slow.lock().contains(&tab) {
            std::thread::sleep(Duration::from_millis(300));
        }
        if self.failing.lock().contains(&tab) {
            anyhow::bail!("scripted restore failure for tab {tab}");
        }
        *self.restores.lock() += 1;
        self.states.lock().insert(tab, snapshot.clone());
        self.released.lock().remove(&tab);
        Ok(())
    }

    fn release(&self, tab: TabId) -> anyhow::Result<()> {
        self.released.lock().insert(tab);
        Ok(())
    }

    fn visible_tabs(&self) -> Vec<TabId> {
        self.visible.lock().clone()
    }
}

/// Memory source that replays a list of RSS values (in MB) and then repeats
/// the last one forever. An empty script always fails the read.
pub struct ScriptedMemory {
    samples: Vec<u64>,
    next: usize,
}

impl ScriptedMemory {
    pub fn new(samples: &[u64]) -> Box<Self> {
        Box::new(Self {
            samples: samples.to_vec(),
            next: 0,
        })
    }

    /// A source whose every read fails (pressure unknown).
    pub fn unavailable() -> Box<Self> {
        Self::new(&[])
    }
}

impl MemorySource for ScriptedMemory {
    fn sample(&mut self) -> Option<MemoryProfile> {
        let rss_mb = if self.next < self.samples.len() {
            let value = self.samples[self.next];
            self.next += 1;
            value
        } else {
            *self.samples.last()?
        };
        Some(MemoryProfile {
            rss_bytes: rss_mb * 1024 * 1024,
            virtual_bytes: rss_mb * 2 * 1024 * 1024,
            thread_count: 8,
            system_used_bytes: 8192 * 1024 * 1024,
            system_total_bytes: 16_384 * 1024 * 1024,
            taken_at: Instant::now(),
        })
    }
}

/// Engine configuration tuned for tests: tiny operation timeout, zero
/// retention so eviction candidates appear immediately, short intervals.
pub fn test_config(cap: usize) -> EngineConfig {
    EngineConfig {
        max_materialized_tabs: cap,
        buffer_tabs: 0,
        warning_threshold_mb: 500,
        critical_threshold_mb: 800,
        cycle_interval_secs: 1,
        monitor_interval_secs: 0.1,
        pressure_debounce_secs: 30,
        retention_secs: 0,
        emergency_retention_secs: 0,
        op_timeout_ms: 100,
        ..Default::default()
    }
}

/// Engine over a scripted collaborator, staying at Normal pressure.
pub fn engine_with(collab: &Arc<ScriptedCollaborator>, cap: usize) -> TabEngine {
    TabEngine::with_memory_source(
        Arc::clone(collab) as Arc<dyn TabCollaborator>,
        test_config(cap),
        ScriptedMemory::new(&[100]),
    )
    .expect("valid test configuration")
}

/// Engine whose memory source replays `samples` (MB) then repeats the last.
pub fn engine_with_memory(
    collab: &Arc<ScriptedCollaborator>,
    cap: usize,
    samples: &[u64],
) -> TabEngine {
    TabEngine::with_memory_source(
        Arc::clone(collab) as Arc<dyn TabCollaborator>,
        test_config(cap),
        ScriptedMemory::new(samples),
    )
    .expect("valid test configuration")
}
