//! The facade the rest of the shell calls.
//!
//! `TabEngine` composes the registry, resource monitor, hibernation engine,
//! and optimizer around a single collaborator implementation chosen at
//! construction time. Mutating entry points serialize on the registry lock;
//! the background monitor and sweep threads are started with
//! [`TabEngine::start`] and joined by [`TabEngine::stop`] (also on drop).

use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::time::Instant;

use parking_lot::Mutex;

use crate::TabId;
use crate::cache::TrimmableCache;
use crate::collaborator::TabCollaborator;
use crate::config::{ConfigUpdate, EngineConfig};
use crate::error::{EngineError, TabOperation};
use crate::hibernation::{HibernationEngine, HibernationStats};
use crate::monitor::{
    CycleTrigger, MemoryProfile, MemorySource, MonitorTuning, PressureLevel, ResourceMonitor,
    SysinfoSource,
};
use crate::optimizer::{CycleSummary, OptimizationRecommendation, PerformanceOptimizer};
use crate::registry::{TabLifecycle, TabRecord, TabRegistry};

/// Aggregate statistics for the host's diagnostics surface.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Tabs in `Active` state.
    pub active: usize,
    /// Tabs in `Hibernated` state.
    pub hibernated: usize,
    /// Tabs in `Evicted` state.
    pub evicted: usize,
    /// Pinned tabs, across all states.
    pub pinned: usize,
    /// Wall-clock duration of the last optimization cycle, in milliseconds.
    pub last_cycle_ms: Option<u64>,
    /// Latest memory sample, if the monitor has one.
    pub memory: Option<MemoryProfile>,
    /// Latest classified pressure level.
    pub pressure: Option<PressureLevel>,
    /// Stored hibernation snapshots.
    pub snapshot_count: usize,
    /// Estimated bytes retained by stored snapshots.
    pub snapshot_bytes: usize,
    /// Hibernation operation totals.
    pub hibernation: HibernationStats,
}

/// Tab resource-management core: registration, scheduling, hibernation, and
/// pressure response behind one surface.
pub struct TabEngine {
    registry: Arc<Mutex<TabRegistry>>,
    config: Arc<Mutex<EngineConfig>>,
    hibernation: Arc<HibernationEngine>,
    monitor: Arc<ResourceMonitor>,
    optimizer: Arc<PerformanceOptimizer>,
    /// Sender half of the sweep wakeup channel while the engine is started.
    wake: Mutex<Option<Sender<CycleTrigger>>>,
}

impl TabEngine {
    /// Compose an engine over the production `sysinfo` memory source.
    pub fn new(
        collaborator: Arc<dyn TabCollaborator>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        Self::with_memory_source(collaborator, config, Box::new(SysinfoSource::new()))
    }

    /// Compose an engine with an explicit memory source (tests inject
    /// scripted ones here).
    pub fn with_memory_source(
        collaborator: Arc<dyn TabCollaborator>,
        config: EngineConfig,
        source: Box<dyn MemorySource>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let registry = Arc::new(Mutex::new(TabRegistry::new()));
        let config = Arc::new(Mutex::new(config));
        let hibernation = Arc::new(HibernationEngine::new(Arc::clone(&collaborator)));
        let monitor = Arc::new(ResourceMonitor::new(
            source,
            MonitorTuning::from_config(&config.lock()),
        ));
        let optimizer = Arc::new(PerformanceOptimizer::new(
            Arc::clone(&registry),
            Arc::clone(&config),
            collaborator,
            Arc::clone(&hibernation),
            Arc::clone(&monitor),
        ));

        Ok(Self {
            registry,
            config,
            hibernation,
            monitor,
            optimizer,
            wake: Mutex::new(None),
        })
    }

    // ----------------------------------------------------------------------
    // Tab lifecycle entry points
    // ----------------------------------------------------------------------

    /// Add a tab in `Active` state. `DuplicateId` if already registered.
    pub fn register_tab(&self, id: TabId, pinned: bool) -> Result<(), EngineError> {
        self.registry.lock().insert(id, pinned, Instant::now())?;
        log::debug!("Registered tab {id} (pinned: {pinned})");
        Ok(())
    }

    /// Remove a tab and discard any snapshot. Idempotent; an in-flight
    /// hibernate or reactivate for the id completes as a no-op.
    pub fn unregister_tab(&self, id: TabId) {
        let removed = self.registry.lock().remove(id);
        let discarded = self.hibernation.discard(id);
        if removed.is_some() {
            log::debug!(
                "Unregistered tab {id} ({} snapshot bytes discarded)",
                discarded.unwrap_or(0)
            );
        }
    }

    /// Mark a tab activated now. A hibernated tab is reactivated on the
    /// spot (priority re-evaluation without a full rebalance); unknown ids
    /// are ignored.
    pub fn touch(&self, id: TabId) {
        let was_hibernated = {
            let mut registry = self.registry.lock();
            registry.touch(id, Instant::now())
                && registry.get(id).is_some_and(|r| r.state == TabLifecycle::Hibernated)
        };
        if was_hibernated {
            if let Err(err) = self.reactivate_tab(id) {
                log::warn!("Touch of hibernated tab {id} failed to reactivate: {err}");
            }
        }
    }

    /// Set or clear the pinned flag. Unknown ids are ignored.
    pub fn set_pinned(&self, id: TabId, pinned: bool) {
        self.registry.lock().set_pinned(id, pinned);
    }

    /// Set or clear the unsaved-edits flag. Unknown ids are ignored.
    pub fn set_dirty(&self, id: TabId, dirty: bool) {
        self.registry.lock().set_dirty(id, dirty);
    }

    /// Record a navigation (bumps the history-depth hint used for
    /// preservation-level selection). Unknown ids are ignored.
    pub fn note_navigation(&self, id: TabId) {
        self.registry.lock().note_navigation(id);
    }

    /// Hibernate one tab synchronously at the policy-selected level.
    /// Idempotent for already-hibernated tabs.
    pub fn hibernate_tab(&self, id: TabId) -> Result<(), EngineError> {
        self.optimizer.run_tab_operation(id, TabOperation::Hibernate)
    }

    /// Reactivate one hibernated tab synchronously.
    pub fn reactivate_tab(&self, id: TabId) -> Result<(), EngineError> {
        self.optimizer.run_tab_operation(id, TabOperation::Reactivate)
    }

    // ----------------------------------------------------------------------
    // Cycle and analysis
    // ----------------------------------------------------------------------

    /// Run one optimization cycle synchronously.
    pub fn run_cycle_now(&self) -> CycleSummary {
        self.optimizer.run_cycle(CycleTrigger::Manual)
    }

    /// Read-only analysis: the rebalancing decision as recommendations,
    /// mutating nothing.
    pub fn analyze(&self) -> Result<OptimizationRecommendation, EngineError> {
        self.optimizer.analyze()
    }

    /// The most recent cycle summary.
    pub fn last_cycle(&self) -> Option<CycleSummary> {
        self.optimizer.last_cycle()
    }

    /// Recent cycle summaries, oldest first.
    pub fn recent_cycles(&self) -> Vec<CycleSummary> {
        self.optimizer.recent_cycles()
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> EngineStats {
        let counts = self.registry.lock().counts();
        EngineStats {
            active: counts.active,
            hibernated: counts.hibernated,
            evicted: counts.evicted,
            pinned: counts.pinned,
            last_cycle_ms: self
                .optimizer
                .last_cycle()
                .map(|summary| summary.duration.as_millis() as u64),
            memory: self.monitor.latest(),
            pressure: self.monitor.pressure(),
            snapshot_count: self.hibernation.snapshot_count(),
            snapshot_bytes: self.hibernation.retained_bytes(),
            hibernation: self.hibernation.stats(),
        }
    }

    /// A copy of one tab's record, for diagnostics.
    pub fn tab_record(&self, id: TabId) -> Option<TabRecord> {
        self.registry.lock().get(id).cloned()
    }

    // ----------------------------------------------------------------------
    // Configuration and composition
    // ----------------------------------------------------------------------

    /// Apply a partial configuration update. On validation failure the
    /// previous configuration stays in effect untouched.
    pub fn configure(&self, update: ConfigUpdate) -> Result<(), EngineError> {
        let mut config = self.config.lock();
        let next = update.merged_into(&config)?;
        self.monitor.retune(MonitorTuning::from_config(&next));
        log::info!("Configuration updated: cap {}", next.max_materialized_tabs);
        *config = next;
        Ok(())
    }

    /// Current configuration (copy).
    pub fn config(&self) -> EngineConfig {
        self.config.lock().clone()
    }

    /// Register an auxiliary cache for cycle trims.
    pub fn register_cache(&self, cache: Arc<dyn TrimmableCache>) {
        self.optimizer.register_cache(cache);
    }

    // ----------------------------------------------------------------------
    // Background threads
    // ----------------------------------------------------------------------

    /// Start the monitor and sweep threads. No-op when already started.
    pub fn start(&self) {
        let mut wake = self.wake.lock();
        if wake.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel();
        let config = self.config.lock();
        self.monitor.start(config.monitor_interval(), tx.clone());
        drop(config);
        self.optimizer.start_sweep(rx);
        *wake = Some(tx);
        log::info!("Tab engine background threads started");
    }

    /// Stop and join the background threads.
    pub fn stop(&self) {
        self.monitor.stop();
        self.optimizer.signal_stop();
        if let Some(tx) = self.wake.lock().take() {
            // Wake the sweep loop so it observes the stop flag promptly.
            let _ = tx.send(CycleTrigger::Manual);
        }
        self.optimizer.join_sweep();
    }

    /// Whether the background threads are running.
    pub fn is_running(&self) -> bool {
        self.optimizer.is_running()
    }
}

impl Drop for TabEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TabEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabEngine")
            .field("tabs", &self.registry.lock().len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
