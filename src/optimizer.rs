//! Performance optimizer: the control loop over scheduler and hibernation.
//!
//! [`PerformanceOptimizer::run_cycle`] executes one rebalance pass: plan
//! under the registry lock, act through the hibernation engine with the lock
//! released, isolate per-tab failures, escalate to an emergency pass under
//! Critical pressure, trim registered caches, and compact internal storage.
//! [`PerformanceOptimizer::analyze`] computes the same decision as an
//! immutable [`OptimizationRecommendation`] (dry run). A background sweep
//! thread drives cycles on a timer and on pressure triggers forwarded by the
//! resource monitor, coalescing queued wakeups into one pass.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::TabId;
use crate::cache::TrimmableCache;
use crate::collaborator::TabCollaborator;
use crate::config::EngineConfig;
use crate::error::{EngineError, TabOperation};
use crate::hibernation::HibernationEngine;
use crate::monitor::{CycleTrigger, PressureLevel, ResourceMonitor};
use crate::registry::{TabLifecycle, TabRegistry};
use crate::scheduler::{self, VisibilityWindow};
use crate::snapshot::PreservationLevel;

/// How many recent cycle summaries are retained.
const SUMMARY_HISTORY: usize = 32;

/// One suggested action from a dry-run analysis, with a human-readable
/// rationale. Producing an action never executes it.
#[derive(Debug, Clone, PartialEq)]
pub enum RecommendedAction {
    /// Hibernate a tab at the given preservation level.
    Hibernate {
        tab: TabId,
        level: PreservationLevel,
        reason: String,
    },
    /// Discard a hibernated tab's snapshot entirely.
    Evict { tab: TabId, reason: String },
    /// Trim the registered auxiliary caches.
    TrimCaches { reason: String },
    /// Temporarily lower the materialization cap.
    LowerCap {
        from: usize,
        to: usize,
        reason: String,
    },
}

/// Immutable result of an analysis pass.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationRecommendation {
    /// Pressure level at analysis time, if a sample exists.
    pub pressure: Option<PressureLevel>,
    /// Tabs currently materialized (forced plus retained).
    pub materialized: usize,
    /// Suggested actions, in execution order.
    pub actions: Vec<RecommendedAction>,
}

impl OptimizationRecommendation {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Outcome of one optimization cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSummary {
    /// Monotonic cycle number.
    pub cycle: u64,
    /// What started the cycle.
    pub trigger: CycleTrigger,
    /// Pressure level observed at the start of the cycle.
    pub pressure: Option<PressureLevel>,
    /// Whether the emergency pass ran.
    pub emergency: bool,
    /// Tabs hibernated this cycle.
    pub hibernated: Vec<TabId>,
    /// Tabs reactivated this cycle.
    pub reactivated: Vec<TabId>,
    /// Tabs whose snapshots were evicted this cycle.
    pub evicted: Vec<TabId>,
    /// Isolated per-tab failures (the cycle itself never aborts on them).
    pub failures: Vec<EngineError>,
    /// Entries removed from registered caches.
    pub cache_entries_trimmed: usize,
    /// Wall-clock duration of the cycle.
    pub duration: Duration,
}

impl CycleSummary {
    fn new(cycle: u64, trigger: CycleTrigger) -> Self {
        Self {
            cycle,
            trigger,
            pressure: None,
            emergency: false,
            hibernated: Vec::new(),
            reactivated: Vec::new(),
            evicted: Vec::new(),
            failures: Vec::new(),
            cache_entries_trimmed: 0,
            duration: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct InFlight {
    /// The operation requested while another was outstanding; applied as a
    /// follow-up when the outstanding one completes (the later request wins).
    follow_up: Option<TabOperation>,
}

/// The control loop. Composed once by the facade and shared behind an `Arc`
/// so the sweep thread and synchronous entry points run the same code.
pub struct PerformanceOptimizer {
    registry: Arc<Mutex<TabRegistry>>,
    config: Arc<Mutex<EngineConfig>>,
    collaborator: Arc<dyn TabCollaborator>,
    hibernation: Arc<HibernationEngine>,
    monitor: Arc<ResourceMonitor>,
    caches: Mutex<Vec<Arc<dyn TrimmableCache>>>,
    in_flight: Mutex<HashMap<TabId, InFlight>>,
    cycle_seq: AtomicU64,
    summaries: Mutex<VecDeque<CycleSummary>>,
    running: Arc<AtomicBool>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl PerformanceOptimizer {
    pub fn new(
        registry: Arc<Mutex<TabRegistry>>,
        config: Arc<Mutex<EngineConfig>>,
        collaborator: Arc<dyn TabCollaborator>,
        hibernation: Arc<HibernationEngine>,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        Self {
            registry,
            config,
            collaborator,
            hibernation,
            monitor,
            caches: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            cycle_seq: AtomicU64::new(0),
            summaries: Mutex::new(VecDeque::with_capacity(SUMMARY_HISTORY)),
            running: Arc::new(AtomicBool::new(false)),
            sweep: Mutex::new(None),
        }
    }

    /// Register an auxiliary cache for cycle trims.
    pub fn register_cache(&self, cache: Arc<dyn TrimmableCache>) {
        self.caches.lock().push(cache);
    }

    /// The most recent cycle summary, if any cycle has run.
    pub fn last_cycle(&self) -> Option<CycleSummary> {
        self.summaries.lock().back().cloned()
    }

    /// Recent cycle summaries, oldest first.
    pub fn recent_cycles(&self) -> Vec<CycleSummary> {
        self.summaries.lock().iter().cloned().collect()
    }

    // ----------------------------------------------------------------------
    // Cycle execution
    // ----------------------------------------------------------------------

    /// Run one optimization cycle. Per-tab failures are collected into the
    /// returned summary, never propagated; the only hard failure mode left
    /// is a misconfigured cap, which validation prevents.
    pub fn run_cycle(&self, trigger: CycleTrigger) -> CycleSummary {
        let started = Instant::now();
        let cycle = self.cycle_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let config = self.config.lock().clone();

        // Visibility is pulled from the collaborator with no locks held.
        let visible = self.collaborator.visible_tabs();
        let window = VisibilityWindow::new(visible, config.buffer_tabs);

        let mut summary = CycleSummary::new(cycle, trigger);

        // A failed sample degrades the cycle to its default pass; pressure
        // stays unknown.
        match self.monitor.sample_now() {
            Ok(_) => summary.pressure = self.monitor.pressure(),
            Err(err) => summary.failures.push(err),
        }
        let emergency =
            trigger.is_critical() || summary.pressure == Some(PressureLevel::Critical);
        summary.emergency = emergency;

        // Default pass at the configured cap and retention.
        self.run_pass(
            &window,
            config.max_materialized_tabs,
            config.retention(),
            config.aggressive_eviction,
            &config,
            cycle,
            &mut summary,
        );

        // Emergency pass: temporarily lowered cap, tighter retention, stale
        // snapshots actually evicted.
        if emergency {
            log::warn!(
                "Cycle {cycle}: critical pressure, emergency pass at cap {}",
                config.emergency_cap()
            );
            self.run_pass(
                &window,
                config.emergency_cap(),
                config.emergency_retention(),
                true,
                &config,
                cycle,
                &mut summary,
            );
        }

        // Trim auxiliary caches and release spare internal capacity (the
        // closest thing this crate has to a garbage-collection hint).
        for cache in self.caches.lock().iter() {
            summary.cache_entries_trimmed += cache.trim(emergency);
        }
        self.registry.lock().compact();
        self.hibernation.compact();

        summary.duration = started.elapsed();
        log::info!(
            "Cycle {cycle} ({:?}): {} hibernated, {} reactivated, {} evicted, {} trimmed, {} failures in {:?}",
            trigger,
            summary.hibernated.len(),
            summary.reactivated.len(),
            summary.evicted.len(),
            summary.cache_entries_trimmed,
            summary.failures.len(),
            summary.duration
        );

        let mut summaries = self.summaries.lock();
        while summaries.len() >= SUMMARY_HISTORY {
            summaries.pop_front();
        }
        summaries.push_back(summary.clone());
        summary
    }

    #[allow(clippy::too_many_arguments)]
    fn run_pass(
        &self,
        window: &VisibilityWindow,
        cap: usize,
        retention: Duration,
        evict: bool,
        config: &EngineConfig,
        cycle: u64,
        summary: &mut CycleSummary,
    ) {
        let plan = {
            let registry = self.registry.lock();
            scheduler::plan(&registry, window, cap, retention, config, Instant::now())
        };
        let plan = match plan {
            Ok(plan) => plan,
            Err(err) => {
                summary.failures.push(err);
                return;
            }
        };

        // Window tabs are resolved before anything is torn down.
        for tab in plan.reactivate {
            self.execute(tab, TabOperation::Reactivate, config, cycle, summary);
        }
        for tab in plan.hibernate {
            self.execute(tab, TabOperation::Hibernate, config, cycle, summary);
        }

        if evict {
            for tab in plan.evict_candidates {
                // A tab that already changed state this cycle keeps its
                // snapshot; it stays a candidate for the next cycle.
                if self.registry.lock().transition(tab, TabLifecycle::Evicted, cycle, Instant::now())
                {
                    self.hibernation.discard(tab);
                    summary.evicted.push(tab);
                    log::info!("Evicted stale snapshot of tab {tab}");
                }
            }
        }
    }

    /// Execute one hibernate/reactivate with in-flight coalescing: a request
    /// for a tab that already has an operation outstanding records itself as
    /// the follow-up and returns; the completing call applies it.
    fn execute(
        &self,
        tab: TabId,
        op: TabOperation,
        config: &EngineConfig,
        cycle: u64,
        summary: &mut CycleSummary,
    ) {
        match self.in_flight.lock().entry(tab) {
            Entry::Occupied(mut outstanding) => {
                outstanding.get_mut().follow_up = Some(op);
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(InFlight::default());
            }
        }

        let mut current = op;
        let mut stamp = cycle;
        loop {
            self.perform(tab, current, config, stamp, summary);
            // Take the follow-up and retire the entry under one lock
            // acquisition; a request landing between a separate take and
            // remove would be recorded and then thrown away unapplied.
            let follow_up = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.get_mut(&tab).and_then(|entry| entry.follow_up.take()) {
                    Some(next) if next != current => Some(next),
                    _ => {
                        in_flight.remove(&tab);
                        None
                    }
                }
            };
            let Some(next) = follow_up else { break };
            // The follow-up is its own decision pass as far as the
            // registry's transition guard is concerned.
            stamp = self.cycle_seq.fetch_add(1, Ordering::SeqCst) + 1;
            current = next;
        }
    }

    fn perform(
        &self,
        tab: TabId,
        op: TabOperation,
        config: &EngineConfig,
        cycle: u64,
        summary: &mut CycleSummary,
    ) {
        match op {
            TabOperation::Hibernate => {
                // Level selection reads the record; a tab unregistered since
                // planning makes the whole operation a no-op.
                let level = {
                    let registry = self.registry.lock();
                    match registry.get(tab) {
                        Some(record) => HibernationEngine::select_level(record, config),
                        None => return,
                    }
                };
                match self.hibernation.hibernate(tab, level, config) {
                    Ok(_) => {
                        let mut registry = self.registry.lock();
                        if registry.contains(tab) {
                            registry.transition(tab, TabLifecycle::Hibernated, cycle, Instant::now());
                            summary.hibernated.push(tab);
                        } else {
                            // Closed while the capture was in flight; the
                            // result is discarded, not an error.
                            drop(registry);
                            self.hibernation.discard(tab);
                        }
                    }
                    Err(err) => {
                        if self.registry.lock().contains(tab) {
                            summary.failures.push(err);
                        }
                    }
                }
            }
            TabOperation::Reactivate => {
                match self.hibernation.reactivate(tab, config) {
                    Ok(()) => {
                        if self
                            .registry
                            .lock()
                            .transition(tab, TabLifecycle::Active, cycle, Instant::now())
                        {
                            summary.reactivated.push(tab);
                        }
                    }
                    Err(EngineError::SnapshotMissing(_)) => {
                        // Registry says Hibernated, engine has nothing:
                        // self-heal by forcing the record back to Active.
                        let healed = self.registry.lock().transition(
                            tab,
                            TabLifecycle::Active,
                            cycle,
                            Instant::now(),
                        );
                        if healed {
                            log::error!(
                                "Self-healed tab {tab}: no snapshot for a hibernated record"
                            );
                            summary.failures.push(EngineError::SnapshotMissing(tab));
                        }
                    }
                    Err(err) => {
                        // Timed-out or failed restore: the snapshot stays
                        // stored and the record stays Hibernated for retry.
                        if self.registry.lock().contains(tab) {
                            summary.failures.push(err);
                        }
                    }
                }
            }
        }
    }

    /// Run one hibernate-or-reactivate synchronously through the in-flight
    /// machinery. A request for a tab with an operation already outstanding
    /// is coalesced into the follow-up slot and returns Ok (the later
    /// request wins the eventual state). Unknown ids are no-ops.
    pub fn run_tab_operation(&self, tab: TabId, op: TabOperation) -> Result<(), EngineError> {
        let state = self.registry.lock().get(tab).map(|record| record.state);
        match (op, state) {
            (_, None) | (_, Some(TabLifecycle::Evicted)) => return Ok(()),
            (TabOperation::Hibernate, Some(TabLifecycle::Hibernated))
            | (TabOperation::Reactivate, Some(TabLifecycle::Active)) => return Ok(()),
            (TabOperation::Hibernate, Some(TabLifecycle::Active))
            | (TabOperation::Reactivate, Some(TabLifecycle::Hibernated)) => {}
        }
        let config = self.config.lock().clone();
        let stamp = self.cycle_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut summary = CycleSummary::new(stamp, CycleTrigger::Manual);
        self.execute(tab, op, &config, stamp, &mut summary);
        match summary.failures.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ----------------------------------------------------------------------
    // Dry-run analysis
    // ----------------------------------------------------------------------

    /// Compute the same rebalancing decision as [`run_cycle`] without
    /// mutating any tab state or snapshot, over a consistent clone of the
    /// registry. Repeated calls with unchanged inputs are equivalent.
    ///
    /// [`run_cycle`]: PerformanceOptimizer::run_cycle
    pub fn analyze(&self) -> Result<OptimizationRecommendation, EngineError> {
        let config = self.config.lock().clone();
        let pressure = self.monitor.pressure();
        let emergency = pressure == Some(PressureLevel::Critical);

        let window = VisibilityWindow::new(self.collaborator.visible_tabs(), config.buffer_tabs);
        let view = self.registry.lock().clone();

        let cap = if emergency {
            config.emergency_cap()
        } else {
            config.max_materialized_tabs
        };
        let retention = if emergency {
            config.emergency_retention()
        } else {
            config.retention()
        };
        let now = Instant::now();
        let plan = scheduler::plan(&view, &window, cap, retention, &config, now)?;

        let mut actions = Vec::new();
        if emergency {
            actions.push(RecommendedAction::LowerCap {
                from: config.max_materialized_tabs,
                to: config.emergency_cap(),
                reason: "critical memory pressure".into(),
            });
        }
        for tab in &plan.hibernate {
            let level = view
                .get(*tab)
                .map(|record| HibernationEngine::select_level(record, &config))
                .unwrap_or(PreservationLevel::Basic);
            let idle = view
                .get(*tab)
                .map(|record| record.idle(now).as_secs())
                .unwrap_or(0);
            actions.push(RecommendedAction::Hibernate {
                tab: *tab,
                level,
                reason: format!("beyond the materialization cap of {cap}, idle {idle}s"),
            });
        }
        for tab in &plan.evict_candidates {
            actions.push(RecommendedAction::Evict {
                tab: *tab,
                reason: format!(
                    "hibernated longer than the retention period of {}s",
                    retention.as_secs()
                ),
            });
        }
        if pressure.is_some_and(|p| p >= PressureLevel::Warning) {
            actions.push(RecommendedAction::TrimCaches {
                reason: "elevated memory pressure".into(),
            });
        }

        Ok(OptimizationRecommendation {
            pressure,
            materialized: plan.materialized(),
            actions,
        })
    }

    // ----------------------------------------------------------------------
    // Background sweep
    // ----------------------------------------------------------------------

    /// Spawn the sweep thread. Wakeups arrive on `wake`: pressure triggers
    /// from the monitor and explicit requests from the facade; the timer is
    /// the receive timeout. Queued wakeups are drained into a single cycle
    /// whose trigger is the strongest reason. No-op when already running.
    pub fn start_sweep(self: &Arc<Self>, wake: Receiver<CycleTrigger>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let optimizer = Arc::clone(self);
        let running = Arc::clone(&self.running);
        let handle = std::thread::Builder::new()
            .name("cabinet-tabs-sweep".to_string())
            .spawn(move || {
                loop {
                    let interval = optimizer.config.lock().cycle_interval();
                    let trigger = match wake.recv_timeout(interval) {
                        Ok(mut trigger) => {
                            while let Ok(queued) = wake.try_recv() {
                                trigger = trigger.max(queued);
                            }
                            trigger
                        }
                        Err(RecvTimeoutError::Timeout) => CycleTrigger::Timer,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    optimizer.run_cycle(trigger);
                }
            })
            .expect("failed to spawn optimizer sweep thread");

        *self.sweep.lock() = Some(handle);
    }

    /// Ask the sweep loop to exit before it runs another cycle.
    pub fn signal_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Join the sweep thread after [`signal_stop`](Self::signal_stop) (and a
    /// wakeup so the loop observes the flag promptly).
    pub fn join_sweep(&self) {
        if let Some(handle) = self.sweep.lock().take() {
            let _ = handle.join();
        }
    }

    /// Whether the sweep thread is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for PerformanceOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceOptimizer")
            .field("cycles", &self.cycle_seq.load(Ordering::SeqCst))
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
