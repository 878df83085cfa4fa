//! Process resource monitor with pressure classification.
//!
//! Samples process memory and thread usage via `sysinfo` on a background
//! thread, keeps a bounded rolling history, classifies each sample into a
//! pressure level, and decides (debounced, trend-aware) when a pressure
//! transition should trigger an unscheduled optimization cycle. The sampling
//! backend sits behind [`MemorySource`] so tests can inject scripted samples.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::error::EngineError;

/// Coarse classification of current resource scarcity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
}

/// Short-term direction of process memory use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTrend {
    Rising,
    Falling,
    Flat,
}

/// Why an optimization cycle was started. Ordered by escalation so coalesced
/// wakeups keep the strongest reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CycleTrigger {
    /// The regular cycle interval elapsed.
    Timer,
    /// An explicit request (facade call or touch of a hibernated tab).
    Manual,
    /// Sustained transition into Warning pressure.
    WarningPressure,
    /// Transition into Critical pressure; the cycle runs an emergency pass.
    CriticalPressure,
}

impl CycleTrigger {
    /// Whether this trigger escalates the cycle to an emergency pass.
    pub fn is_critical(self) -> bool {
        self == CycleTrigger::CriticalPressure
    }
}

/// One point sample of process and system memory. Immutable once created.
#[derive(Debug, Clone)]
pub struct MemoryProfile {
    /// Process resident set size in bytes.
    pub rss_bytes: u64,
    /// Process virtual size in bytes.
    pub virtual_bytes: u64,
    /// Process thread count (0 when the platform does not expose it).
    pub thread_count: usize,
    /// System-wide used memory in bytes.
    pub system_used_bytes: u64,
    /// System-wide total memory in bytes.
    pub system_total_bytes: u64,
    /// When the sample was taken.
    pub taken_at: Instant,
}

impl MemoryProfile {
    /// Process RSS in whole megabytes.
    pub fn rss_mb(&self) -> u64 {
        self.rss_bytes / (1024 * 1024)
    }
}

/// Source of memory samples. Exactly one implementation is selected at
/// composition time: [`SysinfoSource`] in production, scripted sources in
/// tests.
pub trait MemorySource: Send {
    /// Take one sample. `None` means the read failed; the caller degrades to
    /// default (non-emergency) behavior.
    fn sample(&mut self) -> Option<MemoryProfile>;
}

/// Production sampler backed by `sysinfo`.
pub struct SysinfoSource {
    sys: sysinfo::System,
    pid: Option<sysinfo::Pid>,
}

impl SysinfoSource {
    pub fn new() -> Self {
        use sysinfo::{MemoryRefreshKind, ProcessRefreshKind, RefreshKind, System};

        let sys = System::new_with_specifics(
            RefreshKind::nothing()
                .with_memory(MemoryRefreshKind::everything())
                .with_processes(ProcessRefreshKind::nothing().with_memory()),
        );
        let pid = sysinfo::get_current_pid().ok();
        Self { sys, pid }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource for SysinfoSource {
    fn sample(&mut self) -> Option<MemoryProfile> {
        let pid = self.pid?;
        self.sys.refresh_memory();
        self.sys
            .refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        let process = self.sys.process(pid)?;
        Some(MemoryProfile {
            rss_bytes: process.memory(),
            virtual_bytes: process.virtual_memory(),
            thread_count: process.tasks().map(|tasks| tasks.len()).unwrap_or(0),
            system_used_bytes: self.sys.used_memory(),
            system_total_bytes: self.sys.total_memory(),
            taken_at: Instant::now(),
        })
    }
}

/// The monitor's classification and debounce knobs, copied from
/// [`EngineConfig`] so the monitor never needs the full configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorTuning {
    pub warning_threshold_mb: u64,
    pub critical_threshold_mb: u64,
    pub critical_thread_count: usize,
    pub history_capacity: usize,
    pub trend_window: usize,
    pub pressure_debounce: Duration,
}

impl MonitorTuning {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            warning_threshold_mb: config.warning_threshold_mb,
            critical_threshold_mb: config.critical_threshold_mb,
            critical_thread_count: config.critical_thread_count,
            history_capacity: config.history_capacity,
            trend_window: config.trend_window,
            pressure_debounce: config.pressure_debounce(),
        }
    }
}

/// Classify one sample against the configured thresholds.
pub fn classify(profile: &MemoryProfile, tuning: &MonitorTuning) -> PressureLevel {
    if profile.rss_mb() > tuning.critical_threshold_mb
        || profile.thread_count > tuning.critical_thread_count
    {
        PressureLevel::Critical
    } else if profile.rss_mb() > tuning.warning_threshold_mb {
        PressureLevel::Warning
    } else {
        PressureLevel::Normal
    }
}

/// Direction of RSS over the last `window` samples (needs at least two).
pub fn trend_of(history: &VecDeque<MemoryProfile>, window: usize) -> MemoryTrend {
    let len = history.len();
    if len < 2 {
        return MemoryTrend::Flat;
    }
    let span = window.max(2).min(len);
    let first = &history[len - span];
    let last = &history[len - 1];
    if last.rss_bytes > first.rss_bytes {
        MemoryTrend::Rising
    } else if last.rss_bytes < first.rss_bytes {
        MemoryTrend::Falling
    } else {
        MemoryTrend::Flat
    }
}

/// Decide whether a pressure transition triggers an unscheduled cycle.
///
/// Transitions into Critical trigger an emergency cycle, debounced against
/// the previous critical-triggered cycle. Transitions into Warning trigger a
/// normal cycle only when the trend is rising (a one-sample spike is noise),
/// debounced against the previous warning-triggered cycle. The two debounce
/// clocks are independent so a warning-triggered cycle can never starve the
/// first critical trigger. Movement within a level never triggers.
pub(crate) fn evaluate_transition(
    prev: PressureLevel,
    next: PressureLevel,
    trend: MemoryTrend,
    last_warning_trigger: Option<Instant>,
    last_critical_trigger: Option<Instant>,
    debounce: Duration,
    now: Instant,
) -> Option<CycleTrigger> {
    if next == PressureLevel::Critical && prev < PressureLevel::Critical {
        let debounced = last_critical_trigger
            .is_some_and(|at| now.saturating_duration_since(at) < debounce);
        if !debounced {
            return Some(CycleTrigger::CriticalPressure);
        }
        return None;
    }
    if next == PressureLevel::Warning && prev < PressureLevel::Warning {
        let debounced = last_warning_trigger
            .is_some_and(|at| now.saturating_duration_since(at) < debounce);
        if trend == MemoryTrend::Rising && !debounced {
            return Some(CycleTrigger::WarningPressure);
        }
    }
    None
}

#[derive(Debug)]
struct MonitorState {
    history: VecDeque<MemoryProfile>,
    tuning: MonitorTuning,
    pressure: Option<PressureLevel>,
    trend: MemoryTrend,
    last_warning_trigger: Option<Instant>,
    last_critical_trigger: Option<Instant>,
    sample_failures: u64,
}

/// Background resource monitor.
///
/// Owns the rolling sample history and the debounce state. `start` spawns a
/// polling thread that forwards cycle triggers over the provided channel;
/// `sample_now` takes one synchronous sample through the same path.
pub struct ResourceMonitor {
    source: Arc<Mutex<Box<dyn MemorySource>>>,
    state: Arc<Mutex<MonitorState>>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    /// Create a new (stopped) monitor around the given source.
    pub fn new(source: Box<dyn MemorySource>, tuning: MonitorTuning) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            state: Arc::new(Mutex::new(MonitorState {
                history: VecDeque::with_capacity(tuning.history_capacity),
                tuning,
                pressure: None,
                trend: MemoryTrend::Flat,
                last_warning_trigger: None,
                last_critical_trigger: None,
                sample_failures: 0,
            })),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// Take one sample synchronously, updating history, pressure, and trend.
    /// Returns the profile plus the cycle trigger the transition produced,
    /// if any.
    pub fn sample_now(&self) -> Result<(MemoryProfile, Option<CycleTrigger>), EngineError> {
        take_sample(&self.source, &self.state)
    }

    /// Latest sample, if any sample has succeeded yet.
    pub fn latest(&self) -> Option<MemoryProfile> {
        self.state.lock().history.back().cloned()
    }

    /// Latest classified pressure level.
    pub fn pressure(&self) -> Option<PressureLevel> {
        self.state.lock().pressure
    }

    /// Latest short-term trend.
    pub fn trend(&self) -> MemoryTrend {
        self.state.lock().trend
    }

    /// Copy of the rolling history, oldest first.
    pub fn history(&self) -> Vec<MemoryProfile> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Number of failed source reads observed so far.
    pub fn sample_failures(&self) -> u64 {
        self.state.lock().sample_failures
    }

    /// Replace the classification/debounce knobs (applied from configure).
    pub fn retune(&self, tuning: MonitorTuning) {
        let mut state = self.state.lock();
        while state.history.len() > tuning.history_capacity.max(1) {
            state.history.pop_front();
        }
        state.tuning = tuning;
    }

    /// Start the polling thread. Triggers produced by pressure transitions
    /// are forwarded on `wake`. If the monitor is already running, this is a
    /// no-op.
    pub fn start(&self, interval: Duration, wake: mpsc::Sender<CycleTrigger>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let source = Arc::clone(&self.source);
        let state = Arc::clone(&self.state);
        let running = Arc::clone(&self.running);
        let interval = interval.max(Duration::from_millis(100));

        let handle = std::thread::Builder::new()
            .name("cabinet-tabs-monitor".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    if let Ok((_, Some(trigger))) = take_sample(&source, &state) {
                        // Receiver gone means the engine is shutting down.
                        let _ = wake.send(trigger);
                    }
                    std::thread::sleep(interval);
                }
            })
            .expect("failed to spawn resource monitor thread");

        *self.thread.lock() = Some(handle);
    }

    /// Stop the polling thread.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Whether the polling thread is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn take_sample(
    source: &Mutex<Box<dyn MemorySource>>,
    state: &Mutex<MonitorState>,
) -> Result<(MemoryProfile, Option<CycleTrigger>), EngineError> {
    let sampled = source.lock().sample();

    let mut state = state.lock();
    let Some(profile) = sampled else {
        state.sample_failures += 1;
        log::debug!(
            "Memory sample unavailable (failure {})",
            state.sample_failures
        );
        return Err(EngineError::PressureSampleUnavailable);
    };

    let capacity = state.tuning.history_capacity.max(1);
    while state.history.len() >= capacity {
        state.history.pop_front();
    }
    state.history.push_back(profile.clone());

    let next = classify(&profile, &state.tuning);
    let trend = trend_of(&state.history, state.tuning.trend_window);
    let prev = state.pressure.unwrap_or(PressureLevel::Normal);
    let now = profile.taken_at;

    let trigger = evaluate_transition(
        prev,
        next,
        trend,
        state.last_warning_trigger,
        state.last_critical_trigger,
        state.tuning.pressure_debounce,
        now,
    );
    match trigger {
        Some(CycleTrigger::WarningPressure) => {
            state.last_warning_trigger = Some(now);
            log::info!(
                "Memory pressure transition {:?} -> Warning at {} MB (trend {:?})",
                prev,
                profile.rss_mb(),
                trend
            );
        }
        Some(CycleTrigger::CriticalPressure) => {
            state.last_critical_trigger = Some(now);
            log::warn!(
                "Memory pressure transition {:?} -> Critical at {} MB, {} threads",
                prev,
                profile.rss_mb(),
                profile.thread_count
            );
        }
        _ => {
            if next != prev {
                log::debug!("Pressure level {:?} -> {:?} without cycle trigger", prev, next);
            }
        }
    }

    state.pressure = Some(next);
    state.trend = trend;
    Ok((profile, trigger))
}
