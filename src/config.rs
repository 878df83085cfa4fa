//! Runtime-tunable configuration for the tab engine.
//!
//! All knobs live in [`EngineConfig`] with conservative defaults suitable for
//! a shell with a few hundred open tabs. Runtime reconfiguration goes through
//! the partial [`ConfigUpdate`] so callers can adjust one value at a time;
//! an update that fails validation is rejected as a whole and the previous
//! configuration is retained.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Default hard cap on simultaneously materialized tabs.
pub const DEFAULT_MAX_MATERIALIZED_TABS: usize = 22;

/// Tuning values for scheduling, hibernation, pressure response, and the
/// priority function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard cap on simultaneously materialized (Active) tabs. Visible tabs
    /// always win even when the visibility window alone exceeds this.
    pub max_materialized_tabs: usize,

    /// Tabs adjacent to the visible range (per side, in strip order) that are
    /// pre-materialized to avoid flicker on scroll.
    pub buffer_tabs: usize,

    /// Process RSS above this many MB classifies as Warning pressure.
    pub warning_threshold_mb: u64,

    /// Process RSS above this many MB classifies as Critical pressure.
    pub critical_threshold_mb: u64,

    /// Process thread count at or above this classifies as Critical pressure.
    pub critical_thread_count: usize,

    /// Interval between background optimization cycles.
    pub cycle_interval_secs: u64,

    /// Interval between resource monitor samples.
    pub monitor_interval_secs: f32,

    /// Minimum spacing between two pressure-triggered cycles of the same
    /// level (warning-triggered and critical-triggered cycles are tracked
    /// separately).
    pub pressure_debounce_secs: u64,

    /// Capacity of the rolling memory-sample history.
    pub history_capacity: usize,

    /// Number of recent samples compared to classify the short-term trend.
    pub trend_window: usize,

    /// How long a tab may stay hibernated before its snapshot becomes an
    /// eviction candidate.
    pub retention_secs: u64,

    /// Tighter retention applied by the emergency pass under Critical
    /// pressure.
    pub emergency_retention_secs: u64,

    /// Bound on a single collaborator hibernate/reactivate call.
    pub op_timeout_ms: u64,

    /// When true, eviction candidates are evicted during every cycle rather
    /// than only surfaced as recommendations (emergency passes always evict).
    pub aggressive_eviction: bool,

    /// Hibernated tabs scoring below this are eligible for eviction once
    /// past retention. The default keeps dirty tabs (which carry the dirty
    /// boost) out of eviction range.
    pub eviction_score_cutoff: f64,

    // ------------------------------------------------------------------
    // Priority function weights
    // ------------------------------------------------------------------
    /// Weight of the recency term (exponential decay of idle time).
    pub recency_weight: f64,

    /// Idle time at which the recency term halves.
    pub recency_half_life_secs: f64,

    /// Constant boost for pinned tabs.
    pub pinned_boost: f64,

    /// Weight of the proximity-to-window term.
    pub visibility_weight: f64,

    /// Boost for tabs with unsaved/pending edits.
    pub dirty_boost: f64,

    // ------------------------------------------------------------------
    // Snapshot bounds
    // ------------------------------------------------------------------
    /// Navigation-history depth above which hibernation captures at the
    /// Extended level instead of Basic.
    pub extended_history_threshold: usize,

    /// Most-recent history entries retained in an Extended or Full snapshot.
    pub history_keep: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_materialized_tabs: DEFAULT_MAX_MATERIALIZED_TABS,
            buffer_tabs: 2,
            warning_threshold_mb: 1024,
            critical_threshold_mb: 1536,
            critical_thread_count: 512,
            cycle_interval_secs: 180,
            monitor_interval_secs: 2.0,
            pressure_debounce_secs: 30,
            history_capacity: 64,
            trend_window: 4,
            retention_secs: 30 * 60,
            emergency_retention_secs: 5 * 60,
            op_timeout_ms: 5_000,
            aggressive_eviction: false,
            eviction_score_cutoff: 100.0,
            recency_weight: 100.0,
            recency_half_life_secs: 300.0,
            pinned_boost: 250.0,
            visibility_weight: 150.0,
            dirty_boost: 120.0,
            extended_history_threshold: 3,
            history_keep: 16,
        }
    }
}

impl EngineConfig {
    /// Validate semantic constraints. Returns every problem found joined into
    /// a single [`EngineError::Configuration`] so callers see the full list.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut problems: Vec<String> = Vec::new();

        if self.max_materialized_tabs < 1 {
            problems.push("max_materialized_tabs must be at least 1".into());
        }
        if self.warning_threshold_mb >= self.critical_threshold_mb {
            problems.push(format!(
                "warning_threshold_mb ({}) must be below critical_threshold_mb ({})",
                self.warning_threshold_mb, self.critical_threshold_mb
            ));
        }
        if self.critical_thread_count == 0 {
            problems.push("critical_thread_count must be at least 1".into());
        }
        if self.cycle_interval_secs == 0 {
            problems.push("cycle_interval_secs must be at least 1".into());
        }
        if !self.monitor_interval_secs.is_finite() || self.monitor_interval_secs <= 0.0 {
            problems.push("monitor_interval_secs must be positive".into());
        }
        if self.trend_window < 2 {
            problems.push("trend_window must be at least 2".into());
        }
        if self.history_capacity < self.trend_window {
            problems.push(format!(
                "history_capacity ({}) must be at least trend_window ({})",
                self.history_capacity, self.trend_window
            ));
        }
        if self.emergency_retention_secs > self.retention_secs {
            problems.push(format!(
                "emergency_retention_secs ({}) must not exceed retention_secs ({})",
                self.emergency_retention_secs, self.retention_secs
            ));
        }
        if self.op_timeout_ms == 0 {
            problems.push("op_timeout_ms must be at least 1".into());
        }
        for (name, value) in [
            ("eviction_score_cutoff", self.eviction_score_cutoff),
            ("recency_weight", self.recency_weight),
            ("pinned_boost", self.pinned_boost),
            ("visibility_weight", self.visibility_weight),
            ("dirty_boost", self.dirty_boost),
        ] {
            if !value.is_finite() || value < 0.0 {
                problems.push(format!("{name} must be a finite non-negative number"));
            }
        }
        if !self.recency_half_life_secs.is_finite() || self.recency_half_life_secs <= 0.0 {
            problems.push("recency_half_life_secs must be positive".into());
        }
        if self.history_keep == 0 {
            problems.push("history_keep must be at least 1".into());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Configuration(problems.join("; ")))
        }
    }

    /// Cycle interval as a [`Duration`].
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    /// Monitor sampling interval as a [`Duration`].
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs_f32(self.monitor_interval_secs.max(0.1))
    }

    /// Pressure-trigger debounce as a [`Duration`].
    pub fn pressure_debounce(&self) -> Duration {
        Duration::from_secs(self.pressure_debounce_secs)
    }

    /// Normal hibernation retention as a [`Duration`].
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Emergency-pass retention as a [`Duration`].
    pub fn emergency_retention(&self) -> Duration {
        Duration::from_secs(self.emergency_retention_secs)
    }

    /// Collaborator operation bound as a [`Duration`].
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    /// Temporarily lowered cap applied by the emergency pass.
    pub fn emergency_cap(&self) -> usize {
        (self.max_materialized_tabs / 2)
            .max(4)
            .min(self.max_materialized_tabs.max(1))
    }
}

/// Partial configuration update. Every field is optional; unset fields keep
/// their current value. The merged result is validated as a whole before it
/// replaces the active configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub max_materialized_tabs: Option<usize>,
    pub buffer_tabs: Option<usize>,
    pub warning_threshold_mb: Option<u64>,
    pub critical_threshold_mb: Option<u64>,
    pub cycle_interval_secs: Option<u64>,
    pub aggressive_eviction: Option<bool>,
    pub retention_secs: Option<u64>,
    pub op_timeout_ms: Option<u64>,
}

impl ConfigUpdate {
    /// Apply this update on top of `base` and validate the result. On error
    /// the base configuration is untouched and should remain in effect.
    pub fn merged_into(&self, base: &EngineConfig) -> Result<EngineConfig, EngineError> {
        let mut next = base.clone();
        if let Some(cap) = self.max_materialized_tabs {
            next.max_materialized_tabs = cap;
        }
        if let Some(buffer) = self.buffer_tabs {
            next.buffer_tabs = buffer;
        }
        if let Some(mb) = self.warning_threshold_mb {
            next.warning_threshold_mb = mb;
        }
        if let Some(mb) = self.critical_threshold_mb {
            next.critical_threshold_mb = mb;
        }
        if let Some(secs) = self.cycle_interval_secs {
            next.cycle_interval_secs = secs;
        }
        if let Some(aggressive) = self.aggressive_eviction {
            next.aggressive_eviction = aggressive;
        }
        if let Some(secs) = self.retention_secs {
            next.retention_secs = secs;
        }
        if let Some(ms) = self.op_timeout_ms {
            next.op_timeout_ms = ms;
        }
        next.validate()?;
        Ok(next)
    }

    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        *self == ConfigUpdate::default()
    }
}
