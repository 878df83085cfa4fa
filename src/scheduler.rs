//! Virtualization scheduler: pure rebalancing decisions.
//!
//! Given a registry view, the current visibility window, and the tuning
//! values, [`plan`] computes which tabs must be materialized, which should be
//! hibernated, and which hibernated snapshots are eviction candidates. The
//! function is pure (no state is mutated and no clocks are read), so the
//! optimizer can run it for real cycles and for dry-run analysis through the
//! exact same path.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::TabId;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::registry::{TabLifecycle, TabRecord, TabRegistry};

/// The tabs currently presentable to the user, in strip order, plus the
/// buffer margin pre-materialized around them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibilityWindow {
    /// Visible tab ids, in strip order.
    pub visible: Vec<TabId>,
    /// Tabs within this many strip positions of the visible span are
    /// pre-materialized to avoid flicker on scroll.
    pub buffer: usize,
}

impl VisibilityWindow {
    pub fn new(visible: Vec<TabId>, buffer: usize) -> Self {
        Self { visible, buffer }
    }

    /// The forced set: visible tabs plus every registered tab within
    /// `buffer` strip positions of the visible span.
    pub fn forced_set(&self, registry: &TabRegistry) -> HashSet<TabId> {
        let mut forced: HashSet<TabId> = self
            .visible
            .iter()
            .copied()
            .filter(|id| registry.contains(*id))
            .collect();
        if self.buffer == 0 || forced.is_empty() {
            return forced;
        }

        let order = registry.order();
        let positions: Vec<usize> = self
            .visible
            .iter()
            .filter_map(|id| registry.position(*id))
            .collect();
        if let (Some(&lo), Some(&hi)) = (positions.iter().min(), positions.iter().max()) {
            let start = lo.saturating_sub(self.buffer);
            let end = (hi + self.buffer).min(order.len().saturating_sub(1));
            for id in &order[start..=end] {
                forced.insert(*id);
            }
        }
        forced
    }

    /// Strip distance from `id` to the nearest edge of the visible span.
    /// Zero for tabs inside the span, `None` when the window is empty or the
    /// tab is unknown.
    pub fn distance(&self, id: TabId, registry: &TabRegistry) -> Option<usize> {
        let pos = registry.position(id)?;
        let positions: Vec<usize> = self
            .visible
            .iter()
            .filter_map(|v| registry.position(*v))
            .collect();
        let lo = *positions.iter().min()?;
        let hi = *positions.iter().max()?;
        Some(if pos < lo {
            lo - pos
        } else if pos > hi {
            pos - hi
        } else {
            0
        })
    }
}

/// Priority score for one tab. Higher keeps the tab materialized longer.
///
/// `distance` is the strip distance to the visible span (`None` when no
/// window exists). The score combines recency (exponential decay of idle
/// time), the pinned boost, proximity to the window, and the dirty boost,
/// all weighted from [`EngineConfig`].
pub fn priority_score(
    record: &TabRecord,
    distance: Option<usize>,
    config: &EngineConfig,
    now: Instant,
) -> f64 {
    let idle_secs = record.idle(now).as_secs_f64();
    let recency =
        config.recency_weight * (-idle_secs / config.recency_half_life_secs * 2f64.ln()).exp();

    let mut score = recency;
    if record.pinned {
        score += config.pinned_boost;
    }
    if let Some(d) = distance {
        score += config.visibility_weight / (1.0 + d as f64);
    }
    if record.dirty {
        score += config.dirty_boost;
    }
    score
}

/// The scheduler's decision for one rebalance pass.
///
/// Lists are deterministic given identical inputs: ordering falls back to
/// the registry's insertion sequence whenever priorities tie.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebalancePlan {
    /// Tabs forced Active by the visibility window (plus buffer).
    pub forced_active: Vec<TabId>,
    /// Forced tabs that are currently hibernated and need reactivation.
    pub reactivate: Vec<TabId>,
    /// Tabs to hibernate, lowest priority first.
    pub hibernate: Vec<TabId>,
    /// Hibernated tabs past retention with low enough priority to evict.
    pub evict_candidates: Vec<TabId>,
    /// Non-pinned Active tabs that stay materialized outside the window.
    pub retained: Vec<TabId>,
    /// The cap the plan was computed against.
    pub cap: usize,
}

impl RebalancePlan {
    /// Total tabs the plan leaves materialized (forced + retained; pinned
    /// tabs outside the window are counted in `retained_pinned`).
    pub fn materialized(&self) -> usize {
        self.forced_active.len() + self.retained.len()
    }
}

/// Compute a rebalance plan. Pure: reads the registry, mutates nothing.
///
/// `now` is passed in so analysis and tests can evaluate the same inputs
/// repeatedly and get identical output. Fails only when `cap < 1`.
pub fn plan(
    registry: &TabRegistry,
    window: &VisibilityWindow,
    cap: usize,
    retention: Duration,
    config: &EngineConfig,
    now: Instant,
) -> Result<RebalancePlan, EngineError> {
    if cap < 1 {
        return Err(EngineError::Configuration(
            "rebalance cap must be at least 1".into(),
        ));
    }

    // Step 1: the window (plus buffer) wins unconditionally. Resolved before
    // anything else so a forced tab can never also be chosen for eviction.
    let forced = window.forced_set(registry);
    let mut forced_active: Vec<TabId> = Vec::with_capacity(forced.len());
    let mut reactivate: Vec<TabId> = Vec::new();
    for record in registry.iter() {
        if !forced.contains(&record.id) {
            continue;
        }
        forced_active.push(record.id);
        if record.state != TabLifecycle::Active {
            reactivate.push(record.id);
        }
    }

    // Step 2: rank the remaining Active tabs. Pinned tabs are exempt from
    // hibernation but do not consume the budget either; they are reported
    // through `retained` like any other survivor.
    let mut ranked: Vec<(&TabRecord, f64)> = registry
        .iter()
        .filter(|r| r.state == TabLifecycle::Active && !forced.contains(&r.id) && !r.pinned)
        .map(|r| (r, priority_score(r, window.distance(r.id, registry), config, now)))
        .collect();
    ranked.sort_by(|(a, sa), (b, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.seq().cmp(&b.seq()))
    });

    let budget = cap.saturating_sub(forced_active.len());
    let keep = budget.min(ranked.len());
    let mut retained: Vec<TabId> = ranked[..keep].iter().map(|(r, _)| r.id).collect();
    let hibernate: Vec<TabId> = ranked[keep..].iter().rev().map(|(r, _)| r.id).collect();

    // Pinned survivors outside the window stay materialized regardless of
    // the budget.
    let mut pinned_retained: Vec<TabId> = registry
        .iter()
        .filter(|r| r.state == TabLifecycle::Active && !forced.contains(&r.id) && r.pinned)
        .map(|r| r.id)
        .collect();
    retained.append(&mut pinned_retained);

    // Step 4: stale hibernated snapshots with low enough priority become
    // eviction candidates. Never pinned tabs, never forced tabs.
    let cutoff = config.eviction_score_cutoff;
    let mut evict_candidates: Vec<TabId> = registry
        .iter()
        .filter(|r| {
            r.state == TabLifecycle::Hibernated && !r.pinned && !forced.contains(&r.id)
        })
        .filter(|r| r.hibernated_for(now).is_some_and(|d| d > retention))
        .filter(|r| priority_score(r, window.distance(r.id, registry), config, now) < cutoff)
        .map(|r| r.id)
        .collect();
    evict_candidates.sort_unstable();

    Ok(RebalancePlan {
        forced_active,
        reactivate,
        hibernate,
        evict_candidates,
        retained,
        cap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    /// Registry of `n` non-pinned Active tabs with ids 1..=n, all activated
    /// at `base`.
    fn registry(n: u64, base: Instant) -> TabRegistry {
        let mut registry = TabRegistry::new();
        for id in 1..=n {
            registry.insert(id, false, base).expect("unique id");
        }
        registry
    }

    #[test]
    fn test_plan_rejects_zero_cap() {
        let base = Instant::now();
        let reg = registry(3, base);
        let window = VisibilityWindow::new(vec![1], 0);
        let err = plan(
            &reg,
            &window,
            0,
            Duration::from_secs(60),
            &config(),
            base,
        )
        .expect_err("cap 0 must fail fast");
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_visible_tabs_are_forced_active() {
        let base = Instant::now();
        let mut reg = registry(5, base);
        reg.transition(3, TabLifecycle::Hibernated, 1, base);

        let window = VisibilityWindow::new(vec![2, 3], 0);
        let plan = plan(
            &reg,
            &window,
            2,
            Duration::from_secs(60),
            &config(),
            base,
        )
        .expect("valid plan");

        assert_eq!(plan.forced_active, vec![2, 3]);
        assert_eq!(plan.reactivate, vec![3], "hibernated visible tab reactivates");
        assert!(
            !plan.hibernate.contains(&2) && !plan.hibernate.contains(&3),
            "forced tabs are never hibernation picks"
        );
        assert!(plan.evict_candidates.is_empty());
    }

    #[test]
    fn test_cap_bounds_retained_tabs() {
        let base = Instant::now();
        // Stagger activation so priorities are distinct: higher id = more
        // recently active.
        let mut reg = registry(10, base);
        for id in 1..=10u64 {
            reg.touch(id, base + Duration::from_secs(id));
        }
        let now = base + Duration::from_secs(100);

        let window = VisibilityWindow::new(vec![10], 0);
        let plan = plan(
            &reg,
            &window,
            4,
            Duration::from_secs(3600),
            &config(),
            now,
        )
        .expect("valid plan");

        assert_eq!(plan.materialized(), 4, "forced + retained fit the cap");
        // Most recent non-forced tabs survive.
        assert_eq!(plan.retained, vec![9, 8, 7]);
        // The rest are hibernated, lowest priority (longest idle) first.
        assert_eq!(plan.hibernate, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_window_larger_than_cap_never_hibernates_visible() {
        let base = Instant::now();
        let reg = registry(6, base);
        let window = VisibilityWindow::new(vec![1, 2, 3, 4, 5], 0);
        let plan = plan(
            &reg,
            &window,
            2,
            Duration::from_secs(60),
            &config(),
            base,
        )
        .expect("valid plan");

        assert_eq!(plan.forced_active.len(), 5, "visible tabs always win");
        assert_eq!(plan.retained, Vec::<TabId>::new(), "budget is exhausted");
        assert_eq!(plan.hibernate, vec![6]);
    }

    #[test]
    fn test_pinned_tabs_exempt_but_retained() {
        let base = Instant::now();
        let mut reg = TabRegistry::new();
        reg.insert(1, true, base).expect("insert");
        reg.insert(2, false, base).expect("insert");
        reg.insert(3, false, base).expect("insert");
        // Pin is idle far longer than everything else.
        let now = base + Duration::from_secs(3600);
        reg.touch(2, now - Duration::from_secs(10));
        reg.touch(3, now - Duration::from_secs(5));

        let window = VisibilityWindow::new(vec![], 0);
        let plan = plan(
            &reg,
            &window,
            1,
            Duration::from_secs(60),
            &config(),
            now,
        )
        .expect("valid plan");

        assert!(plan.retained.contains(&1), "pinned tab survives the cap");
        assert!(!plan.hibernate.contains(&1), "pinned tab is never scheduled");
        assert_eq!(plan.hibernate, vec![2], "lowest-priority non-pinned goes");
    }

    #[test]
    fn test_basic_eviction_scenario() {
        // cap = 2; A pinned idle 1h, B idle 10s, C idle 5s, D just opened
        // and visible. Expect: D active (visible), C active (most recent
        // non-pinned), B hibernated, A active (pinned, exempt).
        let base = Instant::now();
        let now = base + Duration::from_secs(3600);
        let (a, b, c, d) = (1u64, 2u64, 3u64, 4u64);

        let mut reg = TabRegistry::new();
        reg.insert(a, true, base).expect("insert");
        reg.insert(b, false, base).expect("insert");
        reg.insert(c, false, base).expect("insert");
        reg.insert(d, false, base).expect("insert");
        reg.touch(b, now - Duration::from_secs(10));
        reg.touch(c, now - Duration::from_secs(5));
        reg.touch(d, now);

        let window = VisibilityWindow::new(vec![d], 0);
        let plan = plan(
            &reg,
            &window,
            2,
            Duration::from_secs(3600),
            &config(),
            now,
        )
        .expect("valid plan");

        assert_eq!(plan.forced_active, vec![d]);
        assert_eq!(
            plan.retained,
            vec![c, a],
            "C wins the remaining budget slot, A survives via pin exemption"
        );
        assert_eq!(plan.hibernate, vec![b]);
        assert!(plan.evict_candidates.is_empty());
    }

    #[test]
    fn test_deterministic_tie_break_by_insertion_order() {
        let base = Instant::now();
        // Identical records apart from insertion order.
        let reg = registry(4, base);
        let window = VisibilityWindow::new(vec![], 0);

        let first = plan(
            &reg,
            &window,
            2,
            Duration::from_secs(60),
            &config(),
            base,
        )
        .expect("valid plan");
        let second = plan(
            &reg,
            &window,
            2,
            Duration::from_secs(60),
            &config(),
            base,
        )
        .expect("valid plan");

        assert_eq!(first, second, "identical inputs give identical plans");
        // Earlier insertion wins ties: tabs 1 and 2 stay, 3 and 4 go.
        assert_eq!(first.retained, vec![1, 2]);
        assert_eq!(first.hibernate, vec![4, 3]);
    }

    #[test]
    fn test_eviction_candidates_respect_retention_and_cutoff() {
        let base = Instant::now();
        let now = base + Duration::from_secs(7200);
        let mut reg = registry(3, base);
        reg.transition(1, TabLifecycle::Hibernated, 1, base);
        reg.transition(2, TabLifecycle::Hibernated, 1, now - Duration::from_secs(10));

        let window = VisibilityWindow::new(vec![], 0);
        let plan = plan(
            &reg,
            &window,
            5,
            Duration::from_secs(1800),
            &config(),
            now,
        )
        .expect("valid plan");

        assert_eq!(
            plan.evict_candidates,
            vec![1],
            "only the snapshot past retention qualifies"
        );
    }

    #[test]
    fn test_dirty_hibernated_tab_is_not_evicted() {
        let base = Instant::now();
        let now = base + Duration::from_secs(7200);
        let mut reg = registry(2, base);
        reg.set_dirty(1, true);
        reg.transition(1, TabLifecycle::Hibernated, 1, base);
        reg.transition(2, TabLifecycle::Hibernated, 1, base);

        let window = VisibilityWindow::new(vec![], 0);
        let plan = plan(
            &reg,
            &window,
            5,
            Duration::from_secs(60),
            &config(),
            now,
        )
        .expect("valid plan");

        // The dirty boost (120) keeps tab 1 above the eviction cutoff (100).
        assert_eq!(plan.evict_candidates, vec![2]);
    }

    #[test]
    fn test_pinned_never_evicted_even_when_stale() {
        let base = Instant::now();
        let now = base + Duration::from_secs(100_000);
        let mut reg = TabRegistry::new();
        reg.insert(1, true, base).expect("insert");
        reg.transition(1, TabLifecycle::Hibernated, 1, base);

        let window = VisibilityWindow::new(vec![], 0);
        let plan = plan(&reg, &window, 1, Duration::from_secs(1), &config(), now)
            .expect("valid plan");
        assert!(
            plan.evict_candidates.is_empty(),
            "pinned tab must never be an eviction candidate"
        );
    }

    #[test]
    fn test_buffer_expands_forced_set_in_strip_order() {
        let base = Instant::now();
        let reg = registry(7, base);
        let window = VisibilityWindow::new(vec![3, 4], 2);
        let forced = window.forced_set(&reg);
        // Positions 0..=5 of the strip: tabs 1..=6.
        for id in 1..=6u64 {
            assert!(forced.contains(&id), "tab {id} within buffer reach");
        }
        assert!(!forced.contains(&7));
    }

    #[test]
    fn test_priority_score_components() {
        let base = Instant::now();
        let now = base + Duration::from_secs(300);
        let mut reg = TabRegistry::new();
        reg.insert(1, false, base).expect("insert");
        reg.insert(2, true, base).expect("insert");
        let cfg = config();

        let plain = priority_score(reg.get(1).expect("present"), None, &cfg, now);
        let pinned = priority_score(reg.get(2).expect("present"), None, &cfg, now);
        assert!(
            (pinned - plain - cfg.pinned_boost).abs() < 1e-9,
            "pin adds exactly the configured boost"
        );

        // One half-life of idle halves the recency term.
        let fresh = priority_score(reg.get(1).expect("present"), None, &cfg, base);
        assert!((fresh - cfg.recency_weight).abs() < 1e-9);
        assert!((plain - cfg.recency_weight / 2.0).abs() < 1e-6);

        // Proximity decays with strip distance.
        reg.insert(3, false, base).expect("insert");
        let window = VisibilityWindow::new(vec![1], 0);
        let near = priority_score(
            reg.get(2).expect("present"),
            window.distance(2, &reg),
            &cfg,
            base,
        );
        let far = priority_score(
            reg.get(3).expect("present"),
            window.distance(3, &reg),
            &cfg,
            base,
        );
        assert!(near > far, "closer to the window scores higher");
    }
}
