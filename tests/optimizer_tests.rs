//! Optimization-cycle and dry-run analysis behavior.
//!
//! Covers:
//!
//! - **Dry-run purity**: `analyze()` mutates nothing and is stable across
//!   repeated calls with unchanged inputs.
//! - **Pressure escalation**: only the transition into Critical runs the
//!   emergency pass (Warning-to-Warning movement never does).
//! - **Emergency pass**: lowered cap and stale-snapshot eviction under
//!   Critical pressure.
//! - **Degradation**: an unavailable memory sample runs the default pass.
//! - **Cache trims**: registered auxiliary caches shrink during cycles.
//! - **In-flight coalescing**: a duplicate request for a tab whose operation
//!   is still running folds into it instead of repeating the work.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cabinet_tabs::{
    EngineError, ItemViewCache, PressureLevel, RecommendedAction, TabCollaborator, TabEngine,
    TabLifecycle,
};
use common::{ScriptedCollaborator, ScriptedMemory, engine_with, engine_with_memory, test_config};

// ============================================================================
// Dry-run purity
// ============================================================================

#[test]
fn test_analyze_mutates_nothing() {
    let collab = ScriptedCollaborator::new();
    let engine = engine_with(&collab, 2);
    for id in 1..=6u64 {
        collab.seed(id, &format!("/dir/{id}"));
        engine.register_tab(id, false).expect("register");
    }
    collab.set_visible(&[1]);

    let recommendation = engine.analyze().expect("analysis succeeds");
    assert!(
        recommendation
            .actions
            .iter()
            .any(|a| matches!(a, RecommendedAction::Hibernate { .. })),
        "tabs beyond the cap are recommended for hibernation"
    );

    // Nothing moved: no hibernations, no snapshots, no collaborator calls.
    let stats = engine.stats();
    assert_eq!(stats.active, 6);
    assert_eq!(stats.hibernated, 0);
    assert_eq!(stats.snapshot_count, 0);
    assert_eq!(*collab.captures.lock(), 0);
}

#[test]
fn test_analyze_is_stable_across_repeated_calls() {
    let collab = ScriptedCollaborator::new();
    let engine = engine_with(&collab, 2);
    for id in 1..=5u64 {
        collab.seed(id, &format!("/dir/{id}"));
        engine.register_tab(id, false).expect("register");
    }
    collab.set_visible(&[5]);

    let first = engine.analyze().expect("first analysis");
    let second = engine.analyze().expect("second analysis");

    let tabs = |rec: &cabinet_tabs::OptimizationRecommendation| {
        rec.actions
            .iter()
            .filter_map(|a| match a {
                RecommendedAction::Hibernate { tab, .. } => Some(*tab),
                _ => None,
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(tabs(&first), tabs(&second), "equivalent recommendations");
    assert_eq!(first.materialized, second.materialized);
}

// ============================================================================
// Pressure escalation
// ============================================================================

#[test]
fn test_escalation_runs_exactly_one_emergency_cycle() {
    // Thresholds 500/800 MB; samples 480, 520, 760, 820 across four cycles.
    // The 520 -> 760 movement stays inside Warning and must not escalate;
    // only the 820 sample runs the emergency pass.
    let collab = ScriptedCollaborator::new();
    let engine = engine_with_memory(&collab, 22, &[480, 520, 760, 820]);
    collab.seed(1, "/only");
    engine.register_tab(1, false).expect("register");

    let mut emergencies = 0;
    for expected_pressure in [
        PressureLevel::Normal,
        PressureLevel::Warning,
        PressureLevel::Warning,
        PressureLevel::Critical,
    ] {
        let summary = engine.run_cycle_now();
        assert_eq!(summary.pressure, Some(expected_pressure));
        if summary.emergency {
            emergencies += 1;
        }
    }
    assert_eq!(emergencies, 1, "exactly one emergency cycle, at 820 MB");
}

// ============================================================================
// Emergency pass
// ============================================================================

#[test]
fn test_emergency_pass_lowers_cap_and_evicts_stale_snapshots() {
    let collab = ScriptedCollaborator::new();
    // 8 would normally stay live; the emergency cap is max(4, 8/2) = 4.
    let engine = engine_with_memory(&collab, 8, &[900]);
    for id in 1..=10u64 {
        collab.seed(id, &format!("/dir/{id}"));
        engine.register_tab(id, false).expect("register");
    }
    collab.set_visible(&[]);

    let first = engine.run_cycle_now();
    assert!(first.emergency);
    assert!(
        engine.stats().active <= 4,
        "emergency pass enforces the lowered cap"
    );

    // Snapshots from the first cycle are stale by the second (test retention
    // is zero) and the emergency pass evicts them.
    std::thread::sleep(Duration::from_millis(10));
    let second = engine.run_cycle_now();
    assert!(
        !second.evicted.is_empty(),
        "stale snapshots are evicted under critical pressure"
    );
    let stats = engine.stats();
    assert_eq!(stats.hibernated + stats.evicted + stats.active, 10);
    assert!(stats.evicted > 0);
}

#[test]
fn test_normal_cycle_only_surfaces_eviction_candidates() {
    let collab = ScriptedCollaborator::new();
    let engine = engine_with(&collab, 2);
    for id in 1..=4u64 {
        collab.seed(id, &format!("/dir/{id}"));
        engine.register_tab(id, false).expect("register");
    }
    collab.set_visible(&[]);

    engine.run_cycle_now();
    std::thread::sleep(Duration::from_millis(10));

    // Aggressive eviction is off and pressure is Normal: candidates show up
    // in the recommendation but no cycle evicts them.
    let recommendation = engine.analyze().expect("analysis");
    assert!(
        recommendation
            .actions
            .iter()
            .any(|a| matches!(a, RecommendedAction::Evict { .. })),
        "stale snapshots are surfaced as candidates"
    );
    let summary = engine.run_cycle_now();
    assert!(summary.evicted.is_empty());
    assert_eq!(engine.stats().evicted, 0);
}

#[test]
fn test_aggressive_eviction_acts_on_candidates() {
    let collab = ScriptedCollaborator::new();
    let mut config = test_config(2);
    config.aggressive_eviction = true;
    let engine = TabEngine::with_memory_source(
        Arc::clone(&collab) as Arc<dyn TabCollaborator>,
        config,
        ScriptedMemory::new(&[100]),
    )
    .expect("valid config");
    for id in 1..=4u64 {
        collab.seed(id, &format!("/dir/{id}"));
        engine.register_tab(id, false).expect("register");
    }
    collab.set_visible(&[]);

    engine.run_cycle_now();
    std::thread::sleep(Duration::from_millis(10));
    let summary = engine.run_cycle_now();

    assert!(!summary.evicted.is_empty(), "opt-in eviction acts immediately");
    assert_eq!(engine.stats().snapshot_count, 0, "evicted snapshots are gone");
}

// ============================================================================
// Degradation on a failed sample
// ============================================================================

#[test]
fn test_unavailable_sample_degrades_to_default_pass() {
    let collab = ScriptedCollaborator::new();
    let engine = TabEngine::with_memory_source(
        Arc::clone(&collab) as Arc<dyn TabCollaborator>,
        test_config(2),
        ScriptedMemory::unavailable(),
    )
    .expect("valid config");
    for id in 1..=4u64 {
        collab.seed(id, &format!("/dir/{id}"));
        engine.register_tab(id, false).expect("register");
    }
    collab.set_visible(&[]);

    let summary = engine.run_cycle_now();

    assert_eq!(summary.pressure, None, "pressure unknown");
    assert!(!summary.emergency, "unknown pressure never escalates");
    assert!(
        summary
            .failures
            .contains(&EngineError::PressureSampleUnavailable),
        "the failed read is recorded in the summary"
    );
    // The default pass still rebalanced.
    assert_eq!(engine.stats().active, 2);
    assert_eq!(engine.stats().hibernated, 2);
}

// ============================================================================
// Cache trims
// ============================================================================

#[test]
fn test_cycle_trims_registered_caches() {
    let collab = ScriptedCollaborator::new();
    let engine = engine_with(&collab, 5);
    let views: Arc<ItemViewCache<u64, String>> = Arc::new(ItemViewCache::new("views", 32));
    for i in 0..16u64 {
        views.insert(i, format!("view-{i}"));
    }
    engine.register_cache(Arc::clone(&views) as _);

    let summary = engine.run_cycle_now();

    assert_eq!(summary.cache_entries_trimmed, 8, "normal trim halves the cache");
    assert_eq!(cabinet_tabs::TrimmableCache::len(views.as_ref()), 8);
}

#[test]
fn test_emergency_cycle_trims_aggressively() {
    let collab = ScriptedCollaborator::new();
    let engine = engine_with_memory(&collab, 5, &[900]);
    let views: Arc<ItemViewCache<u64, String>> = Arc::new(ItemViewCache::new("views", 32));
    for i in 0..16u64 {
        views.insert(i, format!("view-{i}"));
    }
    engine.register_cache(Arc::clone(&views) as _);

    let summary = engine.run_cycle_now();

    assert!(summary.emergency);
    assert_eq!(
        summary.cache_entries_trimmed, 12,
        "aggressive trim keeps only a quarter"
    );
}

// ============================================================================
// Cycle summaries
// ============================================================================

#[test]
fn test_cycle_summaries_are_retained_in_order() {
    let collab = ScriptedCollaborator::new();
    let engine = engine_with(&collab, 5);
    collab.seed(1, "/a");
    engine.register_tab(1, false).expect("register");

    assert!(engine.last_cycle().is_none());
    engine.run_cycle_now();
    engine.run_cycle_now();
    engine.run_cycle_now();

    let cycles = engine.recent_cycles();
    assert_eq!(cycles.len(), 3);
    assert!(
        cycles.windows(2).all(|w| w[0].cycle < w[1].cycle),
        "summaries are ordered oldest first"
    );
    assert_eq!(
        engine.last_cycle().expect("ran").cycle,
        cycles.last().expect("non-empty").cycle
    );
    assert!(engine.stats().last_cycle_ms.is_some());
}

// ============================================================================
// In-flight coalescing
// ============================================================================

#[test]
fn test_duplicate_request_during_in_flight_operation_coalesces() {
    let collab = ScriptedCollaborator::new();
    let mut config = test_config(5);
    // Generous bound: the slow collaborator finishes inside it.
    config.op_timeout_ms = 1000;
    let engine = Arc::new(
        TabEngine::with_memory_source(
            Arc::clone(&collab) as Arc<dyn TabCollaborator>,
            config,
            ScriptedMemory::new(&[100]),
        )
        .expect("valid test configuration"),
    );
    collab.seed(1, "/busy");
    engine.register_tab(1, false).expect("register");
    engine.hibernate_tab(1).expect("hibernate");

    // A slow restore holds the tab's in-flight slot for ~300ms.
    collab.mark_slow(1);
    let background = {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || engine.reactivate_tab(1))
    };
    std::thread::sleep(Duration::from_millis(100));

    // The duplicate lands while the restore is running: it is recorded as
    // the follow-up of the outstanding operation and reports success without
    // a second restore.
    engine.reactivate_tab(1).expect("coalesced request succeeds");
    background
        .join()
        .expect("no panic")
        .expect("in-flight restore succeeds");

    assert_eq!(*collab.restores.lock(), 1, "the restore ran exactly once");
    assert_eq!(
        engine.tab_record(1).expect("present").state,
        TabLifecycle::Active
    );
    assert_eq!(engine.stats().snapshot_count, 0, "snapshot consumed once");
}
