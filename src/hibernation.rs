//! Hibernation engine: reversible state compaction for tabs.
//!
//! Wraps the collaborator's capture/restore/release calls with the level
//! selection policy, the idempotence and consume-once rules, and a timeout
//! bound. Collaborator calls run on a named throwaway thread and are waited
//! on with `mpsc::recv_timeout`; a late completion sends into a dropped
//! receiver and its result is discarded, which is also what makes an
//! operation targeting an unregistered tab a no-op. At most one worker runs
//! per tab at a time: a retry arriving while a timed-out worker is still
//! inside the collaborator waits for it to drain instead of racing it.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::TabId;
use crate::collaborator::TabCollaborator;
use crate::config::EngineConfig;
use crate::error::{EngineError, TabOperation};
use crate::registry::TabRecord;
use crate::snapshot::{HibernationSnapshot, PreservationLevel, SnapshotStore, TabStateSnapshot};

/// Running totals for hibernation activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HibernationStats {
    /// Snapshots successfully captured and stored.
    pub hibernations: u64,
    /// Snapshots successfully restored and consumed.
    pub reactivations: u64,
    /// Collaborator failures across both operations.
    pub failures: u64,
    /// Operations that exceeded the configured bound.
    pub timeouts: u64,
}

/// Tabs with a collaborator worker currently running. An entry outlives a
/// timed-out wait: the worker itself clears it once the call returns, so at
/// most one worker ever runs against a given tab.
#[derive(Default)]
struct OutstandingWorkers {
    tabs: Mutex<HashSet<TabId>>,
    drained: Condvar,
}

/// Owns the snapshots of hibernated tabs and drives the collaborator.
pub struct HibernationEngine {
    collaborator: Arc<dyn TabCollaborator>,
    store: Mutex<SnapshotStore>,
    stats: Mutex<HibernationStats>,
    workers: Arc<OutstandingWorkers>,
}

impl HibernationEngine {
    pub fn new(collaborator: Arc<dyn TabCollaborator>) -> Self {
        Self {
            collaborator,
            store: Mutex::new(SnapshotStore::new()),
            stats: Mutex::new(HibernationStats::default()),
            workers: Arc::new(OutstandingWorkers::default()),
        }
    }

    /// Preservation level for a tab: Full only when it has pending edits,
    /// Extended when its history is non-trivial, Basic otherwise. Never
    /// over-preserves beyond what reactivation plausibly needs.
    pub fn select_level(record: &TabRecord, config: &EngineConfig) -> PreservationLevel {
        if record.dirty {
            PreservationLevel::Full
        } else if record.history_depth > config.extended_history_threshold {
            PreservationLevel::Extended
        } else {
            PreservationLevel::Basic
        }
    }

    /// Capture and store a snapshot for `tab`, then release its live
    /// resources. Idempotent: a tab that already has a stored snapshot is
    /// returned as-is with no collaborator traffic.
    ///
    /// Both collaborator calls are bounded by `timeout`; any failure or
    /// timeout leaves the tab's live state untouched (the caller keeps the
    /// record `Active`, failing safe toward memory use, not data loss).
    pub fn hibernate(
        &self,
        tab: TabId,
        level: PreservationLevel,
        config: &EngineConfig,
    ) -> Result<usize, EngineError> {
        if let Some(existing) = self.store.lock().get(tab) {
            log::debug!(
                "Tab {tab} already hibernated at {:?}, reusing snapshot",
                existing.level
            );
            return Ok(existing.estimated_bytes);
        }

        let timeout = config.op_timeout();
        let payload = self.bounded_capture(tab, level, timeout)?;
        let payload = payload.truncated_to(level, config.history_keep);
        let snapshot = HibernationSnapshot::new(tab, level, payload);
        let bytes = snapshot.estimated_bytes;

        // A failed or timed-out release means the live state was never let
        // go; drop the capture and leave the tab fully Active.
        self.bounded_release(tab, timeout)?;

        self.store.lock().insert(snapshot);
        self.stats.lock().hibernations += 1;
        log::info!("Hibernated tab {tab} at {level:?} ({bytes} bytes retained)");
        Ok(bytes)
    }

    /// Restore `tab` from its stored snapshot and discard the snapshot.
    ///
    /// `SnapshotMissing` when no snapshot is stored (registry/engine desync;
    /// the caller self-heals the record to Active). A timed-out restore
    /// keeps the snapshot stored so the operation can be retried.
    pub fn reactivate(&self, tab: TabId, config: &EngineConfig) -> Result<(), EngineError> {
        let Some(snapshot) = self.store.lock().get(tab).cloned() else {
            log::error!("Consistency violation: reactivate of tab {tab} with no stored snapshot");
            return Err(EngineError::SnapshotMissing(tab));
        };

        self.bounded_restore(tab, snapshot.payload, config.op_timeout())?;
        self.store.lock().remove(tab);
        self.stats.lock().reactivations += 1;
        log::info!("Reactivated tab {tab} from {:?} snapshot", snapshot.level);
        Ok(())
    }

    /// Drop a tab's snapshot without restoring it (eviction or unregister).
    /// Returns the discarded snapshot's estimated size, if one was stored.
    pub fn discard(&self, tab: TabId) -> Option<usize> {
        self.store
            .lock()
            .remove(tab)
            .map(|snapshot| snapshot.estimated_bytes)
    }

    /// Whether a snapshot is currently stored for `tab`.
    pub fn has_snapshot(&self, tab: TabId) -> bool {
        self.store.lock().contains(tab)
    }

    /// The stored snapshot's level and estimated size, if any.
    pub fn snapshot_info(&self, tab: TabId) -> Option<(PreservationLevel, usize)> {
        self.store
            .lock()
            .get(tab)
            .map(|snapshot| (snapshot.level, snapshot.estimated_bytes))
    }

    /// Number of stored snapshots.
    pub fn snapshot_count(&self) -> usize {
        self.store.lock().len()
    }

    /// Total estimated bytes retained across stored snapshots.
    pub fn retained_bytes(&self) -> usize {
        self.store.lock().total_bytes()
    }

    /// Tabs whose snapshots are older than `older_than`.
    pub fn stale_snapshots(&self, older_than: Duration, now: Instant) -> Vec<TabId> {
        self.store.lock().stale(older_than, now)
    }

    /// Release spare store capacity after a batch of evictions.
    pub fn compact(&self) {
        self.store.lock().compact();
    }

    pub fn stats(&self) -> HibernationStats {
        *self.stats.lock()
    }

    // ----------------------------------------------------------------------
    // Bounded collaborator calls
    // ----------------------------------------------------------------------

    fn bounded_capture(
        &self,
        tab: TabId,
        level: PreservationLevel,
        timeout: Duration,
    ) -> Result<TabStateSnapshot, EngineError> {
        let collaborator = Arc::clone(&self.collaborator);
        self.bounded(tab, TabOperation::Hibernate, timeout, move || {
            collaborator.capture(tab, level)
        })
    }

    fn bounded_release(&self, tab: TabId, timeout: Duration) -> Result<(), EngineError> {
        let collaborator = Arc::clone(&self.collaborator);
        self.bounded(tab, TabOperation::Hibernate, timeout, move || {
            collaborator.release(tab)
        })
    }

    fn bounded_restore(
        &self,
        tab: TabId,
        payload: TabStateSnapshot,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let collaborator = Arc::clone(&self.collaborator);
        self.bounded(tab, TabOperation::Reactivate, timeout, move || {
            collaborator.restore(tab, &payload)
        })
    }

    /// Run `call` on a named throwaway thread and wait up to `timeout`.
    /// A late completion's result goes to a dropped receiver and vanishes,
    /// but the tab stays marked outstanding until the worker returns, so a
    /// retry waits on the previous worker instead of racing it.
    fn bounded<T, F>(
        &self,
        tab: TabId,
        op: TabOperation,
        timeout: Duration,
        call: F,
    ) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        {
            let mut tabs = self.workers.tabs.lock();
            while tabs.contains(&tab) {
                if self
                    .workers
                    .drained
                    .wait_until(&mut tabs, deadline)
                    .timed_out()
                {
                    drop(tabs);
                    let mut stats = self.stats.lock();
                    stats.timeouts += 1;
                    stats.failures += 1;
                    drop(stats);
                    log::warn!(
                        "{op} of tab {tab} refused: previous worker still running after {timeout:?}"
                    );
                    return Err(EngineError::OperationTimeout {
                        tab,
                        op,
                        waited: timeout,
                    });
                }
            }
            tabs.insert(tab);
        }

        let (tx, rx) = mpsc::channel();
        let workers = Arc::clone(&self.workers);
        let spawned = std::thread::Builder::new()
            .name(format!("cabinet-tabs-{op}-{tab}"))
            .spawn(move || {
                let _ = tx.send(call());
                workers.tabs.lock().remove(&tab);
                workers.drained.notify_all();
            });
        if let Err(err) = spawned {
            self.workers.tabs.lock().remove(&tab);
            self.workers.drained.notify_all();
            self.stats.lock().failures += 1;
            return Err(EngineError::Collaborator {
                tab,
                op,
                detail: format!("failed to spawn worker: {err}"),
            });
        }

        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => {
                self.stats.lock().failures += 1;
                log::warn!("Collaborator {op} failed for tab {tab}: {source:#}");
                Err(EngineError::collaborator(tab, op, &source))
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let mut stats = self.stats.lock();
                stats.timeouts += 1;
                stats.failures += 1;
                drop(stats);
                log::warn!("{op} of tab {tab} timed out after {timeout:?}");
                Err(EngineError::OperationTimeout {
                    tab,
                    op,
                    waited: timeout,
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.stats.lock().failures += 1;
                Err(EngineError::Collaborator {
                    tab,
                    op,
                    detail: "worker terminated without a result".into(),
                })
            }
        }
    }
}

impl std::fmt::Debug for HibernationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HibernationEngine")
            .field("snapshots", &self.snapshot_count())
            .field("retained_bytes", &self.retained_bytes())
            .finish_non_exhaustive()
    }
}
