//! Typed error types for the tab engine.
//!
//! This module provides structured error types so callers at the crate boundary
//! can match on specific error variants instead of relying on opaque `anyhow`
//! strings. Collaborator failures arrive as `anyhow::Error` and are flattened
//! into the [`EngineError::Collaborator`] variant where they cross back into
//! the core.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::TabId;

/// The two state-changing operations the engine performs against a tab's
/// collaborator. Used in timeout reporting and in-flight bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TabOperation {
    /// Capture a snapshot and release the tab's live resources.
    Hibernate,
    /// Restore a tab's live state from its stored snapshot.
    Reactivate,
}

impl fmt::Display for TabOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TabOperation::Hibernate => write!(f, "hibernate"),
            TabOperation::Reactivate => write!(f, "reactivate"),
        }
    }
}

/// Top-level error type for the tab resource-management engine.
///
/// Covers the failure categories callers may want to distinguish:
/// - Registration conflicts
/// - Snapshot store / registry desynchronization
/// - Invalid runtime configuration
/// - Timed-out or failed collaborator operations
/// - Resource monitor read failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------
    /// The tab id is already present in the registry. Caller bug; reported,
    /// not retried.
    #[error("tab {0} is already registered")]
    DuplicateId(TabId),

    // -----------------------------------------------------------------------
    // Hibernation / reactivation
    // -----------------------------------------------------------------------
    /// A reactivation was requested for a tab with no stored snapshot.
    /// Indicates a scheduler/registry desynchronization; the engine logs it
    /// as a consistency violation and self-heals the record back to Active.
    #[error("no hibernation snapshot stored for tab {0}")]
    SnapshotMissing(TabId),

    /// A collaborator call exceeded its configured bound. A timed-out
    /// hibernate leaves the tab Active; a timed-out reactivate leaves the
    /// snapshot stored so the operation can be retried.
    #[error("{op} of tab {tab} timed out after {waited:?}")]
    OperationTimeout {
        /// Tab the operation targeted.
        tab: TabId,
        /// Which operation timed out.
        op: TabOperation,
        /// The configured bound that was exceeded.
        waited: Duration,
    },

    /// The collaborator reported a failure (or its worker terminated) while
    /// capturing, restoring, or releasing tab state.
    #[error("collaborator {op} failed for tab {tab}: {detail}")]
    Collaborator {
        /// Tab the operation targeted.
        tab: TabId,
        /// Which operation failed.
        op: TabOperation,
        /// Flattened collaborator error message.
        detail: String,
    },

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------
    /// Invalid tuning values; rejected at configure time with the previous
    /// configuration retained.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    // -----------------------------------------------------------------------
    // Monitoring
    // -----------------------------------------------------------------------
    /// The resource monitor could not read a memory sample. The cycle that
    /// observed it runs its default, non-emergency pass.
    #[error("memory pressure sample unavailable")]
    PressureSampleUnavailable,
}

impl EngineError {
    /// Flatten a collaborator-side `anyhow` error into a typed variant.
    pub fn collaborator(tab: TabId, op: TabOperation, source: &anyhow::Error) -> Self {
        EngineError::Collaborator {
            tab,
            op,
            detail: format!("{source:#}"),
        }
    }

    /// The tab this error concerns, if any. Used when collecting isolated
    /// per-tab failures into a cycle summary.
    pub fn tab(&self) -> Option<TabId> {
        match self {
            EngineError::DuplicateId(tab)
            | EngineError::SnapshotMissing(tab)
            | EngineError::OperationTimeout { tab, .. }
            | EngineError::Collaborator { tab, .. } => Some(*tab),
            EngineError::Configuration(_) | EngineError::PressureSampleUnavailable => None,
        }
    }
}
