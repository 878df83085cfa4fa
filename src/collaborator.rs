//! The collaborator boundary between the engine and the surrounding shell.
//!
//! The core never holds references to live UI objects; everything it needs
//! from the shell goes through [`TabCollaborator`], keyed by tab id. Exactly
//! one implementation is selected at composition time and handed to
//! [`TabEngine::new`](crate::engine::TabEngine::new).

use crate::TabId;
use crate::snapshot::{PreservationLevel, TabStateSnapshot};

/// Gateway to the shell-owned live state of tabs.
///
/// Implementations may fail arbitrarily (`anyhow::Result`); the engine
/// flattens failures into
/// [`EngineError::Collaborator`](crate::error::EngineError::Collaborator)
/// and isolates them per tab. Calls are made off the engine's internal lock
/// and may be invoked from background threads, so implementations must be
/// `Send + Sync`.
pub trait TabCollaborator: Send + Sync {
    /// Capture the tab's essential state at the requested preservation
    /// level. The engine bounds this call by the configured operation
    /// timeout and additionally truncates the result to the level's limits.
    fn capture(&self, tab: TabId, level: PreservationLevel) -> anyhow::Result<TabStateSnapshot>;

    /// Restore a tab's live state from a snapshot previously produced by
    /// [`capture`](TabCollaborator::capture). Called when a hibernated tab
    /// reactivates.
    fn restore(&self, tab: TabId, snapshot: &TabStateSnapshot) -> anyhow::Result<()>;

    /// Release the tab's heavyweight live resources. How the shell discards
    /// them is its own concern; after a successful return the tab must
    /// report itself as dormant.
    fn release(&self, tab: TabId) -> anyhow::Result<()>;

    /// The ordered tab ids currently presentable to the user. Pulled fresh
    /// at every scheduling decision and never stored across cycles.
    fn visible_tabs(&self) -> Vec<TabId>;
}
