//! Tab resource-management core for the Cabinet file manager.
//!
//! As the number of open tabs grows into the hundreds, this crate decides
//! which tabs stay fully live, which are compacted into a cheap hibernated
//! snapshot, and when snapshots are evicted or restored in response to
//! memory pressure, while the visible tab set stays fully responsive.
//!
//! The shell talks to one surface, [`TabEngine`]: register and unregister
//! tabs, mark them touched, query aggregate statistics, tune configuration
//! at runtime, and read dry-run recommendations. Everything the core needs
//! from live UI state goes through the [`TabCollaborator`] trait by tab id;
//! the core never owns or references UI objects directly.
//!
//! Internals, in dependency order: [`monitor`] samples process memory and
//! classifies pressure; [`registry`] is the canonical tab record store;
//! [`snapshot`] and [`hibernation`] implement reversible state compaction;
//! [`scheduler`] computes pure rebalancing plans; [`optimizer`] runs the
//! control loop; [`cache`] and [`command_pool`] are the auxiliary caches the
//! cycle trims.

pub mod cache;
pub mod collaborator;
pub mod command_pool;
pub mod config;
pub mod engine;
pub mod error;
pub mod hibernation;
pub mod monitor;
pub mod optimizer;
pub mod registry;
pub mod scheduler;
pub mod snapshot;

/// Tab identity, minted by the shell. Opaque to the core.
pub type TabId = u64;

pub use cache::{ItemViewCache, TrimmableCache};
pub use collaborator::TabCollaborator;
pub use command_pool::CommandPool;
pub use config::{ConfigUpdate, EngineConfig};
pub use engine::{EngineStats, TabEngine};
pub use error::{EngineError, TabOperation};
pub use hibernation::{HibernationEngine, HibernationStats};
pub use monitor::{
    CycleTrigger, MemoryProfile, MemorySource, MemoryTrend, PressureLevel, ResourceMonitor,
    SysinfoSource,
};
pub use optimizer::{
    CycleSummary, OptimizationRecommendation, PerformanceOptimizer, RecommendedAction,
};
pub use registry::{StateCounts, TabLifecycle, TabRecord, TabRegistry};
pub use scheduler::{RebalancePlan, VisibilityWindow, priority_score};
pub use snapshot::{HibernationSnapshot, PreservationLevel, SnapshotStore, TabStateSnapshot};
