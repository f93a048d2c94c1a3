//! tidemark-lifecycle — index lifecycle for time-partitioned tables.
//!
//! Each logical table is written through date-bucketed write aliases and
//! read through per-bucket read aliases. This crate keeps those indices
//! and aliases in shape: it rotates indices on size, mapping drift or
//! age, binds aliases ahead of time, archives and deletes expired data,
//! moves aging indices to warm nodes and publishes routing documents.
//!
//! # Architecture
//!
//! ```text
//! LifecycleEngine ── run() / run_all() ── Semaphore-bounded tasks
//!   │
//!   └── per table: IndexLifecycle (table, cluster, client, now)
//!         sync_field_aliases()         mapping
//!         update_index()               rotation
//!         create_or_update_aliases()   alias
//!         create_snapshot()            snapshot
//!         clean_index()                cleanup   (uses expiry)
//!         reallocate_index()           reallocate
//!         clean_snapshot()             snapshot
//!         clean_history_indices()      cleanup
//!   │
//!   └── publish_routing() ── RoutingPublisher
//! ```
//!
//! A failed stage is logged and recorded in the table's report; the next
//! stage still runs.

pub mod alias;
pub mod backend;
pub mod cleanup;
pub mod context;
pub mod engine;
pub mod error;
pub mod expiry;
pub mod mapping;
pub mod metrics;
pub mod reallocate;
pub mod rotation;
pub mod routing;
pub mod snapshot;

#[cfg(test)]
mod testing;

pub use alias::AliasReport;
pub use backend::{SearchIndexBackend, StorageBackend};
pub use cleanup::{CleanupReport, HistoryCleanup};
pub use context::IndexLifecycle;
pub use engine::{LifecycleEngine, LifecycleStage, LifecycleTrigger, TableReport};
pub use error::{LifecycleError, LifecycleResult};
pub use expiry::{AliasGroup, ExpiryWindow, group_expired_alias};
pub use mapping::{MappingDrift, MappingVerdict, compare_mapping};
pub use metrics::{LifecycleMetrics, RotationStatus, TableCounters};
pub use rotation::{RotationOutcome, RotationReason, decide_rotation};
pub use routing::{
    MemoryRoutingPublisher, RoutingEntry, RoutingPublisher, StoreRoutingPublisher, publish_routing,
};
pub use snapshot::SnapshotOutcome;
