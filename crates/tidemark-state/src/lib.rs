//! tidemark-state — embedded state store for Tidemark.
//!
//! Backed by [redb](https://docs.rs/redb), holds the cluster registry,
//! logical tables, per-table storage cluster history, snapshot policies and
//! snapshot index bookkeeping.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{table_id}:{create_micros}:{cluster_id}`,
//! `{table_id}/{snapshot}/{index}`) keep a table's rows adjacent so they
//! can be collected with a prefix scan.
//!
//! ```text
//!   clusters ──► ClusterRegistry (resolve / list_default)
//!   tables ──┬── cluster_records   (one is_current per table)
//!            └── snapshot_policies ── snapshot_indices
//! ```
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod registry;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use registry::ClusterRegistry;
pub use store::{StateStore, TableSync};
