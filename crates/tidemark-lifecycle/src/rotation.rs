//! Rotation decisions and index creation.
//!
//! Nothing is persisted between cycles: every decision starts from the
//! live stats of the table's indices on its current cluster.

use std::collections::BTreeMap;

use chrono::{NaiveDateTime, TimeDelta};
use tracing::{debug, info, warn};

use tidemark_client::retry::retry;
use tidemark_client::{BYTES_PER_GB, ClientError, IndexStats};
use tidemark_core::bucket::parse_bucket;
use tidemark_core::{IndexVersion, LogicalTable, ParsedIndex};

use crate::context::IndexLifecycle;
use crate::error::LifecycleResult;
use crate::mapping::MappingVerdict;
use crate::metrics::RotationStatus;

/// Why a new index is needed. Ordered by evaluation priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RotationReason {
    OverSliceSize,
    MappingDifferent,
    Expired,
    NeedArchive,
    NeedWarmPhase,
    ForceRotate,
}

impl RotationReason {
    pub fn code(self) -> &'static str {
        match self {
            RotationReason::OverSliceSize => "INDEX_OVER_SLICE_SIZE",
            RotationReason::MappingDifferent => "INDEX_MAPPING_SETTINGS_DIFFERENT",
            RotationReason::Expired => "INDEX_EXPIRED",
            RotationReason::NeedArchive => "INDEX_NEED_ARCHIVE",
            RotationReason::NeedWarmPhase => "INDEX_NEED_WARM_PHASE",
            RotationReason::ForceRotate => "FORCE_ROTATE",
        }
    }
}

/// The index new documents currently land in.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentIndex {
    pub name: String,
    pub parsed: ParsedIndex,
    pub bucket_time: NaiveDateTime,
    pub size_bytes: u64,
    pub doc_count: u64,
}

impl CurrentIndex {
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / BYTES_PER_GB as f64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Table disabled or deleted.
    Disabled,
    Unchanged,
    /// `reason` is `None` when the table had no index at all.
    Created {
        index: String,
        reason: Option<RotationReason>,
    },
    /// Rotation was due but the current index has no live alias yet.
    Skipped { index: String },
}

/// First rotation trigger that fires, if any.
pub fn decide_rotation(
    table: &LogicalTable,
    current: &CurrentIndex,
    mapping: &MappingVerdict,
    now: NaiveDateTime,
    force: bool,
) -> Option<RotationReason> {
    let older_than = |days: i64| current.bucket_time < now - TimeDelta::days(days);

    if current.size_gb() > table.slice_size as f64 {
        Some(RotationReason::OverSliceSize)
    } else if !mapping.is_same() {
        Some(RotationReason::MappingDifferent)
    } else if older_than(table.retention) {
        Some(RotationReason::Expired)
    } else if table.archive_index_days > 0 && older_than(table.archive_index_days) {
        Some(RotationReason::NeedArchive)
    } else if table.warm_phase_days > 0 && older_than(table.warm_phase_days) {
        Some(RotationReason::NeedWarmPhase)
    } else if force {
        Some(RotationReason::ForceRotate)
    } else {
        None
    }
}

impl IndexLifecycle {
    /// Parsed indices of one naming version, keyed by name.
    async fn indices_of(
        &self,
        version: IndexVersion,
    ) -> LifecycleResult<BTreeMap<String, CurrentIndex>> {
        let pattern = self.naming.search_pattern(version);
        let stats = retry(
            self.settings.retry.current_index,
            "current_index",
            ClientError::is_transient,
            || self.client.indices_stats(&pattern),
        )
        .await?;

        let mut out = BTreeMap::new();
        for (name, IndexStats { size_in_bytes, doc_count }) in stats {
            let Ok(parsed) = self.naming.parse_index(&name) else {
                continue;
            };
            if parsed.version != version {
                continue;
            }
            let bucket_time = match parse_bucket(&parsed.bucket, &self.table.date_format) {
                Ok(at) => at,
                Err(e) => {
                    debug!(table_id = %self.table.table_id, index = %name, error = %e, "index bucket unreadable");
                    continue;
                }
            };
            out.insert(
                name.clone(),
                CurrentIndex {
                    name,
                    parsed,
                    bucket_time,
                    size_bytes: size_in_bytes,
                    doc_count,
                },
            );
        }
        Ok(out)
    }

    /// Every index of the table, v2 names first, falling back to v1.
    async fn table_indices(&self) -> LifecycleResult<Vec<CurrentIndex>> {
        let mut indices = self.indices_of(IndexVersion::V2).await?;
        if indices.is_empty() {
            indices = self.indices_of(IndexVersion::V1).await?;
        }
        Ok(indices.into_values().collect())
    }

    /// Highest bucket, then highest sequence.
    pub async fn current_index_info(&self) -> LifecycleResult<Option<CurrentIndex>> {
        Ok(latest(self.table_indices().await?))
    }

    async fn mapping_verdict(&self, index: &str) -> MappingVerdict {
        match self.is_mapping_same(index).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(table_id = %self.table.table_id, %index, error = %e, "mapping check failed");
                MappingVerdict::Same
            }
        }
    }

    /// Whether the current index must be superseded, and why.
    pub async fn should_create_index(&self, force: bool) -> LifecycleResult<Option<RotationReason>> {
        let current = match self.current_index_info().await {
            Ok(Some(current)) => current,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(table_id = %self.table.table_id, error = %e, "current index unavailable, no rotation");
                return Ok(None);
            }
        };
        let mapping = self.mapping_verdict(&current.name).await;
        Ok(decide_rotation(&self.table, &current, &mapping, self.local_now(), force))
    }

    /// Rotate the table's index when any trigger fires.
    pub async fn update_index(&self, force: bool) -> LifecycleResult<RotationOutcome> {
        let table_id = &self.table.table_id;
        if !self.table.is_index_enable() {
            debug!(%table_id, "table disabled, rotation skipped");
            return Ok(RotationOutcome::Disabled);
        }

        let indices = match self.table_indices().await {
            Ok(indices) => indices,
            Err(e) => {
                warn!(%table_id, error = %e, "current index unavailable, no rotation");
                return Ok(RotationOutcome::Unchanged);
            }
        };

        let now = self.local_now();
        let (future, present): (Vec<_>, Vec<_>) =
            indices.into_iter().partition(|i| i.bucket_time > now);
        for index in &future {
            match self.client.delete_index(&index.name).await {
                Ok(()) => info!(%table_id, index = %index.name, "future index deleted"),
                Err(e) => warn!(%table_id, index = %index.name, error = %e, "future index delete failed"),
            }
        }

        let Some(current) = latest(present) else {
            let index = self.create_index().await?;
            return Ok(RotationOutcome::Created { index, reason: None });
        };

        let mapping = self.mapping_verdict(&current.name).await;
        let Some(reason) = decide_rotation(&self.table, &current, &mapping, now, force) else {
            return Ok(RotationOutcome::Unchanged);
        };
        self.metrics
            .record_reason(table_id, self.cluster.cluster_id, reason);
        info!(%table_id, index = %current.name, reason = reason.code(), "rotation needed");

        let now_bucket = self.now_bucket()?;
        let seq = if current.parsed.bucket == now_bucket {
            let aliases = self.client.get_alias(&current.name, None).await?;
            let live = self
                .group_aliases(&aliases, self.table.retention, true)
                .get(&current.name)
                .is_some_and(|g| g.is_live());

            if live && current.doc_count == 0 {
                info!(%table_id, index = %current.name, "empty index recreated");
                self.client.delete_index(&current.name).await?;
                current.parsed.seq
            } else if force {
                current.parsed.seq + 1
            } else if !live {
                warn!(%table_id, index = %current.name, "current index has no live alias, rotation deferred");
                self.metrics
                    .record_rotation_skipped(table_id, self.cluster.cluster_id);
                return Ok(RotationOutcome::Skipped {
                    index: current.name,
                });
            } else {
                current.parsed.seq + 1
            }
        } else {
            0
        };

        let index = self.naming.index_name(&now_bucket, seq, IndexVersion::V2);
        self.create_index_with_retry(&index).await?;
        Ok(RotationOutcome::Created {
            index,
            reason: Some(reason),
        })
    }

    /// Create the first index of the table in the current bucket.
    pub async fn create_index(&self) -> LifecycleResult<String> {
        let index = self
            .naming
            .index_name(&self.now_bucket()?, 0, IndexVersion::V2);
        self.create_index_with_retry(&index).await?;
        Ok(index)
    }

    /// Create `index` unless it exists. Counts the outcome per table.
    pub async fn create_index_with_retry(&self, index: &str) -> LifecycleResult<()> {
        let table_id = &self.table.table_id;
        if self.client.index_exists(index).await? {
            info!(%table_id, %index, "index already exists");
            return Ok(());
        }

        let body = self.table.index_body();
        let created = retry(
            self.settings.retry.create_index,
            "create_index",
            |e: &ClientError| !matches!(e, ClientError::AlreadyExists(_)),
            || self.client.create_index(index, &body),
        )
        .await;

        match created {
            Ok(()) | Err(ClientError::AlreadyExists(_)) => {
                self.metrics
                    .record_rotation(table_id, self.cluster.cluster_id, RotationStatus::Success);
                info!(%table_id, %index, cluster_id = self.cluster.cluster_id, "index created");
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .record_rotation(table_id, self.cluster.cluster_id, RotationStatus::Failed);
                Err(e.into())
            }
        }
    }
}

fn latest(indices: Vec<CurrentIndex>) -> Option<CurrentIndex> {
    indices
        .into_iter()
        .max_by(|a, b| (a.bucket_time, a.parsed.seq).cmp(&(b.bucket_time, b.parsed.seq)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use serde_json::json;

    #[tokio::test]
    async fn slice_size_threshold() {
        let fx = Fixture::new();
        let index = fx.index(0, 0);
        fx.cluster.add_index(&index, 10, 0);
        fx.cluster.add_alias(&index, &fx.write_alias(0));
        let lifecycle = fx.lifecycle();

        fx.cluster.set_docs(&index, 10, 499.0);
        assert_eq!(lifecycle.should_create_index(false).await.unwrap(), None);

        fx.cluster.set_docs(&index, 10, 501.0);
        assert_eq!(
            lifecycle.should_create_index(false).await.unwrap(),
            Some(RotationReason::OverSliceSize)
        );
    }

    #[tokio::test]
    async fn decision_order() {
        let fx = Fixture::new();
        let index = fx.index(0, 0);
        fx.cluster.add_index(&index, 10, 0);
        let mut table = fx.table.clone();
        table
            .properties
            .insert("foo".to_string(), json!({"type": "keyword"}));
        let lifecycle = fx.lifecycle_with(table);

        assert_eq!(
            lifecycle.should_create_index(true).await.unwrap(),
            Some(RotationReason::MappingDifferent)
        );
        fx.cluster.set_docs(&index, 10, 600.0);
        assert_eq!(
            lifecycle.should_create_index(true).await.unwrap(),
            Some(RotationReason::OverSliceSize)
        );
    }

    #[tokio::test]
    async fn age_triggers() {
        let fx = Fixture::new();
        let index = fx.index(4 * 1440, 0);
        fx.cluster.add_index(&index, 10, 0);

        assert_eq!(fx.lifecycle().should_create_index(false).await.unwrap(), None);
        assert_eq!(
            fx.lifecycle().should_create_index(true).await.unwrap(),
            Some(RotationReason::ForceRotate)
        );

        let mut table = fx.table.clone();
        table.warm_phase_days = 3;
        assert_eq!(
            fx.lifecycle_with(table.clone()).should_create_index(false).await.unwrap(),
            Some(RotationReason::NeedWarmPhase)
        );
        table.archive_index_days = 2;
        assert_eq!(
            fx.lifecycle_with(table.clone()).should_create_index(false).await.unwrap(),
            Some(RotationReason::NeedArchive)
        );
        table.retention = 3;
        assert_eq!(
            fx.lifecycle_with(table).should_create_index(false).await.unwrap(),
            Some(RotationReason::Expired)
        );
    }

    #[tokio::test]
    async fn first_index_then_idempotent() {
        let fx = Fixture::new();
        let lifecycle = fx.lifecycle();

        let outcome = lifecycle.update_index(false).await.unwrap();
        assert_eq!(
            outcome,
            RotationOutcome::Created {
                index: fx.index(0, 0),
                reason: None
            }
        );
        assert_eq!(lifecycle.update_index(false).await.unwrap(), RotationOutcome::Unchanged);
        assert_eq!(lifecycle.update_index(false).await.unwrap(), RotationOutcome::Unchanged);
        assert_eq!(fx.cluster.index_names(), vec![fx.index(0, 0)]);
    }

    #[tokio::test]
    async fn oversized_index_rotates_once_within_bucket() {
        let fx = Fixture::new();
        let index = fx.index(0, 0);
        fx.cluster.add_index(&index, 100, 0);
        fx.cluster.set_docs(&index, 100, 501.0);
        fx.cluster.add_alias(&index, &fx.write_alias(0));
        let lifecycle = fx.lifecycle();

        assert_eq!(
            lifecycle.update_index(false).await.unwrap(),
            RotationOutcome::Created {
                index: fx.index(0, 1),
                reason: Some(RotationReason::OverSliceSize)
            }
        );
        assert_eq!(lifecycle.update_index(false).await.unwrap(), RotationOutcome::Unchanged);

        let counters = fx.metrics.counters(fx.table_id(), 1);
        assert_eq!(counters.rotations[&RotationStatus::Success], 1);
        assert_eq!(counters.rotation_reasons[&RotationReason::OverSliceSize], 1);
    }

    #[tokio::test]
    async fn rotation_without_live_alias_is_deferred() {
        let fx = Fixture::new();
        let index = fx.index(0, 0);
        fx.cluster.add_index(&index, 100, 0);
        fx.cluster.set_docs(&index, 100, 501.0);
        let lifecycle = fx.lifecycle();

        assert_eq!(
            lifecycle.update_index(false).await.unwrap(),
            RotationOutcome::Skipped { index: index.clone() }
        );
        assert_eq!(fx.metrics.counters(fx.table_id(), 1).rotations_skipped, 1);

        // Forcing overrides the deferral.
        assert_eq!(
            lifecycle.update_index(true).await.unwrap(),
            RotationOutcome::Created {
                index: fx.index(0, 1),
                reason: Some(RotationReason::OverSliceSize)
            }
        );
    }

    #[tokio::test]
    async fn empty_index_is_recreated_in_place() {
        let fx = Fixture::new();
        let index = fx.index(0, 2);
        fx.cluster.add_index(&index, 0, 0);
        fx.cluster.add_alias(&index, &fx.write_alias(0));
        let mut table = fx.table.clone();
        table
            .properties
            .insert("foo".to_string(), json!({"type": "keyword"}));
        let lifecycle = fx.lifecycle_with(table);

        let outcome = lifecycle.update_index(false).await.unwrap();
        assert_eq!(
            outcome,
            RotationOutcome::Created {
                index: index.clone(),
                reason: Some(RotationReason::MappingDifferent)
            }
        );
        assert_eq!(
            fx.cluster.operations(),
            vec![format!("delete_index {index}"), format!("create_index {index}")]
        );
        assert_eq!(
            fx.cluster.mapping_of(&index).unwrap()["properties"]["foo"]["type"],
            "keyword"
        );
    }

    #[tokio::test]
    async fn matching_mapping_keeps_index() {
        let fx = Fixture::new();
        let index = fx.index(0, 0);
        fx.cluster.add_index(&index, 10, 0);
        fx.cluster.add_alias(&index, &fx.write_alias(0));
        fx.cluster
            .set_mapping(&index, json!({"properties": {"foo": {"type": "keyword"}}}));
        let mut table = fx.table.clone();
        table
            .properties
            .insert("foo".to_string(), json!({"type": "keyword"}));

        let lifecycle = fx.lifecycle_with(table);
        assert_eq!(lifecycle.update_index(false).await.unwrap(), RotationOutcome::Unchanged);
        assert!(fx.cluster.operations().is_empty());
    }

    #[tokio::test]
    async fn older_bucket_restarts_sequence_and_future_is_dropped() {
        let fx = Fixture::new();
        let old = fx.index(31 * 1440, 7);
        let future = fx.index(-180, 0);
        fx.cluster.add_index(&old, 10, 0);
        fx.cluster.add_index(&future, 0, 0);

        let outcome = fx.lifecycle().update_index(false).await.unwrap();
        assert_eq!(
            outcome,
            RotationOutcome::Created {
                index: fx.index(0, 0),
                reason: Some(RotationReason::Expired)
            }
        );
        assert!(!fx.cluster.has_index(&future));
        assert!(fx.cluster.has_index(&old));
    }

    #[tokio::test]
    async fn legacy_names_are_found_and_superseded_by_v2() {
        let fx = Fixture::new();
        let legacy = fx
            .lifecycle()
            .naming()
            .index_name(&fx.bucket(0), 3, IndexVersion::V1);
        fx.cluster.add_index(&legacy, 10, 0);
        fx.cluster.add_alias(&legacy, &fx.write_alias(0));

        let current = fx.lifecycle().current_index_info().await.unwrap().unwrap();
        assert_eq!(current.name, legacy);
        assert_eq!(current.parsed.version, IndexVersion::V1);

        assert_eq!(
            fx.lifecycle().update_index(true).await.unwrap(),
            RotationOutcome::Created {
                index: fx.index(0, 4),
                reason: Some(RotationReason::ForceRotate)
            }
        );
    }

    #[tokio::test]
    async fn creation_retries_and_counts_failures() {
        let fx = Fixture::new();
        let lifecycle = fx.lifecycle();

        fx.cluster.fail_next_create_index(2);
        lifecycle.create_index().await.unwrap();

        fx.cluster.fail_next_create_index(3);
        assert!(lifecycle.create_index_with_retry("v2_2_bklog_demo_2024033112_9").await.is_err());

        let counters = fx.metrics.counters(fx.table_id(), 1);
        assert_eq!(counters.rotations[&RotationStatus::Success], 1);
        assert_eq!(counters.rotations[&RotationStatus::Failed], 1);
    }

    #[tokio::test]
    async fn disabled_table_is_left_alone() {
        let fx = Fixture::new();
        let mut table = fx.table.clone();
        table.is_enabled = false;
        assert_eq!(
            fx.lifecycle_with(table).update_index(true).await.unwrap(),
            RotationOutcome::Disabled
        );
        assert!(fx.cluster.index_names().is_empty());
    }

    #[tokio::test]
    async fn unreachable_cluster_means_no_rotation() {
        let fx = Fixture::new();
        fx.cluster.set_unavailable(true);
        assert_eq!(fx.lifecycle().should_create_index(true).await.unwrap(), None);
        assert_eq!(
            fx.lifecycle().update_index(true).await.unwrap(),
            RotationOutcome::Unchanged
        );
    }
}
