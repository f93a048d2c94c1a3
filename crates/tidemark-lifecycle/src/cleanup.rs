//! Expired alias pruning, index deletion and history retirement.

use std::collections::BTreeMap;

use tracing::{debug, error, info, warn};

use tidemark_client::ClientPool;
use tidemark_state::ClusterRegistry;

use crate::context::IndexLifecycle;
use crate::error::LifecycleResult;
use crate::expiry::AliasGroup;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub aliases_removed: usize,
    /// Fully expired indices kept because deletion is not allowed yet.
    pub refused: Vec<String>,
    pub failed: Vec<String>,
    /// Indices that still hold live data.
    pub retained: usize,
}

impl CleanupReport {
    /// The cluster still has data for the table.
    pub fn has_active(&self) -> bool {
        self.retained > 0 || !self.refused.is_empty() || !self.failed.is_empty()
    }
}

/// A history record and what its cleanup did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryCleanup {
    pub cluster_id: u32,
    pub report: CleanupReport,
    pub retired: bool,
}

impl IndexLifecycle {
    async fn prune(
        &self,
        groups: BTreeMap<String, AliasGroup>,
        can_delete: bool,
    ) -> LifecycleResult<CleanupReport> {
        let table_id = &self.table.table_id;
        let now_bucket = self.now_bucket()?;
        let mut report = CleanupReport::default();

        for (index, group) in groups {
            if self.is_exempt(&index, &now_bucket) {
                debug!(%table_id, %index, "index exempt from cleanup");
                report.retained += 1;
                continue;
            }

            if group.is_live() {
                report.retained += 1;
                if group.expired.is_empty() {
                    continue;
                }
                match self.client.delete_alias(&index, &group.expired).await {
                    Ok(()) => {
                        debug!(%table_id, %index, aliases = ?group.expired, "expired aliases removed");
                        report.aliases_removed += group.expired.len();
                    }
                    Err(e) => {
                        warn!(%table_id, %index, error = %e, "expired alias removal failed");
                    }
                }
                continue;
            }

            if !can_delete {
                report.refused.push(index);
                continue;
            }
            match self.client.delete_index(&index).await {
                Ok(()) => {
                    info!(%table_id, %index, cluster_id = self.cluster.cluster_id, "expired index deleted");
                    report.deleted.push(index);
                }
                Err(e) if e.is_not_found() => report.deleted.push(index),
                Err(e) => {
                    error!(%table_id, %index, error = %e, "index delete failed");
                    report.failed.push(index);
                }
            }
        }

        if !report.refused.is_empty() {
            warn!(%table_id, refused = ?report.refused, "deletion deferred until snapshot completes");
        }
        self.metrics.record_indices_deleted(
            table_id,
            self.cluster.cluster_id,
            report.deleted.len() as u64,
        );
        Ok(report)
    }

    /// Whether deletion is allowed. Errors count as not allowed.
    async fn deletion_allowed(&self) -> bool {
        match self.can_delete().await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(table_id = %self.table.table_id, error = %e, "snapshot state unknown, deletion deferred");
                false
            }
        }
    }

    /// Clean expired data of the table on its current cluster.
    pub async fn clean_index(&self) -> LifecycleResult<CleanupReport> {
        let groups = self.retention_groups().await?;
        let can_delete = self.deletion_allowed().await;
        self.prune(groups, can_delete).await
    }

    /// Clean the table's indices on clusters it has moved away from.
    ///
    /// A history record whose cluster keeps no live data is marked deleted.
    pub async fn clean_history_indices(
        &self,
        pool: &ClientPool,
    ) -> LifecycleResult<Vec<HistoryCleanup>> {
        let table_id = &self.table.table_id;
        let records = self.store.history_records(table_id)?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let can_delete = self.deletion_allowed().await;

        let mut results = Vec::new();
        for mut record in records {
            let cluster_id = record.cluster_id;
            let cluster = match self.store.resolve(cluster_id) {
                Ok(cluster) => cluster,
                Err(e) => {
                    warn!(%table_id, cluster_id, error = %e, "history cluster unknown");
                    continue;
                }
            };
            let client = match pool.get(&cluster) {
                Ok(client) => client,
                Err(e) => {
                    warn!(%table_id, cluster_id, error = %e, "history cluster unreachable");
                    continue;
                }
            };

            let other = self.on_cluster(cluster, client);
            let report = match other.retention_groups().await {
                Ok(groups) => other.prune(groups, can_delete).await?,
                Err(e) => {
                    warn!(%table_id, cluster_id, error = %e, "history cluster aliases unavailable");
                    continue;
                }
            };

            let retired = !report.has_active();
            if retired {
                record.is_deleted = true;
                record.delete_time = Some(self.now);
                self.store.put_cluster_record(&record)?;
                info!(%table_id, cluster_id, "history cluster retired");
            }
            results.push(HistoryCleanup {
                cluster_id,
                report,
                retired,
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::Fixture;
    use chrono::TimeDelta;
    use tidemark_client::{SearchClient, SnapshotState};
    use tidemark_core::{SnapshotPolicy, SnapshotPolicyStatus};

    #[tokio::test]
    async fn expired_index_deleted_live_index_kept() {
        let fx = Fixture::new();
        let expired = fx.aged_index(40, 10);
        let live = fx.aged_index(10, 10);

        let report = fx.lifecycle().clean_index().await.unwrap();
        assert_eq!(report.deleted, vec![expired.clone()]);
        assert!(!fx.cluster.has_index(&expired));
        assert!(fx.cluster.has_index(&live));
        assert_eq!(fx.metrics.counters(fx.table_id(), 1).indices_deleted, 1);
    }

    #[tokio::test]
    async fn index_with_live_alias_only_loses_expired_ones() {
        let fx = Fixture::new();
        let index = fx.index(40 * 1440, 0);
        fx.cluster.add_index(&index, 10, 0);
        let old = fx.write_alias(40 * 1440);
        let recent = fx.read_alias(5 * 1440);
        fx.cluster.add_alias(&index, &old);
        fx.cluster.add_alias(&index, &recent);

        let report = fx.lifecycle().clean_index().await.unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(report.aliases_removed, 1);
        assert_eq!(fx.cluster.aliases_of(&index), vec![recent]);
    }

    #[tokio::test]
    async fn exempt_indices_are_untouched() {
        let fx = Fixture::new();
        let long_term = fx.aged_index(40, 10);
        let restore = format!("restore_{}", fx.index(50 * 1440, 0));
        fx.cluster.add_index(&restore, 10, 0);
        fx.cluster.add_alias(&restore, &fx.write_alias(50 * 1440));
        // Current bucket in the name but only expired aliases.
        let current = fx.index(0, 0);
        fx.cluster.add_index(&current, 10, 0);
        fx.cluster.add_alias(&current, &fx.write_alias(45 * 1440));

        let mut table = fx.table.clone();
        table.long_term_storage_indices = vec![long_term.clone()];
        let report = fx.lifecycle_with(table).clean_index().await.unwrap();

        assert!(report.deleted.is_empty());
        assert_eq!(report.aliases_removed, 0);
        for index in [&long_term, &restore, &current] {
            assert!(fx.cluster.has_index(index));
            assert!(!fx.cluster.aliases_of(index).is_empty());
        }
    }

    #[tokio::test]
    async fn other_tables_sharing_a_suffix_are_ignored() {
        let fx = Fixture::new();
        let foreign = format!("v2_x_{}", fx.index(40 * 1440, 0).trim_start_matches("v2_"));
        fx.cluster.add_index(&foreign, 10, 0);

        let report = fx.lifecycle().clean_index().await.unwrap();
        assert!(report.deleted.is_empty());
        assert!(fx.cluster.has_index(&foreign));
    }

    #[tokio::test]
    async fn delete_failures_are_isolated() {
        let fx = Fixture::new();
        let first = fx.aged_index(40, 10);
        let second = fx.aged_index(41, 10);
        fx.cluster.fail_delete(&second);

        let report = fx.lifecycle().clean_index().await.unwrap();
        assert_eq!(report.deleted, vec![first]);
        assert_eq!(report.failed, vec![second]);
    }

    #[tokio::test]
    async fn pending_snapshot_blocks_deletion() {
        let fx = Fixture::new();
        fx.store
            .put_snapshot_policy(&SnapshotPolicy {
                table_id: fx.table_id().to_string(),
                target_repository: "archive".to_string(),
                snapshot_days: 7,
                status: SnapshotPolicyStatus::Running,
            })
            .unwrap();
        let expired = fx.aged_index(40, 10);
        let today = fx.table.local_now(fx.now).date();
        fx.cluster.add_snapshot(
            "archive",
            &fx.naming.snapshot_name(today),
            &[expired.as_str()],
            SnapshotState::InProgress,
        );

        let report = fx.lifecycle().clean_index().await.unwrap();
        assert_eq!(report.refused, vec![expired.clone()]);
        assert!(fx.cluster.has_index(&expired));
        assert_eq!(fx.metrics.counters(fx.table_id(), 1).indices_deleted, 0);
    }

    #[tokio::test]
    async fn history_cluster_retired_once_empty() {
        let fx = Fixture::new();
        let old_cluster = fx.fleet.cluster(1);
        let expired = fx.aged_index(40, 10);
        let live = fx.aged_index(2, 10);

        let moved_at = fx.now - TimeDelta::hours(1);
        assert!(fx.store.migrate_cluster(fx.table_id(), 2, moved_at).unwrap());
        let mut table = fx.table.clone();
        table.storage_cluster_id = 2;
        let lifecycle = fx.lifecycle_on(table, 2);
        let pool = fx.pool();

        let results = lifecycle.clean_history_indices(&pool).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].cluster_id, 1);
        assert!(!results[0].retired);
        assert_eq!(results[0].report.deleted, vec![expired]);
        assert!(old_cluster.has_index(&live));

        // The live index ages out.
        old_cluster
            .delete_alias(&live, &old_cluster.aliases_of(&live))
            .await
            .unwrap();
        let results = lifecycle.clean_history_indices(&pool).await.unwrap();
        assert!(results[0].retired);
        assert!(!old_cluster.has_index(&live));

        let history = fx.store.list_cluster_records(fx.table_id()).unwrap();
        let old = history.iter().find(|r| r.cluster_id == 1).unwrap();
        assert!(old.is_deleted);
        assert_eq!(old.delete_time, Some(fx.now));
        assert!(fx.store.history_records(fx.table_id()).unwrap().is_empty());
        assert!(lifecycle.clean_history_indices(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_history_cluster_is_skipped() {
        let fx = Fixture::new();
        fx.aged_index(40, 10);
        fx.store
            .migrate_cluster(fx.table_id(), 2, fx.now - TimeDelta::hours(1))
            .unwrap();
        fx.fleet.set_unreachable(1, true);
        let mut table = fx.table.clone();
        table.storage_cluster_id = 2;

        let results = fx
            .lifecycle_on(table, 2)
            .clean_history_indices(&fx.pool())
            .await
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(fx.store.history_records(fx.table_id()).unwrap().len(), 1);
    }
}
