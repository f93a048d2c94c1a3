//! Snapshots of indices about to expire.
//!
//! A table with a snapshot policy archives its expired indices once a day
//! into the policy's repository before cleanup may delete them. One row per
//! archived index is kept in the state store so snapshots can be located
//! and purged later.

use chrono::{DateTime, NaiveDate, TimeDelta};
use tracing::{debug, error, info, warn};

use tidemark_client::{SnapshotInfo, SnapshotState};
use tidemark_core::{SnapshotIndice, SnapshotPolicy};

use crate::context::IndexLifecycle;
use crate::error::LifecycleResult;

/// Field holding each document's event time.
pub const TIME_FIELD: &str = "time";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// No policy, table disabled, or policy stopped.
    Disabled,
    AlreadyTaken(String),
    /// The latest snapshot is still running.
    InProgress(String),
    NothingToArchive,
    Created {
        snapshot: String,
        indices: Vec<String>,
    },
}

impl IndexLifecycle {
    pub fn snapshot_policy(&self) -> LifecycleResult<Option<SnapshotPolicy>> {
        Ok(self.store.get_snapshot_policy(&self.table.table_id)?)
    }

    /// A policy exists and the table is enabled.
    pub fn can_snapshot(&self) -> LifecycleResult<bool> {
        Ok(self.table.is_index_enable() && self.snapshot_policy()?.is_some())
    }

    fn today(&self) -> NaiveDate {
        self.local_now().date()
    }

    /// The table's snapshots in `repository`, oldest first.
    pub async fn snapshots(&self, repository: &str) -> LifecycleResult<Vec<(NaiveDate, SnapshotInfo)>> {
        let infos = self
            .client
            .get_snapshots(repository, &self.naming.snapshot_pattern())
            .await?;
        let mut dated: Vec<(NaiveDate, SnapshotInfo)> = infos
            .into_iter()
            .filter_map(|info| {
                self.naming
                    .parse_snapshot(&info.snapshot)
                    .ok()
                    .map(|day| (day, info))
            })
            .collect();
        dated.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(dated)
    }

    /// Indices with no live alias that still hold documents.
    pub async fn expired_indices(&self) -> LifecycleResult<Vec<String>> {
        let now_bucket = self.now_bucket()?;
        let mut expired = Vec::new();
        for (index, group) in self.retention_groups().await? {
            if group.is_live() || self.is_exempt(&index, &now_bucket) {
                continue;
            }
            if self.client.count(&index).await? > 0 {
                expired.push(index);
            }
        }
        Ok(expired)
    }

    /// Whether cleanup may delete expired indices now.
    pub async fn can_delete(&self) -> LifecycleResult<bool> {
        if !self.can_snapshot()? {
            return Ok(true);
        }
        let Some(policy) = self.snapshot_policy()? else {
            return Ok(true);
        };

        let snapshots = self.snapshots(&policy.target_repository).await?;
        let today = self.today();
        let has_today = snapshots.iter().any(|(day, _)| *day == today);
        if !has_today && !self.expired_indices().await?.is_empty() {
            debug!(table_id = %self.table.table_id, "expired indices not yet archived");
            return Ok(false);
        }
        Ok(snapshots
            .last()
            .is_none_or(|(_, latest)| latest.state == SnapshotState::Success))
    }

    /// Archive today's expired indices.
    pub async fn create_snapshot(&self) -> LifecycleResult<SnapshotOutcome> {
        let table_id = &self.table.table_id;
        let Some(policy) = self.snapshot_policy()? else {
            return Ok(SnapshotOutcome::Disabled);
        };
        if !self.table.is_index_enable() || policy.is_stopped() {
            return Ok(SnapshotOutcome::Disabled);
        }

        let repository = &policy.target_repository;
        let today = self.today();
        if let Some((day, latest)) = self.snapshots(repository).await?.pop() {
            if day == today {
                return Ok(SnapshotOutcome::AlreadyTaken(latest.snapshot));
            }
            if latest.state == SnapshotState::InProgress {
                info!(%table_id, snapshot = %latest.snapshot, "previous snapshot still running");
                return Ok(SnapshotOutcome::InProgress(latest.snapshot));
            }
        }

        let indices = self.expired_indices().await?;
        if indices.is_empty() {
            return Ok(SnapshotOutcome::NothingToArchive);
        }

        let snapshot = self.naming.snapshot_name(today);
        let mut rows = Vec::with_capacity(indices.len());
        for index in &indices {
            rows.push(self.snapshot_row(&policy, &snapshot, index).await?);
        }
        self.store.put_snapshot_indices(&rows)?;

        match self
            .client
            .create_snapshot(repository, &snapshot, &indices)
            .await
        {
            Ok(()) => {
                self.metrics
                    .record_snapshot(table_id, self.cluster.cluster_id, true);
                info!(%table_id, %snapshot, %repository, count = indices.len(), "snapshot created");
                Ok(SnapshotOutcome::Created { snapshot, indices })
            }
            Err(e) => {
                self.metrics
                    .record_snapshot(table_id, self.cluster.cluster_id, false);
                error!(%table_id, %snapshot, error = %e, "snapshot request failed");
                if let Err(cleanup) = self.store.delete_snapshot_indices(table_id, &snapshot) {
                    warn!(%table_id, %snapshot, error = %cleanup, "snapshot rows left behind");
                }
                Err(e.into())
            }
        }
    }

    async fn snapshot_row(
        &self,
        policy: &SnapshotPolicy,
        snapshot: &str,
        index: &str,
    ) -> LifecycleResult<SnapshotIndice> {
        let first = self.client.edge_document_time(index, TIME_FIELD, false).await?;
        let last = self.client.edge_document_time(index, TIME_FIELD, true).await?;
        let doc_count = self.client.count(index).await?;
        let store_size = self
            .client
            .indices_stats(index)
            .await?
            .get(index)
            .map_or(0, |s| s.size_in_bytes);
        Ok(SnapshotIndice {
            table_id: self.table.table_id.clone(),
            snapshot_name: snapshot.to_string(),
            index_name: index.to_string(),
            cluster_id: self.cluster.cluster_id,
            repository_name: policy.target_repository.clone(),
            doc_count,
            store_size,
            start_time: first.and_then(DateTime::from_timestamp_millis),
            end_time: last.and_then(DateTime::from_timestamp_millis),
        })
    }

    /// Delete one snapshot and its rows.
    async fn delete_snapshot(&self, repository: &str, snapshot: &str) -> LifecycleResult<()> {
        match self.client.delete_snapshot(repository, snapshot).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(table_id = %self.table.table_id, %snapshot, "snapshot already gone");
            }
            Err(e) => return Err(e.into()),
        }
        self.store
            .delete_snapshot_indices(&self.table.table_id, snapshot)?;
        Ok(())
    }

    /// Purge snapshots older than the policy's `snapshot_days`.
    pub async fn clean_snapshot(&self) -> LifecycleResult<Vec<String>> {
        let table_id = &self.table.table_id;
        let Some(policy) = self.snapshot_policy()? else {
            return Ok(Vec::new());
        };
        if policy.is_permanent() || policy.is_stopped() {
            return Ok(Vec::new());
        }

        let threshold = self.today() - TimeDelta::days(policy.snapshot_days);
        let mut deleted = Vec::new();
        for (day, info) in self.snapshots(&policy.target_repository).await? {
            if day >= threshold {
                continue;
            }
            match self
                .delete_snapshot(&policy.target_repository, &info.snapshot)
                .await
            {
                Ok(()) => {
                    info!(%table_id, snapshot = %info.snapshot, "expired snapshot deleted");
                    deleted.push(info.snapshot);
                }
                Err(e) => {
                    error!(%table_id, snapshot = %info.snapshot, error = %e, "snapshot delete failed");
                }
            }
        }
        self.metrics
            .record_snapshots_deleted(table_id, self.cluster.cluster_id, deleted.len() as u64);
        Ok(deleted)
    }

    /// Remove every snapshot of the table from `repository`.
    pub async fn delete_all_snapshots(&self, repository: &str) -> LifecycleResult<Vec<String>> {
        let mut deleted = Vec::new();
        for (_, info) in self.snapshots(repository).await? {
            match self.delete_snapshot(repository, &info.snapshot).await {
                Ok(()) => deleted.push(info.snapshot),
                Err(e) => {
                    error!(table_id = %self.table.table_id, snapshot = %info.snapshot, error = %e, "snapshot delete failed");
                }
            }
        }
        info!(table_id = %self.table.table_id, %repository, count = deleted.len(), "snapshots removed");
        Ok(deleted)
    }
}
