//! Write/read alias binding for upcoming time buckets.

use std::collections::BTreeMap;

use chrono::TimeDelta;
use tracing::{debug, info, warn};

use tidemark_client::AliasAction;
use tidemark_client::retry::retry;

use crate::context::IndexLifecycle;
use crate::error::{LifecycleError, LifecycleResult};

/// Minutes back to the bucket a migrating table still writes to.
pub const MOVING_CLUSTER_LOOKBACK_MINUTES: i64 = 1440;

/// Buckets touched by one alias pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasReport {
    pub bound: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

enum Bind {
    Bound,
    /// Target not ready. Carries the index now holding the write alias.
    NotReady(Option<String>),
}

impl IndexLifecycle {
    /// Point the aliases of every bucket from now to `ahead_time` minutes
    /// ahead at the current index.
    ///
    /// A bucket whose target is not green is left alone unless `force`; the
    /// index still holding its write alias becomes the target for the next
    /// bucket. Per-bucket failures are logged and counted.
    pub async fn create_or_update_aliases(
        &self,
        ahead_time: i64,
        force: bool,
        is_moving_cluster: bool,
    ) -> LifecycleResult<AliasReport> {
        let table_id = &self.table.table_id;
        let mut report = AliasReport::default();
        if !self.table.is_index_enable() {
            return Ok(report);
        }
        let step = self.table.slice_gap;
        if step <= 0 {
            debug!(%table_id, slice_gap = step, "no alias buckets to bind");
            return Ok(report);
        }

        let current = self
            .current_index_info()
            .await?
            .ok_or_else(|| LifecycleError::NoIndex(table_id.clone()))?;
        let now = self.local_now();
        let mut target = current.name.clone();
        let mut last_bucket = None;

        let mut gap = 0;
        while gap <= ahead_time {
            let bucket = self.format_bucket(now + TimeDelta::minutes(gap))?;
            gap += step;
            if last_bucket.as_ref() == Some(&bucket) {
                continue;
            }
            last_bucket = Some(bucket.clone());

            match self.bind_bucket(&bucket, &target, force).await {
                Ok(Bind::Bound) => {
                    self.metrics
                        .record_alias_bind(table_id, self.cluster.cluster_id, true);
                    report.bound.push(bucket);
                }
                Ok(Bind::NotReady(holder)) => {
                    warn!(%table_id, %bucket, index = %target, "target index not ready, bucket skipped");
                    if let Some(holder) = holder {
                        target = holder;
                    }
                    report.skipped.push(bucket);
                }
                Err(e) => {
                    warn!(%table_id, %bucket, index = %target, error = %e, "alias binding failed");
                    self.metrics
                        .record_alias_bind(table_id, self.cluster.cluster_id, false);
                    report.failed.push(bucket);
                }
            }
        }

        if is_moving_cluster {
            let bucket = self.format_bucket(now - TimeDelta::minutes(MOVING_CLUSTER_LOOKBACK_MINUTES))?;
            match self.bind_bucket(&bucket, &current.name, force).await {
                Ok(Bind::Bound) => {
                    info!(%table_id, %bucket, index = %current.name, "previous bucket bound after cluster move");
                    report.bound.push(bucket);
                }
                Ok(Bind::NotReady(_)) => report.skipped.push(bucket),
                Err(e) => {
                    warn!(%table_id, %bucket, error = %e, "previous bucket binding failed");
                    report.failed.push(bucket);
                }
            }
        }

        info!(
            %table_id,
            bound = report.bound.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "aliases updated"
        );
        Ok(report)
    }

    /// Move the write aliases of `bucket` onto `target` and add its read alias.
    async fn bind_bucket(&self, bucket: &str, target: &str, force: bool) -> LifecycleResult<Bind> {
        let write = self.naming.write_alias(bucket);
        let legacy = self.naming.legacy_write_alias(bucket);
        let read = self.naming.read_alias(bucket);

        let holders: BTreeMap<String, Vec<String>> = self
            .client
            .get_alias("*", Some(&format!("{write},{legacy}")))
            .await?;

        if !force && !self.is_index_ready(target).await {
            // Newest holder by (bucket, seq); name order puts `_10` before `_9`.
            let holder = holders
                .iter()
                .filter(|(_, aliases)| aliases.contains(&write))
                .filter_map(|(index, _)| {
                    let parsed = self.naming.parse_index(index).ok()?;
                    Some(((parsed.bucket, parsed.seq), index))
                })
                .max_by(|a, b| a.0.cmp(&b.0))
                .map(|(_, index)| index.clone());
            return Ok(Bind::NotReady(holder));
        }

        let mut actions = vec![
            AliasAction::add(target, &write),
            AliasAction::add(target, &legacy),
            AliasAction::add(target, &read),
        ];
        for (index, aliases) in &holders {
            if index == target {
                continue;
            }
            for alias in aliases {
                actions.push(AliasAction::remove(index, alias));
            }
        }

        let actions = &actions;
        retry(
            self.settings.retry.update_aliases,
            "update_aliases",
            |_: &LifecycleError| true,
            || async move {
                if !force && !self.is_index_ready(target).await {
                    return Err(LifecycleError::NotReady(target.to_string()));
                }
                Ok(self.client.update_aliases(actions).await?)
            },
        )
        .await?;

        debug!(table_id = %self.table.table_id, %bucket, index = %target, actions = actions.len(), "bucket bound");
        Ok(Bind::Bound)
    }
}
