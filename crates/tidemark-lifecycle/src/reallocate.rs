//! Warm-tier reallocation through shard allocation filtering.

use chrono::TimeDelta;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::context::IndexLifecycle;
use crate::error::LifecycleResult;

/// Day granularity used to spot indices still inside the hot window.
const DAY_FORMAT: &str = "%Y%m%d";

impl IndexLifecycle {
    /// Day strings of the last `days` days, today first.
    fn recent_days(&self, days: i64) -> Vec<String> {
        let now = self.local_now();
        (0..days)
            .map(|d| (now - TimeDelta::days(d)).format(DAY_FORMAT).to_string())
            .collect()
    }

    /// Move indices older than `warm_phase_days` to the warm tier.
    ///
    /// Returns the indices whose allocation setting was written.
    pub async fn reallocate_index(&self) -> LifecycleResult<Vec<String>> {
        let table_id = &self.table.table_id;
        let Some(warm) = self.table.warm_phase() else {
            return Ok(Vec::new());
        };
        let days = self.table.warm_phase_days;
        let key = warm.setting_key();
        let value = Value::String(warm.allocation_attr_value.clone());

        let aliases = self.own_alias_list().await?;
        let recent = self.recent_days(days);
        let candidates: Vec<String> = self
            .group_aliases(&aliases, days, false)
            .into_iter()
            .filter(|(index, group)| {
                !group.is_live() && !recent.iter().any(|day| index.contains(day.as_str()))
            })
            .map(|(index, _)| index)
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let settings = self.client.get_settings(&candidates.join(",")).await?;
        let pending: Vec<String> = candidates
            .into_iter()
            .filter(|index| {
                settings
                    .get(index)
                    .and_then(|s| s.get(&key))
                    .is_none_or(|current| *current != value)
            })
            .collect();
        debug!(%table_id, count = pending.len(), setting = %key, "warm phase candidates");

        let mut body = Map::new();
        body.insert(key.clone(), value.clone());
        let body = Value::Object(body);

        let mut moved = Vec::new();
        for index in pending {
            match self
                .client
                .put_settings(std::slice::from_ref(&index), &body)
                .await
            {
                Ok(()) => {
                    info!(%table_id, %index, setting = %key, value = %warm.allocation_attr_value, "index moved to warm tier");
                    moved.push(index);
                }
                Err(e) => warn!(%table_id, %index, error = %e, "warm phase allocation failed"),
            }
        }
        self.metrics
            .record_reallocated(table_id, self.cluster.cluster_id, moved.len() as u64);
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::Fixture;
    use serde_json::json;
    use tidemark_core::{AllocationType, LogicalTable, WarmPhaseSettings};

    const SETTING: &str = "index.routing.allocation.require.box_type";

    fn warm_table(fx: &Fixture, days: i64) -> LogicalTable {
        let mut table = fx.table.clone();
        table.warm_phase_days = days;
        table.warm_phase_settings = Some(WarmPhaseSettings {
            allocation_attr_name: "box_type".to_string(),
            allocation_attr_value: "warm".to_string(),
            allocation_type: AllocationType::Require,
        });
        table
    }

    #[tokio::test]
    async fn old_indices_move_recent_stay() {
        let fx = Fixture::new();
        let old = fx.aged_index(5, 10);
        let recent = fx.aged_index(1, 10);

        let moved = fx
            .lifecycle_with(warm_table(&fx, 3))
            .reallocate_index()
            .await
            .unwrap();
        assert_eq!(moved, vec![old.clone()]);
        assert_eq!(fx.cluster.settings_of(&old)[SETTING], json!("warm"));
        assert!(!fx.cluster.settings_of(&recent).contains_key(SETTING));
        assert_eq!(fx.metrics.counters(fx.table_id(), 1).indices_reallocated, 1);
    }

    #[tokio::test]
    async fn already_allocated_indices_are_skipped() {
        let fx = Fixture::new();
        let old = fx.aged_index(5, 10);
        fx.cluster.set_index_setting(&old, SETTING, json!("warm"));

        let moved = fx
            .lifecycle_with(warm_table(&fx, 3))
            .reallocate_index()
            .await
            .unwrap();
        assert!(moved.is_empty());
        assert!(fx.cluster.operations().is_empty());
    }

    #[tokio::test]
    async fn no_warm_phase_is_a_no_op() {
        let fx = Fixture::new();
        fx.aged_index(5, 10);
        let moved = fx.lifecycle_with(warm_table(&fx, 0)).reallocate_index().await.unwrap();
        assert!(moved.is_empty());
        assert!(fx.cluster.operations().is_empty());
    }

    #[tokio::test]
    async fn allocation_failures_are_logged() {
        let fx = Fixture::new();
        fx.aged_index(5, 10);
        fx.cluster.fail_put_settings(true);
        let moved = fx.lifecycle_with(warm_table(&fx, 3)).reallocate_index().await.unwrap();
        assert!(moved.is_empty());
    }
}
