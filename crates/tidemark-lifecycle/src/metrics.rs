//! Per-table lifecycle counters and their Prometheus text rendering.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};

use crate::rotation::RotationReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RotationStatus {
    Success,
    Failed,
}

impl RotationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RotationStatus::Success => "SUCCESS",
            RotationStatus::Failed => "FAILED",
        }
    }
}

/// Counters of one table on one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableCounters {
    pub rotations: BTreeMap<RotationStatus, u64>,
    pub rotation_reasons: BTreeMap<RotationReason, u64>,
    pub rotations_skipped: u64,
    pub aliases_bound: u64,
    pub alias_bind_failures: u64,
    pub indices_deleted: u64,
    pub snapshots_created: u64,
    pub snapshots_failed: u64,
    pub snapshots_deleted: u64,
    pub indices_reallocated: u64,
}

/// Key: `(table_id, cluster_id)`.
type Key = (String, u32);

#[derive(Debug, Default)]
pub struct LifecycleMetrics {
    tables: Mutex<BTreeMap<Key, TableCounters>>,
}

impl LifecycleMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, table_id: &str, cluster_id: u32, f: impl FnOnce(&mut TableCounters)) {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        f(tables
            .entry((table_id.to_string(), cluster_id))
            .or_default());
    }

    pub fn record_rotation(&self, table_id: &str, cluster_id: u32, status: RotationStatus) {
        self.update(table_id, cluster_id, |c| {
            *c.rotations.entry(status).or_default() += 1;
        });
    }

    pub fn record_reason(&self, table_id: &str, cluster_id: u32, reason: RotationReason) {
        self.update(table_id, cluster_id, |c| {
            *c.rotation_reasons.entry(reason).or_default() += 1;
        });
    }

    pub fn record_rotation_skipped(&self, table_id: &str, cluster_id: u32) {
        self.update(table_id, cluster_id, |c| c.rotations_skipped += 1);
    }

    pub fn record_alias_bind(&self, table_id: &str, cluster_id: u32, ok: bool) {
        self.update(table_id, cluster_id, |c| {
            if ok {
                c.aliases_bound += 1;
            } else {
                c.alias_bind_failures += 1;
            }
        });
    }

    pub fn record_indices_deleted(&self, table_id: &str, cluster_id: u32, n: u64) {
        if n > 0 {
            self.update(table_id, cluster_id, |c| c.indices_deleted += n);
        }
    }

    pub fn record_snapshot(&self, table_id: &str, cluster_id: u32, ok: bool) {
        self.update(table_id, cluster_id, |c| {
            if ok {
                c.snapshots_created += 1;
            } else {
                c.snapshots_failed += 1;
            }
        });
    }

    pub fn record_snapshots_deleted(&self, table_id: &str, cluster_id: u32, n: u64) {
        if n > 0 {
            self.update(table_id, cluster_id, |c| c.snapshots_deleted += n);
        }
    }

    pub fn record_reallocated(&self, table_id: &str, cluster_id: u32, n: u64) {
        if n > 0 {
            self.update(table_id, cluster_id, |c| c.indices_reallocated += n);
        }
    }

    pub fn counters(&self, table_id: &str, cluster_id: u32) -> TableCounters {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(table_id.to_string(), cluster_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Render all counters in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let tables = self
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut out = String::new();

        header(
            &mut out,
            "tidemark_index_rotate_total",
            "Index rotations attempted, by outcome.",
        );
        for ((table, cluster), c) in &tables {
            for (status, n) in &c.rotations {
                let _ = writeln!(
                    out,
                    "tidemark_index_rotate_total{{table_id=\"{table}\",storage_cluster_id=\"{cluster}\",status=\"{}\"}} {n}",
                    status.as_str()
                );
            }
        }

        header(
            &mut out,
            "tidemark_index_rotate_reason_total",
            "Rotation triggers that fired, by reason.",
        );
        for ((table, cluster), c) in &tables {
            for (reason, n) in &c.rotation_reasons {
                let _ = writeln!(
                    out,
                    "tidemark_index_rotate_reason_total{{table_id=\"{table}\",storage_cluster_id=\"{cluster}\",reason=\"{}\"}} {n}",
                    reason.code()
                );
            }
        }

        let simple: [(&str, &str, fn(&TableCounters) -> u64); 8] = [
            (
                "tidemark_index_rotate_skipped_total",
                "Rotations deferred because the current index has no alias yet.",
                |c| c.rotations_skipped,
            ),
            (
                "tidemark_alias_bind_total",
                "Alias buckets bound successfully.",
                |c| c.aliases_bound,
            ),
            (
                "tidemark_alias_bind_failed_total",
                "Alias buckets whose binding failed.",
                |c| c.alias_bind_failures,
            ),
            (
                "tidemark_index_deleted_total",
                "Indices deleted by cleanup.",
                |c| c.indices_deleted,
            ),
            (
                "tidemark_snapshot_created_total",
                "Snapshots created.",
                |c| c.snapshots_created,
            ),
            (
                "tidemark_snapshot_failed_total",
                "Snapshot requests that failed.",
                |c| c.snapshots_failed,
            ),
            (
                "tidemark_snapshot_deleted_total",
                "Expired snapshots purged.",
                |c| c.snapshots_deleted,
            ),
            (
                "tidemark_index_reallocated_total",
                "Indices moved to the warm tier.",
                |c| c.indices_reallocated,
            ),
        ];
        for (name, help, get) in simple {
            header(&mut out, name, help);
            for ((table, cluster), c) in &tables {
                let _ = writeln!(
                    out,
                    "{name}{{table_id=\"{table}\",storage_cluster_id=\"{cluster}\"}} {}",
                    get(c)
                );
            }
        }

        out
    }
}

fn header(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_empty() {
        let output = LifecycleMetrics::new().render_prometheus();
        assert!(output.contains("# HELP tidemark_index_rotate_total"));
        assert!(output.contains("# TYPE tidemark_index_deleted_total counter"));
    }

    #[test]
    fn render_counts_per_table() {
        let metrics = LifecycleMetrics::new();
        metrics.record_rotation("2_bklog.a", 1, RotationStatus::Success);
        metrics.record_rotation("2_bklog.a", 1, RotationStatus::Success);
        metrics.record_rotation("2_bklog.a", 1, RotationStatus::Failed);
        metrics.record_reason("2_bklog.a", 1, RotationReason::OverSliceSize);
        metrics.record_indices_deleted("2_bklog.b", 2, 3);

        let output = metrics.render_prometheus();
        assert!(output.contains(
            "tidemark_index_rotate_total{table_id=\"2_bklog.a\",storage_cluster_id=\"1\",status=\"SUCCESS\"} 2"
        ));
        assert!(output.contains("status=\"FAILED\"} 1"));
        assert!(output.contains("reason=\"INDEX_OVER_SLICE_SIZE\"} 1"));
        assert!(output.contains(
            "tidemark_index_deleted_total{table_id=\"2_bklog.b\",storage_cluster_id=\"2\"} 3"
        ));

        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            assert!(line.contains('{') && line.contains('}'), "line should have labels: {line}");
        }
    }

    #[test]
    fn zero_increments_are_not_recorded() {
        let metrics = LifecycleMetrics::new();
        metrics.record_indices_deleted("t", 1, 0);
        assert_eq!(metrics.counters("t", 1), TableCounters::default());
        assert!(!metrics.render_prometheus().contains("table_id=\"t\""));
    }
}
