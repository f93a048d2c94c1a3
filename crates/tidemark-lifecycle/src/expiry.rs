//! Alias expiry grouping.
//!
//! Every alias carries the bucket it serves. An alias is still live while
//! its bucket lies after `now - days`; anything older is expired. Grouping
//! is pure: it touches no cluster and classifies every alias exactly once.

use std::collections::BTreeMap;

use chrono::{NaiveDateTime, TimeDelta};
use tracing::debug;

use tidemark_core::IndexNaming;
use tidemark_core::bucket::parse_bucket;

/// Aliases of one index split by expiry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasGroup {
    pub expired: Vec<String>,
    pub not_expired: Vec<String>,
}

impl AliasGroup {
    /// At least one alias still serves a live bucket.
    pub fn is_live(&self) -> bool {
        !self.not_expired.is_empty()
    }

    pub fn len(&self) -> usize {
        self.expired.len() + self.not_expired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inputs of one grouping pass.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryWindow<'a> {
    pub naming: &'a IndexNaming,
    pub date_format: &'a str,
    /// Table-local now.
    pub now: NaiveDateTime,
    /// Days kept, delay buffer already added.
    pub days: i64,
    /// Aliases without a readable bucket count as live.
    pub retain_invalid: bool,
}

impl ExpiryWindow<'_> {
    pub fn expired_point(&self) -> NaiveDateTime {
        self.now - TimeDelta::days(self.days)
    }

    /// Whether one alias is still live.
    pub fn is_live(&self, alias: &str) -> bool {
        let bucket = match self.naming.parse_alias(alias) {
            Ok(parsed) => parsed.bucket,
            Err(_) => return self.retain_invalid,
        };
        match parse_bucket(&bucket, self.date_format) {
            Ok(at) => at > self.expired_point(),
            Err(e) => {
                debug!(%alias, error = %e, "alias bucket unreadable");
                self.retain_invalid
            }
        }
    }
}

/// Split every alias of every index into expired and not expired.
pub fn group_expired_alias(
    aliases: &BTreeMap<String, Vec<String>>,
    window: &ExpiryWindow<'_>,
) -> BTreeMap<String, AliasGroup> {
    aliases
        .iter()
        .map(|(index, names)| {
            let mut group = AliasGroup::default();
            for alias in names {
                if window.is_live(alias) {
                    group.not_expired.push(alias.clone());
                } else {
                    group.expired.push(alias.clone());
                }
            }
            (index.clone(), group)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 31)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap()
    }

    fn bucket_days_ago(days: i64) -> String {
        (now() - TimeDelta::days(days)).format("%Y%m%d%H").to_string()
    }

    fn window(naming: &IndexNaming, days: i64, retain_invalid: bool) -> ExpiryWindow<'_> {
        ExpiryWindow {
            naming,
            date_format: "%Y%m%d%H",
            now: now(),
            days,
            retain_invalid,
        }
    }

    #[test]
    fn retention_with_delay_buffer() {
        let naming = IndexNaming::new("2_bklog.demo").unwrap();
        let old = naming.write_alias(&bucket_days_ago(32));
        let edge = naming.read_alias(&bucket_days_ago(30));
        let aliases = BTreeMap::from([(
            "v2_2_bklog_demo_2024022900_0".to_string(),
            vec![old.clone(), edge.clone()],
        )]);

        // retention 30 + 1 day delay
        let groups = group_expired_alias(&aliases, &window(&naming, 31, true));
        let group = &groups["v2_2_bklog_demo_2024022900_0"];
        assert_eq!(group.expired, vec![old]);
        assert_eq!(group.not_expired, vec![edge]);
    }

    #[test]
    fn every_alias_lands_in_exactly_one_side() {
        let naming = IndexNaming::new("t").unwrap();
        let mut aliases = BTreeMap::new();
        for (i, days) in [0i64, 3, 7, 8, 40].into_iter().enumerate() {
            let bucket = bucket_days_ago(days);
            aliases.insert(
                format!("v2_t_{bucket}_{i}"),
                vec![
                    naming.write_alias(&bucket),
                    naming.read_alias(&bucket),
                    naming.legacy_write_alias(&bucket),
                    "custom-alias".to_string(),
                    "t_9999999999999_write".to_string(),
                ],
            );
        }
        aliases.insert("v2_t_2024010100_0".to_string(), Vec::new());

        for retain in [true, false] {
            let groups = group_expired_alias(&aliases, &window(&naming, 7, retain));
            assert_eq!(groups.len(), aliases.len());
            for (index, names) in &aliases {
                let group = &groups[index];
                assert_eq!(group.len(), names.len());
                for alias in names {
                    let hits = group.expired.iter().filter(|a| *a == alias).count()
                        + group.not_expired.iter().filter(|a| *a == alias).count();
                    assert_eq!(hits, 1, "{alias} classified {hits} times");
                }
            }
        }
    }

    #[test]
    fn unreadable_aliases_follow_leniency() {
        let naming = IndexNaming::new("t").unwrap();
        let aliases = BTreeMap::from([(
            "v2_t_2024033100_0".to_string(),
            vec!["hand-made".to_string(), "write_99999999999999_t".to_string()],
        )]);

        let kept = group_expired_alias(&aliases, &window(&naming, 7, true));
        assert_eq!(kept["v2_t_2024033100_0"].not_expired.len(), 2);

        let dropped = group_expired_alias(&aliases, &window(&naming, 7, false));
        assert_eq!(dropped["v2_t_2024033100_0"].expired.len(), 2);
    }

    #[test]
    fn no_delay_for_warm_phase_window() {
        let naming = IndexNaming::new("t").unwrap();
        let alias = naming.write_alias(&bucket_days_ago(3));
        let aliases = BTreeMap::from([("i".to_string(), vec![alias])]);
        // Three days old: expired at 2 days, live at 3 + 1.
        assert!(!group_expired_alias(&aliases, &window(&naming, 2, true))["i"].is_live());
        assert!(group_expired_alias(&aliases, &window(&naming, 4, true))["i"].is_live());
    }
}
