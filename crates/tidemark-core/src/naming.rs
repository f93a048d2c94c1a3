//! Physical index and alias naming.
//!
//! Two index schemes coexist:
//!
//! ```text
//! v2_<base>_<bucket>_<seq>     every index created today
//! <base>_<bucket>_<seq>        legacy, still read and cleaned
//! ```
//!
//! Aliases carry the bucket they serve:
//!
//! ```text
//! write_<bucket>_<base>        write alias
//! <base>_<bucket>_write        legacy write alias, bound alongside
//! <base>_<bucket>_read         read alias
//! ```
//!
//! `<base>` is the table id with `.` replaced by `_`. Parsing never returns
//! a silent `None`: a name either yields a typed value or a [`NameError`].

use std::fmt;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{CoreError, CoreResult};

/// Prefix of indices restored from a snapshot; never touched by cleanup.
pub const RESTORE_PREFIX: &str = "restore_";

/// Snapshots are taken at most once per day.
pub const SNAPSHOT_DATE_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexVersion {
    V1,
    V2,
}

impl fmt::Display for IndexVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexVersion::V1 => f.write_str("v1"),
            IndexVersion::V2 => f.write_str("v2"),
        }
    }
}

/// A physical index name taken apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedIndex {
    pub table: String,
    pub bucket: String,
    pub seq: u32,
    pub version: IndexVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasKind {
    Write,
    Read,
    LegacyWrite,
}

/// An alias name taken apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAlias {
    pub bucket: String,
    pub kind: AliasKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("index `{0}` does not follow the naming scheme of this table")]
    ForeignIndex(String),

    #[error("alias `{0}` does not follow the naming scheme of this table")]
    ForeignAlias(String),

    #[error("snapshot `{0}` does not follow the naming scheme of this table")]
    ForeignSnapshot(String),

    #[error("sequence number in `{0}` is out of range")]
    BadSequence(String),
}

/// Table id → base used inside every index and alias name.
pub fn base_name(table_id: &str) -> String {
    table_id.replace('.', "_")
}

/// Physical index name for `(base, bucket, seq, version)`.
pub fn index_name(base: &str, bucket: &str, seq: u32, version: IndexVersion) -> String {
    match version {
        IndexVersion::V2 => format!("v2_{base}_{bucket}_{seq}"),
        IndexVersion::V1 => format!("{base}_{bucket}_{seq}"),
    }
}

pub fn is_restore_index(index: &str) -> bool {
    index.starts_with(RESTORE_PREFIX)
}

/// Compiled name patterns for one table.
#[derive(Debug, Clone)]
pub struct IndexNaming {
    base: String,
    v1: Regex,
    v2: Regex,
    write: Regex,
    legacy_write: Regex,
    read: Regex,
    snapshot: Regex,
}

impl IndexNaming {
    pub fn new(table_id: &str) -> CoreResult<Self> {
        let base = base_name(table_id);
        let quoted = regex::escape(&base);
        let compile = |pattern: String| {
            Regex::new(&pattern).map_err(|e| CoreError::Pattern(e.to_string()))
        };
        Ok(Self {
            v1: compile(format!(r"^{quoted}_(\d+)_(\d+)$"))?,
            v2: compile(format!(r"^v2_{quoted}_(\d+)_(\d+)$"))?,
            write: compile(format!(r"^write_(\d+)_{quoted}$"))?,
            legacy_write: compile(format!(r"^{quoted}_(\d+)_write$"))?,
            read: compile(format!(r"^{quoted}_(\d+)_read$"))?,
            snapshot: compile(format!(r"^{quoted}_snapshot_(\d+)$"))?,
            base,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn index_name(&self, bucket: &str, seq: u32, version: IndexVersion) -> String {
        index_name(&self.base, bucket, seq, version)
    }

    pub fn write_alias(&self, bucket: &str) -> String {
        format!("write_{bucket}_{}", self.base)
    }

    pub fn legacy_write_alias(&self, bucket: &str) -> String {
        format!("{}_{bucket}_write", self.base)
    }

    pub fn read_alias(&self, bucket: &str) -> String {
        format!("{}_{bucket}_read", self.base)
    }

    /// Wildcard matching every index of one scheme.
    pub fn search_pattern(&self, version: IndexVersion) -> String {
        match version {
            IndexVersion::V2 => format!("v2_{}_*", self.base),
            IndexVersion::V1 => format!("{}_*", self.base),
        }
    }

    /// Wildcard used when listing aliases; also matches restored copies.
    pub fn alias_lookup_pattern(&self) -> String {
        format!("*{}_*_*", self.base)
    }

    pub fn snapshot_pattern(&self) -> String {
        format!("{}_snapshot_*", self.base)
    }

    pub fn snapshot_name(&self, day: NaiveDate) -> String {
        format!("{}_snapshot_{}", self.base, day.format(SNAPSHOT_DATE_FORMAT))
    }

    pub fn parse_index(&self, name: &str) -> Result<ParsedIndex, NameError> {
        let (caps, version) = if let Some(caps) = self.v2.captures(name) {
            (caps, IndexVersion::V2)
        } else if let Some(caps) = self.v1.captures(name) {
            (caps, IndexVersion::V1)
        } else {
            return Err(NameError::ForeignIndex(name.to_string()));
        };
        let seq = caps[2]
            .parse::<u32>()
            .map_err(|_| NameError::BadSequence(name.to_string()))?;
        Ok(ParsedIndex {
            table: self.base.clone(),
            bucket: caps[1].to_string(),
            seq,
            version,
        })
    }

    /// Extract the bucket of an alias, trying write, read, then legacy write.
    pub fn parse_alias(&self, alias: &str) -> Result<ParsedAlias, NameError> {
        let candidates = [
            (&self.write, AliasKind::Write),
            (&self.read, AliasKind::Read),
            (&self.legacy_write, AliasKind::LegacyWrite),
        ];
        candidates
            .into_iter()
            .find_map(|(re, kind)| {
                re.captures(alias).map(|caps| ParsedAlias {
                    bucket: caps[1].to_string(),
                    kind,
                })
            })
            .ok_or_else(|| NameError::ForeignAlias(alias.to_string()))
    }

    /// Extract the day of a snapshot name.
    pub fn parse_snapshot(&self, name: &str) -> Result<NaiveDate, NameError> {
        let caps = self
            .snapshot
            .captures(name)
            .ok_or_else(|| NameError::ForeignSnapshot(name.to_string()))?;
        NaiveDate::parse_from_str(&caps[1], SNAPSHOT_DATE_FORMAT)
            .map_err(|_| NameError::ForeignSnapshot(name.to_string()))
    }
}
