//! Time bucket formatting and parsing.
//!
//! A bucket is the wall-clock window an index covers, rendered through the
//! table's `date_format` (`%Y%m%d%H` by default). All bucket arithmetic is
//! done on naive timestamps already shifted into the table's time zone.

use std::fmt::Write as _;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};

use crate::error::{CoreError, CoreResult};

pub const DEFAULT_DATE_FORMAT: &str = "%Y%m%d%H";

/// Smallest and largest accepted time zone offsets, in hours.
pub const MIN_TIME_ZONE: i32 = -12;
pub const MAX_TIME_ZONE: i32 = 12;

/// Current wall-clock time as seen by a table with the given hour offset.
pub fn local_now(utc: DateTime<Utc>, time_zone: i32) -> NaiveDateTime {
    utc.naive_utc() + TimeDelta::hours(i64::from(time_zone))
}

/// Reject offsets outside `-12..=12`.
pub fn check_time_zone(time_zone: i32) -> CoreResult<()> {
    if (MIN_TIME_ZONE..=MAX_TIME_ZONE).contains(&time_zone) {
        Ok(())
    } else {
        Err(CoreError::InvalidTimeZone(time_zone))
    }
}

/// Render `at` with `format`.
pub fn format_bucket(at: NaiveDateTime, format: &str) -> CoreResult<String> {
    let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(CoreError::InvalidDateFormat(format.to_string()));
    }
    let mut out = String::new();
    write!(out, "{}", at.format_with_items(items.into_iter()))
        .map_err(|_| CoreError::InvalidDateFormat(format.to_string()))?;
    Ok(out)
}

/// A date format is usable for index names only if it renders to a
/// non-empty run of ASCII digits.
pub fn check_date_format(format: &str) -> CoreResult<()> {
    let sample = NaiveDate::from_ymd_opt(2020, 1, 1)
        .map(|d| d.and_time(NaiveTime::MIN))
        .ok_or_else(|| CoreError::InvalidDateFormat(format.to_string()))?;
    let rendered = format_bucket(sample, format)?;
    if rendered.is_empty() || !rendered.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoreError::InvalidDateFormat(format.to_string()));
    }
    Ok(())
}

/// Parse a bucket string back into the start of its window.
///
/// Coarse formats (`%Y%m%d%H`, `%Y%m%d`, `%Y%m`) leave minutes, hours or
/// days unspecified; those default to the start of the window.
pub fn parse_bucket(value: &str, format: &str) -> CoreResult<NaiveDateTime> {
    let invalid = || CoreError::InvalidBucket {
        value: value.to_string(),
        format: format.to_string(),
    };
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if let Ok(at) = NaiveDateTime::parse_from_str(value, format) {
        return Ok(at);
    }
    if let Ok(at) = NaiveDateTime::parse_from_str(&format!("{value}00"), &format!("{format}%M")) {
        return Ok(at);
    }
    if let Ok(day) = NaiveDate::parse_from_str(value, format) {
        return Ok(day.and_time(NaiveTime::MIN));
    }
    if let Ok(day) = NaiveDate::parse_from_str(&format!("{value}01"), &format!("{format}%d")) {
        return Ok(day.and_time(NaiveTime::MIN));
    }
    Err(invalid())
}
