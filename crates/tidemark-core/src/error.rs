//! Configuration errors raised while validating tables, clusters and buckets.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("date format `{0}` must render to digits only")]
    InvalidDateFormat(String),

    #[error("bucket `{value}` does not match date format `{format}`")]
    InvalidBucket { value: String, format: String },

    #[error("time zone offset {0} is outside -12..=12")]
    InvalidTimeZone(i32),

    #[error("warm phase settings incomplete: {0}")]
    InvalidWarmPhase(String),

    #[error("table id is empty")]
    EmptyTableId,

    #[error("retention must be at least one day, got {0}")]
    InvalidRetention(i64),

    #[error("slice_size must be positive")]
    InvalidSliceSize,

    #[error("slice_gap must be a positive number of minutes, got {0}")]
    InvalidSliceGap(i64),

    #[error("invalid name pattern: {0}")]
    Pattern(String),
}
