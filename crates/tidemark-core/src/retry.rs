//! Retry policy values.
//!
//! Each cluster call site carries its own policy; the executor lives in
//! `tidemark-client`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same pause after every failed attempt.
    Fixed { delay_ms: u64 },
    /// `min_ms`, doubled after every failed attempt, capped at `max_ms`.
    Exponential { min_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Pause after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { min_ms, max_ms } => {
                let shift = attempt.saturating_sub(1).min(32);
                let ms = min_ms.saturating_mul(1u64 << shift).min(max_ms);
                Duration::from_millis(ms)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
        }
    }

    pub const fn exponential(max_attempts: u32, min: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                min_ms: min.as_millis() as u64,
                max_ms: max.as_millis() as u64,
            },
        }
    }

    /// Retries without pausing.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay_ms: 0 },
        }
    }

    /// At least one attempt is always made.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_up_to_cap() {
        let policy = RetryPolicy::exponential(4, Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<u64> = (1..=6).map(|a| policy.delay_after(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn fixed_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(3));
        assert_eq!(policy.delay_after(1), Duration::from_secs(3));
        assert_eq!(policy.delay_after(3), Duration::from_secs(3));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::immediate(0).attempts(), 1);
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.delay_after(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn backoff_toml_shape() {
        let policy: RetryPolicy = toml::from_str(
            r#"
max_attempts = 4
backoff = { kind = "exponential", min_ms = 1000, max_ms = 10000 }
"#,
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(
            policy.backoff,
            Backoff::Exponential {
                min_ms: 1000,
                max_ms: 10000
            }
        );
    }
}
