//! Utility helpers

use std::time::Duration;

/// Backoff options for reconnect attempts
#[derive(Debug, Clone)]
pub struct BackoffOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Calculate exponential backoff delay for the given attempt (0-based).
pub fn backoff_delay(options: &BackoffOptions, attempt: u32) -> Duration {
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(attempt as i32);
    let capped_delay = delay_secs.min(options.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped_delay)
}

/// Serde adapter for the vendor's millisecond epoch timestamps.
pub(crate) mod timestamp_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = i64::deserialize(deserializer)?;
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {}", millis)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay() {
        let options = BackoffOptions::default();

        assert_eq!(backoff_delay(&options, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&options, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&options, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(&options, 10), Duration::from_secs(60)); // Capped at max
    }
}
