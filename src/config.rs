//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the engine and its notification subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Length of a membership billing cycle in days. A confirmed payment sets
    /// `next_payment_date = paid_at + payment_cycle_days`.
    pub payment_cycle_days: i64,

    /// Notification redelivery behaviour
    pub dispatch: DispatchConfig,

    /// Read-side paging and push channel
    pub feed: FeedConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            payment_cycle_days: 30,
            dispatch: DispatchConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

/// Configuration for best-effort notification redelivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum delivery attempts per intent, including the first one
    pub max_attempts: u32,

    /// Base backoff duration in milliseconds (will be exponentially increased)
    pub backoff_ms: u64,

    /// Factor by which the backoff_ms is increased with each retry
    pub backoff_factor: u64,

    /// Maximum backoff time in milliseconds
    pub max_backoff_ms: u64,

    /// How often the redelivery worker scans its queue
    pub retry_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 500,
            backoff_factor: 2,
            max_backoff_ms: 30_000,
            retry_interval_ms: 250,
        }
    }
}

impl DispatchConfig {
    /// Delay before the next attempt: `backoff_ms * (backoff_factor ^ attempt)`, capped.
    pub fn backoff_for(&self, attempt: u32) -> std::time::Duration {
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(attempt));
        std::time::Duration::from_millis(exponential.min(self.max_backoff_ms))
    }
}

/// Configuration for the notification feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub default_page_size: u32,
    pub max_page_size: u32,
    /// Buffered events per push subscriber before it starts lagging
    pub push_channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            default_page_size: 10,
            max_page_size: 100,
            push_channel_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = DispatchConfig {
            backoff_ms: 100,
            backoff_factor: 2,
            max_backoff_ms: 1000,
            ..Default::default()
        };
        assert_eq!(config.backoff_for(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(800));
        assert_eq!(config.backoff_for(4), Duration::from_millis(1000));
        assert_eq!(config.backoff_for(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"feed": {"max_page_size": 50}}"#).unwrap();
        assert_eq!(config.payment_cycle_days, 30);
        assert_eq!(config.feed.max_page_size, 50);
        assert_eq!(config.feed.default_page_size, 10);
        assert_eq!(config.dispatch, DispatchConfig::default());
    }
}
