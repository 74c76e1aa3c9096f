use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// When buffered log writes are flushed to durable storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Leave flushing to the operating system.
    Never,
    /// Fsync at roughly one second intervals from a background task.
    #[default]
    EverySecond,
    /// Fsync on every commit.
    Always,
}

impl FromStr for SyncPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "never" => Ok(SyncPolicy::Never),
            "everysecond" => Ok(SyncPolicy::EverySecond),
            "always" => Ok(SyncPolicy::Always),
            _ => Err(Error::InvalidSyncPolicy),
        }
    }
}

impl std::fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SyncPolicy::Never => write!(f, "never"),
            SyncPolicy::EverySecond => write!(f, "everysecond"),
            SyncPolicy::Always => write!(f, "always"),
        }
    }
}

/// Configuration for the database
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// When commits are fsynced to disk (default: every second)
    pub sync_policy: SyncPolicy,

    /// Log growth percentage over the last shrink size that triggers an
    /// automatic shrink (default: 100)
    pub auto_shrink_percentage: u64,

    /// Minimum log size in bytes before automatic shrink is considered
    /// (default: 32MB)
    pub auto_shrink_min_size: u64,

    /// How often the expiry sweeper runs (default: 100ms)
    pub sweep_interval: Duration,

    /// How often the every-second sync task runs (default: 1s)
    pub sync_interval: Duration,

    /// How often the auto-shrink watcher runs (default: 1m)
    pub shrink_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::EverySecond,
            auto_shrink_percentage: 100,
            auto_shrink_min_size: 32 * 1024 * 1024, // 32MB
            sweep_interval: Duration::from_millis(100),
            sync_interval: Duration::from_secs(1),
            shrink_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Set the sync policy
    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    /// Set the auto-shrink growth percentage
    pub fn auto_shrink_percentage(mut self, percentage: u64) -> Self {
        self.auto_shrink_percentage = percentage;
        self
    }

    /// Set the auto-shrink minimum size
    pub fn auto_shrink_min_size(mut self, size: u64) -> Self {
        self.auto_shrink_min_size = size;
        self
    }

    /// Set the expiry sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the every-second sync interval
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set the auto-shrink check interval
    pub fn shrink_interval(mut self, interval: Duration) -> Self {
        self.shrink_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sync_policy, SyncPolicy::EverySecond);
        assert_eq!(config.auto_shrink_percentage, 100);
        assert_eq!(config.auto_shrink_min_size, 32 * 1024 * 1024);
        assert_eq!(config.sweep_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_config_builder() {
        let config = Config::default()
            .sync_policy(SyncPolicy::Always)
            .auto_shrink_percentage(200)
            .auto_shrink_min_size(64 * 1024)
            .sweep_interval(Duration::from_millis(10));

        assert_eq!(config.sync_policy, SyncPolicy::Always);
        assert_eq!(config.auto_shrink_percentage, 200);
        assert_eq!(config.auto_shrink_min_size, 64 * 1024);
        assert_eq!(config.sweep_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_sync_policy_from_str() {
        assert_eq!("never".parse::<SyncPolicy>(), Ok(SyncPolicy::Never));
        assert_eq!(
            "everysecond".parse::<SyncPolicy>(),
            Ok(SyncPolicy::EverySecond)
        );
        assert_eq!("always".parse::<SyncPolicy>(), Ok(SyncPolicy::Always));
        assert_eq!(
            "sometimes".parse::<SyncPolicy>(),
            Err(Error::InvalidSyncPolicy)
        );
    }
}
