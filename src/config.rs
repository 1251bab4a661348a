//! Database configuration and per-operation options.
//!
//! The configuration is designed to be serializable and loadable from JSON
//! while keeping complexity minimal. Callback hooks and the injectable time
//! source are runtime-only and skipped during (de)serialization.

use crate::error::{AtollError, Result};
use crate::tx::Tx;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Synchronization policy for the persistence log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Never fsync (fastest, least safe).
    Never,
    /// Fsync at most once per second from the background manager
    /// (recommended default).
    #[default]
    EverySecond,
    /// Fsync as part of every commit (slowest, safest).
    Always,
}

impl FromStr for SyncPolicy {
    type Err = AtollError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "never" => Ok(SyncPolicy::Never),
            "everysecond" | "every_second" => Ok(SyncPolicy::EverySecond),
            "always" => Ok(SyncPolicy::Always),
            _ => Err(AtollError::InvalidSyncPolicy),
        }
    }
}

/// File synchronization strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Call `fsync` / `File::sync_all` to persist metadata + data.
    #[default]
    All,
    /// Call `fdatasync` / `File::sync_data` to persist data only.
    Data,
}

/// Hook invoked after commit with the keys that expired during a sweep.
/// When set, the sweeper defers deletion to the hook.
pub type OnExpired = Arc<dyn Fn(Vec<Bytes>) + Send + Sync>;

/// Synchronous expiration hook, invoked per item inside the sweeper's write
/// transaction. The hook decides whether to delete the item.
pub type OnExpiredSync = Arc<dyn Fn(&[u8], &[u8], &Tx) -> Result<()> + Send + Sync>;

/// Injectable wall-clock, used by TTL bookkeeping and the sweeper.
pub type TimeSource = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// Database configuration.
///
/// # Example
///
/// ```rust
/// use atoll::{Config, SyncPolicy};
///
/// let config = Config::default().with_sync_policy(SyncPolicy::Always);
/// assert_eq!(config.sync_policy, SyncPolicy::Always);
///
/// let json = r#"{
///     "sync_policy": "always",
///     "auto_shrink_percentage": 50
/// }"#;
/// let config = Config::from_json(json).unwrap();
/// assert_eq!(config.auto_shrink_percentage, 50);
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// How often log writes are synced to disk.
    #[serde(default)]
    pub sync_policy: SyncPolicy,

    /// Controls whether syncs issue `fsync` or `fdatasync`.
    #[serde(default)]
    pub sync_mode: SyncMode,

    /// Auto-shrink fires when the log grows past
    /// `(100 + pct)%` of its size after the last shrink.
    #[serde(default = "Config::default_auto_shrink_percentage")]
    pub auto_shrink_percentage: u64,

    /// Floor below which auto-shrink is suppressed.
    #[serde(default = "Config::default_auto_shrink_min_size")]
    pub auto_shrink_min_size: u64,

    /// Disables the automatic shrink entirely; `Db::shrink` still works.
    #[serde(default)]
    pub auto_shrink_disabled: bool,

    /// Interval between background expiration sweeps, in seconds.
    #[serde(default = "Config::default_expiration_tick_seconds")]
    pub expiration_tick_seconds: f64,

    /// Deferred expiration hook. See [`OnExpired`].
    #[serde(skip)]
    pub on_expired: Option<OnExpired>,

    /// Synchronous expiration hook. See [`OnExpiredSync`].
    #[serde(skip)]
    pub on_expired_sync: Option<OnExpiredSync>,

    /// Replacement wall-clock, mainly for tests.
    #[serde(skip)]
    pub time_source: Option<TimeSource>,
}

impl Config {
    const fn default_auto_shrink_percentage() -> u64 {
        100
    }

    const fn default_auto_shrink_min_size() -> u64 {
        32 * 1024 * 1024
    }

    const fn default_expiration_tick_seconds() -> f64 {
        1.0
    }

    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    pub fn with_auto_shrink_percentage(mut self, pct: u64) -> Self {
        self.auto_shrink_percentage = pct;
        self
    }

    pub fn with_auto_shrink_min_size(mut self, bytes: u64) -> Self {
        self.auto_shrink_min_size = bytes;
        self
    }

    pub fn with_auto_shrink_disabled(mut self, disabled: bool) -> Self {
        self.auto_shrink_disabled = disabled;
        self
    }

    pub fn with_expiration_tick(mut self, tick: Duration) -> Self {
        self.expiration_tick_seconds = tick.as_secs_f64();
        self
    }

    pub fn with_on_expired(mut self, hook: OnExpired) -> Self {
        self.on_expired = Some(hook);
        self
    }

    pub fn with_on_expired_sync(mut self, hook: OnExpiredSync) -> Self {
        self.on_expired_sync = Some(hook);
        self
    }

    pub fn with_time_source(mut self, clock: TimeSource) -> Self {
        self.time_source = Some(clock);
        self
    }

    /// The sweep interval as a `Duration`, clamped to something sane.
    pub fn expiration_tick(&self) -> Duration {
        if self.expiration_tick_seconds.is_finite() && self.expiration_tick_seconds > 0.0 {
            Duration::from_secs_f64(self.expiration_tick_seconds)
        } else {
            Duration::from_secs(1)
        }
    }

    /// Current time according to the configured time source.
    pub(crate) fn now(&self) -> SystemTime {
        match &self.time_source {
            Some(clock) => clock(),
            None => SystemTime::now(),
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.expiration_tick_seconds.is_finite() || self.expiration_tick_seconds <= 0.0 {
            return Err("Expiration tick must be a positive number of seconds".to_string());
        }
        Ok(())
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        let config: Config = serde_json::from_str(json)?;
        if let Err(e) = config.validate() {
            return Err(serde::de::Error::custom(e));
        }
        Ok(config)
    }

    /// Save configuration as a JSON string.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::default(),
            sync_mode: SyncMode::default(),
            auto_shrink_percentage: Self::default_auto_shrink_percentage(),
            auto_shrink_min_size: Self::default_auto_shrink_min_size(),
            auto_shrink_disabled: false,
            expiration_tick_seconds: Self::default_expiration_tick_seconds(),
            on_expired: None,
            on_expired_sync: None,
            time_source: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("sync_policy", &self.sync_policy)
            .field("sync_mode", &self.sync_mode)
            .field("auto_shrink_percentage", &self.auto_shrink_percentage)
            .field("auto_shrink_min_size", &self.auto_shrink_min_size)
            .field("auto_shrink_disabled", &self.auto_shrink_disabled)
            .field("expiration_tick_seconds", &self.expiration_tick_seconds)
            .field("on_expired", &self.on_expired.is_some())
            .field("on_expired_sync", &self.on_expired_sync.is_some())
            .field("time_source", &self.time_source.is_some())
            .finish()
    }
}

/// Options for set operations with optional TTL.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Time-to-live for this item, measured from the moment of the set.
    pub ttl: Option<Duration>,
    /// Absolute expiration time (takes precedence over TTL).
    pub expires_at: Option<SystemTime>,
}

impl SetOptions {
    /// Create options with a TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            expires_at: None,
        }
    }

    /// Create options with an absolute expiration time.
    pub fn with_expiration(expires_at: SystemTime) -> Self {
        Self {
            ttl: None,
            expires_at: Some(expires_at),
        }
    }

    /// The effective deadline relative to `now`.
    pub fn effective_deadline(&self, now: SystemTime) -> Option<SystemTime> {
        self.expires_at.or_else(|| self.ttl.map(|ttl| now + ttl))
    }
}

/// Additional features for secondary and spatial indexes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOptions {
    /// Match patterns against lowercased keys; the pattern itself is folded
    /// at index creation.
    pub case_insensitive_key_matching: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.sync_policy, SyncPolicy::EverySecond);
        assert_eq!(config.sync_mode, SyncMode::All);
        assert_eq!(config.auto_shrink_percentage, 100);
        assert_eq!(config.auto_shrink_min_size, 32 * 1024 * 1024);
        assert!(!config.auto_shrink_disabled);
        assert_eq!(config.expiration_tick(), Duration::from_secs(1));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default()
            .with_sync_policy(SyncPolicy::Always)
            .with_sync_mode(SyncMode::Data)
            .with_auto_shrink_percentage(50);

        let json = config.to_json().unwrap();
        let deserialized = Config::from_json(&json).unwrap();
        assert_eq!(deserialized.sync_policy, SyncPolicy::Always);
        assert_eq!(deserialized.sync_mode, SyncMode::Data);
        assert_eq!(deserialized.auto_shrink_percentage, 50);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.expiration_tick_seconds = 0.0;
        assert!(config.validate().is_err());

        config.expiration_tick_seconds = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sync_policy_from_str() {
        assert_eq!("never".parse::<SyncPolicy>().unwrap(), SyncPolicy::Never);
        assert_eq!(
            "everysecond".parse::<SyncPolicy>().unwrap(),
            SyncPolicy::EverySecond
        );
        assert_eq!("always".parse::<SyncPolicy>().unwrap(), SyncPolicy::Always);
        assert!(matches!(
            "sometimes".parse::<SyncPolicy>(),
            Err(AtollError::InvalidSyncPolicy)
        ));
    }

    #[test]
    fn test_set_options_deadline() {
        let now = SystemTime::now();

        let ttl_opts = SetOptions::with_ttl(Duration::from_secs(60));
        assert_eq!(
            ttl_opts.effective_deadline(now),
            Some(now + Duration::from_secs(60))
        );

        let at = now + Duration::from_secs(5);
        let abs_opts = SetOptions::with_expiration(at);
        assert_eq!(abs_opts.effective_deadline(now), Some(at));

        assert_eq!(SetOptions::default().effective_deadline(now), None);
    }
}
