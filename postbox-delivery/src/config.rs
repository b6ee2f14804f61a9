//! Hot-reloadable queue processing settings.

use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use postbox_store::QueueStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::ConfigError;

/// How ingestion treats a message whose sender and subject match a pending one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupingPolicy {
    /// Every submission creates its own record
    #[default]
    Disabled,
    /// Merge into an unlocked QUEUED or SCHEDULED record with identical
    /// sender and subject, appending recipients it does not already have
    SenderSubject,
}

/// Queue processing configuration
///
/// Every field is read at the start of a cycle through a [`ConfigHandle`]
/// snapshot, so changes apply from the next cycle on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Upper bound on candidates attempted in one dispatch cycle
    ///
    /// Default: 10
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Size of each sub-batch, and of the worker pool that drains it
    ///
    /// Default: 5
    #[serde(default = "defaults::concurrent_batch_size")]
    pub concurrent_batch_size: usize,

    /// A PROCESSING lock older than this is considered abandoned
    ///
    /// Default: 10 minutes
    #[serde(default = "defaults::lock_timeout_minutes")]
    pub lock_timeout_minutes: u64,

    /// Minimum time a RETRY record waits before it is queued again
    ///
    /// Default: 15 minutes
    #[serde(default = "defaults::retry_delay_minutes")]
    pub retry_delay_minutes: u64,

    /// Delay between the end of one dispatch cycle and the start of the next
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::dispatch_interval_secs")]
    pub dispatch_interval_secs: u64,

    /// Delay between archival cycles
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::archive_interval_secs")]
    pub archive_interval_secs: u64,

    /// Pause between sub-batches of one cycle, to smooth load on the store
    ///
    /// Default: 100 milliseconds
    #[serde(default = "defaults::batch_pause_ms")]
    pub batch_pause_ms: u64,

    /// Terminal statuses moved to history by the archival cycle
    ///
    /// Default: `[Sent]`
    #[serde(default = "defaults::archive_statuses")]
    pub archive_statuses: Vec<QueueStatus>,

    /// Retry budget given to submissions that do not set one
    #[serde(default = "defaults::max_retries")]
    pub default_max_retries: u32,

    /// Priority given to submissions that do not set one
    #[serde(default = "defaults::priority")]
    pub default_priority: i32,

    #[serde(default)]
    pub grouping: GroupingPolicy,
}

mod defaults {
    use postbox_store::QueueStatus;

    pub const fn batch_size() -> usize {
        10
    }

    pub const fn concurrent_batch_size() -> usize {
        5
    }

    pub const fn lock_timeout_minutes() -> u64 {
        10
    }

    pub const fn retry_delay_minutes() -> u64 {
        15
    }

    pub const fn dispatch_interval_secs() -> u64 {
        60
    }

    pub const fn archive_interval_secs() -> u64 {
        300
    }

    pub const fn batch_pause_ms() -> u64 {
        100
    }

    pub fn archive_statuses() -> Vec<QueueStatus> {
        vec![QueueStatus::Sent]
    }

    pub const fn max_retries() -> u32 {
        3
    }

    pub const fn priority() -> i32 {
        5
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::batch_size(),
            concurrent_batch_size: defaults::concurrent_batch_size(),
            lock_timeout_minutes: defaults::lock_timeout_minutes(),
            retry_delay_minutes: defaults::retry_delay_minutes(),
            dispatch_interval_secs: defaults::dispatch_interval_secs(),
            archive_interval_secs: defaults::archive_interval_secs(),
            batch_pause_ms: defaults::batch_pause_ms(),
            archive_statuses: defaults::archive_statuses(),
            default_max_retries: defaults::max_retries(),
            default_priority: defaults::priority(),
            grouping: GroupingPolicy::default(),
        }
    }
}

/// `value` minutes as a span that can be subtracted from the current time
fn minutes(value: u64) -> Option<TimeDelta> {
    i64::try_from(value)
        .ok()
        .and_then(TimeDelta::try_minutes)
        .filter(|span| Utc::now().checked_sub_signed(*span).is_some())
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidConfiguration {
        field,
        reason: reason.into(),
    }
}

impl QueueConfig {
    /// Reject settings the processor cannot run with.
    ///
    /// # Errors
    /// [`ConfigError::InvalidConfiguration`] naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if self.concurrent_batch_size == 0 {
            return Err(invalid("concurrent_batch_size", "must be at least 1"));
        }
        if self.lock_timeout_minutes == 0 {
            return Err(invalid("lock_timeout_minutes", "must be at least 1"));
        }
        if minutes(self.lock_timeout_minutes).is_none() {
            return Err(invalid("lock_timeout_minutes", "is too large"));
        }
        if minutes(self.retry_delay_minutes).is_none() {
            return Err(invalid("retry_delay_minutes", "is too large"));
        }
        if self.dispatch_interval_secs == 0 {
            return Err(invalid("dispatch_interval_secs", "must be at least 1"));
        }
        if self.archive_interval_secs == 0 {
            return Err(invalid("archive_interval_secs", "must be at least 1"));
        }
        if let Some(status) = self.archive_statuses.iter().find(|s| !s.is_terminal()) {
            return Err(invalid(
                "archive_statuses",
                format!("{status} is not a terminal status"),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn lock_timeout(&self) -> TimeDelta {
        minutes(self.lock_timeout_minutes).unwrap_or(TimeDelta::MAX)
    }

    #[must_use]
    pub fn retry_delay(&self) -> TimeDelta {
        minutes(self.retry_delay_minutes).unwrap_or(TimeDelta::MAX)
    }

    #[must_use]
    pub const fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    #[must_use]
    pub const fn archive_interval(&self) -> Duration {
        Duration::from_secs(self.archive_interval_secs)
    }

    #[must_use]
    pub const fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }
}

/// Shared, atomically swappable [`QueueConfig`].
///
/// Readers take an `Arc` snapshot and keep it for the whole cycle; writers
/// replace the snapshot wholesale. Only validated configs are ever published.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<QueueConfig>>>,
}

impl ConfigHandle {
    /// # Errors
    /// If `config` does not validate
    pub fn new(config: QueueConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (tx, _rx) = watch::channel(Arc::new(config));
        Ok(Self { tx: Arc::new(tx) })
    }

    /// The current configuration
    #[must_use]
    pub fn snapshot(&self) -> Arc<QueueConfig> {
        Arc::clone(&self.tx.borrow())
    }

    /// Publish a new configuration, keeping the current one if it is invalid.
    ///
    /// # Errors
    /// If `config` does not validate
    pub fn update(&self, config: QueueConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.tx.send_replace(Arc::new(config));
        Ok(())
    }

    /// Be notified whenever a new configuration is published
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<QueueConfig>> {
        self.tx.subscribe()
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(QueueConfig::default()));
        Self { tx: Arc::new(tx) }
    }
}
