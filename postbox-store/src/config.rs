use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;

use crate::{MemoryQueueStore, QueueStore, Result, SqliteQueueStore};

mod defaults {
    use std::path::PathBuf;

    pub fn path() -> PathBuf {
        PathBuf::from("postbox.db")
    }

    pub const fn wal_mode() -> bool {
        true
    }

    pub const fn busy_timeout_ms() -> u64 {
        5_000
    }
}

/// Connection settings for [`SqliteQueueStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConfig {
    pub path: PathBuf,
    /// Enable WAL journaling, which lets readers proceed during a write
    pub wal_mode: bool,
    /// How long a writer waits on another process' lock before failing
    pub busy_timeout_ms: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: defaults::path(),
            wal_mode: defaults::wal_mode(),
            busy_timeout_ms: defaults::busy_timeout_ms(),
        }
    }
}

/// Which queue store backend to use
///
/// # Examples
///
/// SQLite in RON config:
/// ```ron
/// Postbox (
///     store: Sqlite(
///         path: "/var/lib/postbox/queue.db",
///         wal_mode: true,
///     ),
/// )
/// ```
///
/// Memory-backed store for testing:
/// ```ron
/// Postbox (
///     store: Memory,
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum StoreConfig {
    /// Non-durable, single process
    Memory,
    /// Durable and shareable between processes on one host
    Sqlite {
        #[serde(default = "defaults::path")]
        path: PathBuf,
        #[serde(default = "defaults::wal_mode")]
        wal_mode: bool,
        #[serde(default = "defaults::busy_timeout_ms")]
        busy_timeout_ms: u64,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: defaults::path(),
            wal_mode: defaults::wal_mode(),
            busy_timeout_ms: defaults::busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// The database file, for backends that have one
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::Memory => None,
            Self::Sqlite { path, .. } => Some(path),
        }
    }

    /// Open the configured backend
    ///
    /// # Errors
    /// If the SQLite database cannot be opened or migrated
    pub fn into_store(self) -> Result<Arc<dyn QueueStore>> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryQueueStore::new())),
            Self::Sqlite {
                path,
                wal_mode,
                busy_timeout_ms,
            } => Ok(Arc::new(SqliteQueueStore::open(&SqliteConfig {
                path,
                wal_mode,
                busy_timeout_ms,
            })?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory() {
        let config: StoreConfig = ron::from_str("Memory").expect("parse");
        assert_eq!(config, StoreConfig::Memory);
        assert!(config.path().is_none());
    }

    #[test]
    fn test_parse_sqlite_defaults() {
        let config: StoreConfig = ron::from_str(r#"Sqlite(path: "/tmp/q.db")"#).expect("parse");
        assert_eq!(
            config,
            StoreConfig::Sqlite {
                path: PathBuf::from("/tmp/q.db"),
                wal_mode: true,
                busy_timeout_ms: 5_000,
            }
        );
    }

    #[tokio::test]
    async fn test_into_store_creates_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("queue.db");
        let store = StoreConfig::Sqlite {
            path: path.clone(),
            wal_mode: false,
            busy_timeout_ms: 100,
        }
        .into_store()
        .expect("open");

        assert_eq!(store.history_count().await.expect("count"), 0);
        assert!(path.exists());
    }
}
