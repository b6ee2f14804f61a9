use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use postbox_common::internal;
use rusqlite::{
    Connection, OptionalExtension, Row, Transaction, params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
};

use crate::{
    ArchiveReport, Attachment, Content, HistoryAttachment, HistoryContent, HistoryEntry,
    HistoryId, HistoryRecipient, HistoryRecord, NewAttachment, NewRecipient, NewRecord,
    OutcomeUpdate, QueueRecord, QueueStats, QueueStatus, QueueStore, Recipient, RecipientKind,
    RecordId, Result, SqliteConfig, StoreError,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS email_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender TEXT NOT NULL,
    subject TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    scheduled_at INTEGER,
    sent_at INTEGER,
    last_retry_at INTEGER,
    error_message TEXT,
    processor_id TEXT,
    unique_id TEXT,
    tags TEXT NOT NULL DEFAULT '',
    source TEXT,
    locked INTEGER NOT NULL DEFAULT 0,
    locked_at INTEGER
);

CREATE TABLE IF NOT EXISTS email_content (
    record_id INTEGER PRIMARY KEY REFERENCES email_queue(id) ON DELETE CASCADE,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS email_recipient (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id INTEGER NOT NULL REFERENCES email_queue(id) ON DELETE CASCADE,
    address TEXT NOT NULL,
    kind TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS email_attachment (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id INTEGER NOT NULL REFERENCES email_queue(id) ON DELETE CASCADE,
    file_name TEXT NOT NULL,
    content_type TEXT NOT NULL,
    storage_path TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS email_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    original_record_id INTEGER NOT NULL,
    sender TEXT NOT NULL,
    subject TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL,
    retry_count INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    scheduled_at INTEGER,
    sent_at INTEGER,
    last_retry_at INTEGER,
    error_message TEXT,
    processor_id TEXT,
    unique_id TEXT,
    tags TEXT NOT NULL DEFAULT '',
    source TEXT,
    archived_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS email_history_content (
    history_id INTEGER PRIMARY KEY REFERENCES email_history(id) ON DELETE CASCADE,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS email_history_recipient (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    history_id INTEGER NOT NULL REFERENCES email_history(id) ON DELETE CASCADE,
    address TEXT NOT NULL,
    kind TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS email_history_attachment (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    history_id INTEGER NOT NULL REFERENCES email_history(id) ON DELETE CASCADE,
    file_name TEXT NOT NULL,
    content_type TEXT NOT NULL,
    storage_path TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_dispatch ON email_queue(status, locked, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_queue_sender_subject ON email_queue(sender, subject);
CREATE INDEX IF NOT EXISTS idx_recipient_record ON email_recipient(record_id);
CREATE INDEX IF NOT EXISTS idx_attachment_record ON email_attachment(record_id);
CREATE INDEX IF NOT EXISTS idx_history_original ON email_history(original_record_id);
";

const RECORD_COLUMNS: &str = "id, sender, subject, status, priority, retry_count, max_retries, \
     created_at, updated_at, scheduled_at, sent_at, last_retry_at, error_message, processor_id, \
     unique_id, tags, source, locked, locked_at";

const HISTORY_COLUMNS: &str = "id, original_record_id, sender, subject, status, priority, \
     retry_count, max_retries, created_at, updated_at, scheduled_at, sent_at, last_retry_at, \
     error_message, processor_id, unique_id, tags, source, archived_at";

impl FromSql for QueueStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|err: StoreError| FromSqlError::Other(Box::new(err)))
    }
}

impl ToSql for QueueStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RecipientKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|err: StoreError| FromSqlError::Other(Box::new(err)))
    }
}

impl ToSql for RecipientKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|ms| {
            DateTime::from_timestamp_millis(ms)
                .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
        })
        .transpose()
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<QueueRecord> {
    Ok(QueueRecord {
        id: RecordId(row.get(0)?),
        sender: row.get(1)?,
        subject: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        retry_count: row.get(5)?,
        max_retries: row.get(6)?,
        created_at: timestamp(row, 7)?,
        updated_at: timestamp(row, 8)?,
        scheduled_at: optional_timestamp(row, 9)?,
        sent_at: optional_timestamp(row, 10)?,
        last_retry_at: optional_timestamp(row, 11)?,
        error_message: row.get(12)?,
        processor_id: row.get(13)?,
        unique_id: row.get(14)?,
        tags: split_tags(&row.get::<_, String>(15)?),
        source: row.get(16)?,
        locked: row.get(17)?,
        locked_at: optional_timestamp(row, 18)?,
    })
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        id: HistoryId(row.get(0)?),
        original_record_id: RecordId(row.get(1)?),
        sender: row.get(2)?,
        subject: row.get(3)?,
        status: row.get(4)?,
        priority: row.get(5)?,
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        created_at: timestamp(row, 8)?,
        updated_at: timestamp(row, 9)?,
        scheduled_at: optional_timestamp(row, 10)?,
        sent_at: optional_timestamp(row, 11)?,
        last_retry_at: optional_timestamp(row, 12)?,
        error_message: row.get(13)?,
        processor_id: row.get(14)?,
        unique_id: row.get(15)?,
        tags: split_tags(&row.get::<_, String>(16)?),
        source: row.get(17)?,
        archived_at: timestamp(row, 18)?,
    })
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn record_exists(conn: &Connection, id: RecordId) -> Result<bool> {
    Ok(conn
        .prepare_cached("SELECT 1 FROM email_queue WHERE id = ?1")?
        .query_row(params![id.0], |_| Ok(()))
        .optional()?
        .is_some())
}

fn query_records(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<QueueRecord>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM email_queue WHERE {filter} \
         ORDER BY priority ASC, created_at ASC, id ASC LIMIT ?"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params, record_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn delete_record(tx: &Transaction<'_>, id: RecordId) -> Result<bool> {
    tx.execute("DELETE FROM email_content WHERE record_id = ?1", params![id.0])?;
    tx.execute("DELETE FROM email_recipient WHERE record_id = ?1", params![id.0])?;
    tx.execute("DELETE FROM email_attachment WHERE record_id = ?1", params![id.0])?;
    Ok(tx.execute("DELETE FROM email_queue WHERE id = ?1", params![id.0])? == 1)
}

/// Queue store backed by a single SQLite database file.
///
/// The connection is shared behind a mutex and every call runs on the
/// blocking pool. Coordination between several processes using the same
/// file relies only on SQLite's own row-level atomicity of `UPDATE`.
#[derive(Debug, Clone)]
pub struct SqliteQueueStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQueueStore {
    /// Open (creating if needed) the database at `config.path`.
    ///
    /// # Errors
    /// If the parent directory cannot be created or the schema cannot be applied
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|err| {
                StoreError::Internal(format!(
                    "Unable to create {}: {err}",
                    parent.display()
                ))
            })?;
        }

        internal!(level = INFO, path = %config.path.display(), "Opening queue database");
        let conn = Connection::open(&config.path)?;
        if config.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        Self::from_connection(conn, config.busy_timeout_ms)
    }

    /// A private, non-durable database. Mostly useful for tests.
    ///
    /// # Errors
    /// If the schema cannot be applied
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, 0)
    }

    /// Convenience for [`SqliteQueueStore::open`] with default settings.
    ///
    /// # Errors
    /// See [`SqliteQueueStore::open`]
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(&SqliteConfig {
            path: path.as_ref().to_path_buf(),
            ..SqliteConfig::default()
        })
    }

    fn from_connection(conn: Connection, busy_timeout_ms: u64) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        if busy_timeout_ms > 0 {
            conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
        }
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || op(&mut conn.lock())).await?
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn insert(&self, new: NewRecord) -> Result<RecordId> {
        new.validate()?;
        self.run(move |conn| {
            let now = millis(Utc::now());
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO email_queue (sender, subject, status, priority, retry_count, \
                 max_retries, created_at, updated_at, scheduled_at, unique_id, tags, source, locked) \
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?6, ?7, ?8, ?9, ?10, 0)",
                params![
                    new.sender,
                    new.subject,
                    new.status,
                    new.priority,
                    new.max_retries,
                    now,
                    new.scheduled_at.map(millis),
                    new.unique_id,
                    new.tags.join(","),
                    new.source,
                ],
            )?;
            let id = RecordId(tx.last_insert_rowid());

            if let Some(body) = &new.body {
                tx.execute(
                    "INSERT INTO email_content (record_id, body) VALUES (?1, ?2)",
                    params![id.0, body],
                )?;
            }
            for recipient in &new.recipients {
                tx.execute(
                    "INSERT INTO email_recipient (record_id, address, kind) VALUES (?1, ?2, ?3)",
                    params![id.0, recipient.address, recipient.kind],
                )?;
            }
            for attachment in &new.attachments {
                tx.execute(
                    "INSERT INTO email_attachment (record_id, file_name, content_type, storage_path) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        id.0,
                        attachment.file_name,
                        attachment.content_type,
                        attachment.storage_path
                    ],
                )?;
            }

            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn get(&self, id: RecordId) -> Result<Option<QueueRecord>> {
        self.run(move |conn| {
            let sql = format!("SELECT {RECORD_COLUMNS} FROM email_queue WHERE id = ?1");
            Ok(conn
                .prepare_cached(&sql)?
                .query_row(params![id.0], record_from_row)
                .optional()?)
        })
        .await
    }

    async fn find_eligible(&self, limit: usize) -> Result<Vec<QueueRecord>> {
        self.run(move |conn| {
            query_records(
                conn,
                "status = 'QUEUED' AND locked = 0",
                params![sql_limit(limit)],
            )
        })
        .await
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueRecord>> {
        self.run(move |conn| {
            query_records(
                conn,
                "status = 'SCHEDULED' AND locked = 0 AND (scheduled_at IS NULL OR scheduled_at <= ?)",
                params![millis(now), sql_limit(limit)],
            )
        })
        .await
    }

    async fn find_retryable(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueRecord>> {
        self.run(move |conn| {
            query_records(
                conn,
                "status = 'RETRY' AND locked = 0 AND (last_retry_at IS NULL OR last_retry_at <= ?)",
                params![millis(threshold), sql_limit(limit)],
            )
        })
        .await
    }

    async fn find_stale_locked(&self, threshold: DateTime<Utc>) -> Result<Vec<QueueRecord>> {
        self.run(move |conn| {
            query_records(
                conn,
                "status = 'PROCESSING' AND locked = 1 AND locked_at <= ?",
                params![millis(threshold), i64::MAX],
            )
        })
        .await
    }

    async fn find_by_status(
        &self,
        status: QueueStatus,
        limit: usize,
    ) -> Result<Vec<QueueRecord>> {
        self.run(move |conn| {
            query_records(conn, "status = ?", params![status, sql_limit(limit)])
        })
        .await
    }

    async fn find_groupable(&self, sender: &str, subject: &str) -> Result<Option<QueueRecord>> {
        let sender = sender.to_string();
        let subject = subject.to_string();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM email_queue \
                 WHERE sender = ?1 AND subject = ?2 AND locked = 0 \
                 AND status IN ('QUEUED', 'SCHEDULED') \
                 ORDER BY created_at ASC, id ASC LIMIT 1"
            );
            Ok(conn
                .prepare_cached(&sql)?
                .query_row(params![sender, subject], record_from_row)
                .optional()?)
        })
        .await
    }

    async fn count_by_status(&self) -> Result<QueueStats> {
        self.run(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT status, COUNT(*) FROM email_queue GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, QueueStatus>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut stats = QueueStats::default();
            for row in rows {
                let (status, count) = row?;
                stats.add(status, u64::try_from(count).unwrap_or_default());
            }
            Ok(stats)
        })
        .await
    }

    async fn try_lock(&self, id: RecordId, owner: &str, now: DateTime<Utc>) -> Result<bool> {
        let owner = owner.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE email_queue SET locked = 1, locked_at = ?1, status = 'PROCESSING', \
                 processor_id = ?2, updated_at = ?1 \
                 WHERE id = ?3 AND locked = 0 AND status = 'QUEUED'",
                params![millis(now), owner, id.0],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn release(&self, id: RecordId, owner: &str) -> Result<bool> {
        let owner = owner.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE email_queue SET locked = 0, locked_at = NULL, processor_id = NULL \
                 WHERE id = ?1 AND locked = 1 AND processor_id = ?2",
                params![id.0, owner],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn reclaim_stale(&self, threshold: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE email_queue SET status = 'QUEUED', locked = 0, locked_at = NULL, \
                 processor_id = NULL, updated_at = ?2 \
                 WHERE status = 'PROCESSING' AND (locked_at IS NULL OR locked_at <= ?1)",
                params![millis(threshold), millis(now)],
            )?;
            Ok(changed as u64)
        })
        .await
    }

    async fn promote(&self, id: RecordId, from: QueueStatus, now: DateTime<Utc>) -> Result<bool> {
        from.transition(QueueStatus::Queued)?;
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE email_queue SET status = 'QUEUED', updated_at = ?1 \
                 WHERE id = ?2 AND status = ?3 AND locked = 0",
                params![millis(now), id.0, from],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn cancel(&self, id: RecordId, now: DateTime<Utc>) -> Result<bool> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE email_queue SET status = 'CANCELLED', updated_at = ?1 \
                 WHERE id = ?2 AND locked = 0 AND status IN ('QUEUED', 'SCHEDULED', 'RETRY')",
                params![millis(now), id.0],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn complete(&self, id: RecordId, owner: &str, outcome: OutcomeUpdate) -> Result<bool> {
        QueueStatus::Processing.transition(outcome.status)?;
        let owner = owner.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE email_queue SET status = ?1, retry_count = ?2, error_message = ?3, \
                 sent_at = COALESCE(?4, sent_at), last_retry_at = COALESCE(?5, last_retry_at), \
                 locked = 0, locked_at = NULL, updated_at = ?6 \
                 WHERE id = ?7 AND status = 'PROCESSING' AND processor_id = ?8",
                params![
                    outcome.status,
                    outcome.retry_count,
                    outcome.error_message,
                    outcome.sent_at.map(millis),
                    outcome.last_retry_at.map(millis),
                    millis(outcome.at),
                    id.0,
                    owner,
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn content(&self, id: RecordId) -> Result<Option<Content>> {
        self.run(move |conn| {
            Ok(conn
                .prepare_cached("SELECT body FROM email_content WHERE record_id = ?1")?
                .query_row(params![id.0], |row| {
                    Ok(Content {
                        record_id: id,
                        body: row.get(0)?,
                    })
                })
                .optional()?)
        })
        .await
    }

    async fn set_content(&self, id: RecordId, body: String) -> Result<()> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            if !record_exists(&tx, id)? {
                return Err(StoreError::NotFound(id));
            }
            let existing = tx
                .query_row(
                    "SELECT 1 FROM email_content WHERE record_id = ?1",
                    params![id.0],
                    |_| Ok(()),
                )
                .optional()?;
            if existing.is_some() {
                return Err(StoreError::ContentExists(id));
            }
            tx.execute(
                "INSERT INTO email_content (record_id, body) VALUES (?1, ?2)",
                params![id.0, body],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn recipients(&self, id: RecordId) -> Result<Vec<Recipient>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT address, kind FROM email_recipient WHERE record_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![id.0], |row| {
                Ok(Recipient {
                    record_id: id,
                    address: row.get(0)?,
                    kind: row.get(1)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn add_recipient(&self, id: RecordId, recipient: NewRecipient) -> Result<bool> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            if !record_exists(&tx, id)? {
                return Err(StoreError::NotFound(id));
            }
            let added = tx.execute(
                "INSERT INTO email_recipient (record_id, address, kind) \
                 SELECT ?1, ?2, ?3 WHERE NOT EXISTS \
                 (SELECT 1 FROM email_recipient WHERE record_id = ?1 AND address = ?2)",
                params![id.0, recipient.address, recipient.kind],
            )?;
            tx.commit()?;
            Ok(added == 1)
        })
        .await
    }

    async fn attachments(&self, id: RecordId) -> Result<Vec<Attachment>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT file_name, content_type, storage_path FROM email_attachment \
                 WHERE record_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![id.0], |row| {
                Ok(Attachment {
                    record_id: id,
                    file_name: row.get(0)?,
                    content_type: row.get(1)?,
                    storage_path: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn add_attachment(&self, id: RecordId, attachment: NewAttachment) -> Result<()> {
        self.run(move |conn| {
            if !record_exists(conn, id)? {
                return Err(StoreError::NotFound(id));
            }
            conn.execute(
                "INSERT INTO email_attachment (record_id, file_name, content_type, storage_path) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.0,
                    attachment.file_name,
                    attachment.content_type,
                    attachment.storage_path
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: RecordId) -> Result<bool> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let deleted = delete_record(&tx, id)?;
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    async fn archive(&self, status: QueueStatus, now: DateTime<Utc>) -> Result<ArchiveReport> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let originals = query_records(&tx, "status = ?", params![status, i64::MAX])?;
            let mut report = ArchiveReport::default();
            if originals.is_empty() {
                return Ok(report);
            }

            for record in &originals {
                tx.execute(
                    "INSERT INTO email_history (original_record_id, sender, subject, status, \
                     priority, retry_count, max_retries, created_at, updated_at, scheduled_at, \
                     sent_at, last_retry_at, error_message, processor_id, unique_id, tags, source, \
                     archived_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                    params![
                        record.id.0,
                        record.sender,
                        record.subject,
                        record.status,
                        record.priority,
                        record.retry_count,
                        record.max_retries,
                        millis(record.created_at),
                        millis(record.updated_at),
                        record.scheduled_at.map(millis),
                        record.sent_at.map(millis),
                        record.last_retry_at.map(millis),
                        record.error_message,
                        record.processor_id,
                        record.unique_id,
                        record.tags.join(","),
                        record.source,
                        millis(now),
                    ],
                )?;
                report
                    .moved
                    .push((record.id, HistoryId(tx.last_insert_rowid())));
            }

            // Children are copied through the id map built above.
            for &(original, history_id) in &report.moved {
                let content = tx.execute(
                    "INSERT INTO email_history_content (history_id, body) \
                     SELECT ?1, body FROM email_content WHERE record_id = ?2",
                    params![history_id.0, original.0],
                )?;
                if content == 0 {
                    report.missing_content.push(original);
                }

                report.recipients_copied += tx.execute(
                    "INSERT INTO email_history_recipient (history_id, address, kind) \
                     SELECT ?1, address, kind FROM email_recipient WHERE record_id = ?2 ORDER BY id",
                    params![history_id.0, original.0],
                )?;
                report.attachments_copied += tx.execute(
                    "INSERT INTO email_history_attachment \
                     (history_id, file_name, content_type, storage_path) \
                     SELECT ?1, file_name, content_type, storage_path FROM email_attachment \
                     WHERE record_id = ?2 ORDER BY id",
                    params![history_id.0, original.0],
                )?;
            }

            for record in &originals {
                delete_record(&tx, record.id)?;
            }

            tx.commit()?;
            report.missing_content.sort();
            Ok(report)
        })
        .await
    }

    async fn history_by_original(&self, original: RecordId) -> Result<Vec<HistoryEntry>> {
        self.run(move |conn| {
            let sql = format!(
                "SELECT {HISTORY_COLUMNS} FROM email_history WHERE original_record_id = ?1 ORDER BY id"
            );
            let records = conn
                .prepare_cached(&sql)?
                .query_map(params![original.0], history_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut entries = Vec::with_capacity(records.len());
            for record in records {
                let history_id = record.id;
                let content = conn
                    .prepare_cached("SELECT body FROM email_history_content WHERE history_id = ?1")?
                    .query_row(params![history_id.0], |row| {
                        Ok(HistoryContent {
                            history_id,
                            body: row.get(0)?,
                        })
                    })
                    .optional()?;
                let recipients = conn
                    .prepare_cached(
                        "SELECT address, kind FROM email_history_recipient \
                         WHERE history_id = ?1 ORDER BY id",
                    )?
                    .query_map(params![history_id.0], |row| {
                        Ok(HistoryRecipient {
                            history_id,
                            address: row.get(0)?,
                            kind: row.get(1)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                let attachments = conn
                    .prepare_cached(
                        "SELECT file_name, content_type, storage_path FROM email_history_attachment \
                         WHERE history_id = ?1 ORDER BY id",
                    )?
                    .query_map(params![history_id.0], |row| {
                        Ok(HistoryAttachment {
                            history_id,
                            file_name: row.get(0)?,
                            content_type: row.get(1)?,
                            storage_path: row.get(2)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                entries.push(HistoryEntry {
                    record,
                    content,
                    recipients,
                    attachments,
                });
            }
            Ok(entries)
        })
        .await
    }

    async fn history_count(&self) -> Result<u64> {
        self.run(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM email_history", [], |row| row.get(0))?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
        .await
    }
}
