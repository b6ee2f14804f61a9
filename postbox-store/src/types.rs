//! Rows of the queue and history tables.
//!
//! Children never hold a reference to their parent record, only its id.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{QueueStatus, StoreError};

/// Identity of a row in the active queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

/// Identity of a row in history storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for HistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecipientKind {
    To,
    Cc,
    Bcc,
}

impl RecipientKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::To => "TO",
            Self::Cc => "CC",
            Self::Bcc => "BCC",
        }
    }
}

impl FromStr for RecipientKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TO" => Ok(Self::To),
            "CC" => Ok(Self::Cc),
            "BCC" => Ok(Self::Bcc),
            other => Err(StoreError::Corrupted(format!("unknown recipient kind {other:?}"))),
        }
    }
}

/// One message awaiting delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub id: RecordId,
    pub sender: String,
    pub subject: String,
    pub status: QueueStatus,
    /// Lower is more urgent
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Worker or process currently (or last) holding the lock
    pub processor_id: Option<String>,
    pub unique_id: Option<String>,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub locked: bool,
    pub locked_at: Option<DateTime<Utc>>,
}

impl QueueRecord {
    /// Whether a dispatcher may pick this record up right now
    #[must_use]
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        if self.locked {
            return false;
        }
        match self.status {
            QueueStatus::Queued => true,
            QueueStatus::Scheduled => self.scheduled_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }
}

/// Body of a queued message; exactly one per record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub record_id: RecordId,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub record_id: RecordId,
    pub address: String,
    pub kind: RecipientKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub record_id: RecordId,
    pub file_name: String,
    pub content_type: String,
    pub storage_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecipient {
    pub address: String,
    pub kind: RecipientKind,
}

impl NewRecipient {
    pub fn to(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            kind: RecipientKind::To,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAttachment {
    pub file_name: String,
    pub content_type: String,
    pub storage_path: String,
}

/// Everything needed to create a record and its children in one atomic write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecord {
    pub sender: String,
    pub subject: String,
    pub status: QueueStatus,
    pub priority: i32,
    pub max_retries: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub unique_id: Option<String>,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub body: Option<String>,
    pub recipients: Vec<NewRecipient>,
    pub attachments: Vec<NewAttachment>,
}

impl NewRecord {
    /// A QUEUED record with default priority and retry budget
    pub fn queued(sender: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            subject: subject.into(),
            status: QueueStatus::Queued,
            priority: 5,
            max_retries: 3,
            scheduled_at: None,
            unique_id: Some(ulid::Ulid::new().to_string()),
            tags: Vec::new(),
            source: None,
            body: None,
            recipients: Vec::new(),
            attachments: Vec::new(),
        }
    }

    #[must_use]
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.status = QueueStatus::Scheduled;
        self.scheduled_at = Some(at);
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn with_recipient(mut self, recipient: NewRecipient) -> Self {
        self.recipients.push(recipient);
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: NewAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Reject values the store cannot persist faithfully.
    ///
    /// Tags are stored as one comma-separated column, so a tag must be
    /// non-empty, comma-free and carry no surrounding whitespace.
    pub(crate) fn validate(&self) -> Result<(), StoreError> {
        if let Some(tag) = self
            .tags
            .iter()
            .find(|t| t.is_empty() || t.contains(',') || t.trim() != t.as_str())
        {
            return Err(StoreError::InvalidRecord(format!("unsupported tag {tag:?}")));
        }
        Ok(())
    }

    /// Materialise the parent row for `id`
    pub(crate) fn into_record(self, id: RecordId, now: DateTime<Utc>) -> QueueRecord {
        QueueRecord {
            id,
            sender: self.sender,
            subject: self.subject,
            status: self.status,
            priority: self.priority,
            retry_count: 0,
            max_retries: self.max_retries,
            created_at: now,
            updated_at: now,
            scheduled_at: self.scheduled_at,
            sent_at: None,
            last_retry_at: None,
            error_message: None,
            processor_id: None,
            unique_id: self.unique_id,
            tags: self.tags,
            source: self.source,
            locked: false,
            locked_at: None,
        }
    }
}

/// Result of one delivery attempt as decided by the retry policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeUpdate {
    pub status: QueueStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

impl OutcomeUpdate {
    /// Copy the outcome onto a record, releasing its lock
    pub(crate) fn apply_to(&self, record: &mut QueueRecord) {
        record.status = self.status;
        record.retry_count = self.retry_count;
        record.error_message.clone_from(&self.error_message);
        if self.sent_at.is_some() {
            record.sent_at = self.sent_at;
        }
        if self.last_retry_at.is_some() {
            record.last_retry_at = self.last_retry_at;
        }
        record.locked = false;
        record.locked_at = None;
        record.updated_at = self.at;
    }
}

/// Archived copy of a [`QueueRecord`]; immutable once written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: HistoryId,
    pub original_record_id: RecordId,
    pub sender: String,
    pub subject: String,
    pub status: QueueStatus,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub processor_id: Option<String>,
    pub unique_id: Option<String>,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub archived_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub(crate) fn from_queue(id: HistoryId, record: &QueueRecord, archived_at: DateTime<Utc>) -> Self {
        Self {
            id,
            original_record_id: record.id,
            sender: record.sender.clone(),
            subject: record.subject.clone(),
            status: record.status,
            priority: record.priority,
            retry_count: record.retry_count,
            max_retries: record.max_retries,
            created_at: record.created_at,
            updated_at: record.updated_at,
            scheduled_at: record.scheduled_at,
            sent_at: record.sent_at,
            last_retry_at: record.last_retry_at,
            error_message: record.error_message.clone(),
            processor_id: record.processor_id.clone(),
            unique_id: record.unique_id.clone(),
            tags: record.tags.clone(),
            source: record.source.clone(),
            archived_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryContent {
    pub history_id: HistoryId,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecipient {
    pub history_id: HistoryId,
    pub address: String,
    pub kind: RecipientKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryAttachment {
    pub history_id: HistoryId,
    pub file_name: String,
    pub content_type: String,
    pub storage_path: String,
}

/// A history record together with its children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub record: HistoryRecord,
    pub content: Option<HistoryContent>,
    pub recipients: Vec<HistoryRecipient>,
    pub attachments: Vec<HistoryAttachment>,
}

/// What one atomic archival unit moved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    /// Original id to the history id it was archived under
    pub moved: Vec<(RecordId, HistoryId)>,
    /// Records archived without a content row
    pub missing_content: Vec<RecordId>,
    pub recipients_copied: usize,
    pub attachments_copied: usize,
}

impl ArchiveReport {
    #[must_use]
    pub fn count(&self) -> usize {
        self.moved.len()
    }
}

/// Number of queue records per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: u64,
    pub scheduled: u64,
    pub queued: u64,
    pub processing: u64,
    pub retry: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    pub fn add(&mut self, status: QueueStatus, count: u64) {
        self.total += count;
        let slot = match status {
            QueueStatus::Scheduled => &mut self.scheduled,
            QueueStatus::Queued => &mut self.queued,
            QueueStatus::Processing => &mut self.processing,
            QueueStatus::Retry => &mut self.retry,
            QueueStatus::Sent => &mut self.sent,
            QueueStatus::Failed => &mut self.failed,
            QueueStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }

    #[must_use]
    pub const fn get(&self, status: QueueStatus) -> u64 {
        match status {
            QueueStatus::Scheduled => self.scheduled,
            QueueStatus::Queued => self.queued,
            QueueStatus::Processing => self.processing,
            QueueStatus::Retry => self.retry,
            QueueStatus::Sent => self.sent,
            QueueStatus::Failed => self.failed,
            QueueStatus::Cancelled => self.cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn record(status: QueueStatus) -> QueueRecord {
        NewRecord::queued("a@example.com", "hi")
            .into_record(RecordId(1), Utc::now())
            .with_status(status)
    }

    impl QueueRecord {
        fn with_status(mut self, status: QueueStatus) -> Self {
            self.status = status;
            self
        }
    }

    #[test]
    fn test_dispatchable() {
        let now = Utc::now();
        assert!(record(QueueStatus::Queued).is_dispatchable(now));
        assert!(!record(QueueStatus::Retry).is_dispatchable(now));

        let mut locked = record(QueueStatus::Queued);
        locked.locked = true;
        assert!(!locked.is_dispatchable(now));

        let mut future = record(QueueStatus::Scheduled);
        future.scheduled_at = Some(now + Duration::minutes(5));
        assert!(!future.is_dispatchable(now));
        future.scheduled_at = Some(now - Duration::seconds(1));
        assert!(future.is_dispatchable(now));
    }

    #[test]
    fn test_outcome_releases_lock() {
        let now = Utc::now();
        let mut rec = record(QueueStatus::Processing);
        rec.locked = true;
        rec.locked_at = Some(now);
        rec.processor_id = Some("worker-1".to_string());

        OutcomeUpdate {
            status: QueueStatus::Sent,
            retry_count: 0,
            error_message: None,
            sent_at: Some(now),
            last_retry_at: None,
            at: now,
        }
        .apply_to(&mut rec);

        assert_eq!(rec.status, QueueStatus::Sent);
        assert!(!rec.locked);
        assert_eq!(rec.locked_at, None);
        assert_eq!(rec.sent_at, Some(now));
        assert_eq!(rec.processor_id.as_deref(), Some("worker-1"));
    }

    #[test]
    fn test_stats_accumulate() {
        let mut stats = QueueStats::default();
        stats.add(QueueStatus::Queued, 3);
        stats.add(QueueStatus::Sent, 2);
        stats.add(QueueStatus::Queued, 1);
        assert_eq!(stats.total, 6);
        assert_eq!(stats.get(QueueStatus::Queued), 4);
        assert_eq!(stats.get(QueueStatus::Sent), 2);
        assert_eq!(stats.get(QueueStatus::Failed), 0);
    }

    #[test]
    fn test_recipient_kind_parse() {
        assert_eq!("bcc".parse::<RecipientKind>().ok(), Some(RecipientKind::Bcc));
        assert!("reply-to".parse::<RecipientKind>().is_err());
    }
}
