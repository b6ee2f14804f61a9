use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    ArchiveReport, Attachment, Content, HistoryEntry, NewAttachment, NewRecipient, NewRecord,
    OutcomeUpdate, QueueRecord, QueueStats, QueueStatus, Recipient, RecordId, Result,
};

/// Durable storage for queue records, their children and archived history.
///
/// Every coordination primitive here (`try_lock`, `reclaim_stale`, `promote`,
/// `cancel`, `complete`) is a single conditional update: it either applies
/// completely or not at all, and reports which. Callers never read-then-write
/// to coordinate, so several processes may share one store.
///
/// Ordering of [`QueueStore::find_eligible`] is `priority` ascending, then
/// `created_at` ascending, then `id` ascending.
#[async_trait]
pub trait QueueStore: Send + Sync + Debug {
    /// Insert a record with its content, recipients and attachments in one
    /// atomic unit.
    ///
    /// # Errors
    /// If the store is unavailable
    async fn insert(&self, record: NewRecord) -> Result<RecordId>;

    /// # Errors
    /// If the store is unavailable or the row cannot be decoded
    async fn get(&self, id: RecordId) -> Result<Option<QueueRecord>>;

    /// Unlocked `QUEUED` records in dispatch order.
    ///
    /// # Errors
    /// If the store is unavailable
    async fn find_eligible(&self, limit: usize) -> Result<Vec<QueueRecord>>;

    /// Unlocked `SCHEDULED` records whose `scheduled_at` is at or before `now`.
    ///
    /// # Errors
    /// If the store is unavailable
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueRecord>>;

    /// Unlocked `RETRY` records last attempted at or before `threshold`.
    ///
    /// # Errors
    /// If the store is unavailable
    async fn find_retryable(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueRecord>>;

    /// Locked `PROCESSING` records whose lock was taken at or before `threshold`.
    ///
    /// # Errors
    /// If the store is unavailable
    async fn find_stale_locked(&self, threshold: DateTime<Utc>) -> Result<Vec<QueueRecord>>;

    /// # Errors
    /// If the store is unavailable
    async fn find_by_status(&self, status: QueueStatus, limit: usize)
    -> Result<Vec<QueueRecord>>;

    /// An unlocked `QUEUED` or `SCHEDULED` record with exactly this sender and
    /// subject, oldest first.
    ///
    /// # Errors
    /// If the store is unavailable
    async fn find_groupable(&self, sender: &str, subject: &str) -> Result<Option<QueueRecord>>;

    /// # Errors
    /// If the store is unavailable
    async fn count_by_status(&self) -> Result<QueueStats>;

    /// Compare-and-swap lock acquisition.
    ///
    /// Applies `locked = true, locked_at = now, status = PROCESSING,
    /// processor_id = owner` only where the record is `QUEUED` and unlocked.
    /// Returns `true` iff exactly this call changed the row.
    ///
    /// # Errors
    /// If the store is unavailable
    async fn try_lock(&self, id: RecordId, owner: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Drop a lock held by `owner`, clearing `processor_id` but not the status.
    ///
    /// The record stays `PROCESSING` until the next reclaim pass.
    ///
    /// # Errors
    /// If the store is unavailable
    async fn release(&self, id: RecordId, owner: &str) -> Result<bool>;

    /// Return every `PROCESSING` record locked at or before `threshold` to
    /// `QUEUED`, unlock it and clear its `processor_id`. Returns the number of
    /// records reclaimed.
    ///
    /// # Errors
    /// If the store is unavailable
    async fn reclaim_stale(&self, threshold: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64>;

    /// Move an unlocked record from `from` to `QUEUED`.
    ///
    /// # Errors
    /// If the store is unavailable, or `from` cannot transition to `QUEUED`
    async fn promote(&self, id: RecordId, from: QueueStatus, now: DateTime<Utc>) -> Result<bool>;

    /// Cancel an unlocked `QUEUED`, `SCHEDULED` or `RETRY` record.
    ///
    /// # Errors
    /// If the store is unavailable
    async fn cancel(&self, id: RecordId, now: DateTime<Utc>) -> Result<bool>;

    /// Write a delivery outcome, fenced on the lock holder.
    ///
    /// Applies only while the record is `PROCESSING` and owned by `owner`, and
    /// always leaves it unlocked.
    ///
    /// # Errors
    /// If the store is unavailable, or the outcome status is not reachable
    /// from `PROCESSING`
    async fn complete(&self, id: RecordId, owner: &str, outcome: OutcomeUpdate) -> Result<bool>;

    /// # Errors
    /// If the store is unavailable
    async fn content(&self, id: RecordId) -> Result<Option<Content>>;

    /// # Errors
    /// [`crate::StoreError::ContentExists`] if the record already has content,
    /// [`crate::StoreError::NotFound`] if the record does not exist
    async fn set_content(&self, id: RecordId, body: String) -> Result<()>;

    /// # Errors
    /// If the store is unavailable
    async fn recipients(&self, id: RecordId) -> Result<Vec<Recipient>>;

    /// Append a recipient unless one with the same address already exists.
    /// Returns whether a row was added.
    ///
    /// # Errors
    /// [`crate::StoreError::NotFound`] if the record does not exist
    async fn add_recipient(&self, id: RecordId, recipient: NewRecipient) -> Result<bool>;

    /// # Errors
    /// If the store is unavailable
    async fn attachments(&self, id: RecordId) -> Result<Vec<Attachment>>;

    /// # Errors
    /// [`crate::StoreError::NotFound`] if the record does not exist
    async fn add_attachment(&self, id: RecordId, attachment: NewAttachment) -> Result<()>;

    /// Remove a record and all its children.
    ///
    /// # Errors
    /// If the store is unavailable
    async fn delete(&self, id: RecordId) -> Result<bool>;

    /// Move every record in `status` (and its children) into history storage
    /// in one atomic unit, deleting the originals.
    ///
    /// # Errors
    /// If the store is unavailable. Nothing is moved on error.
    async fn archive(&self, status: QueueStatus, now: DateTime<Utc>) -> Result<ArchiveReport>;

    /// History entries archived from `original`. Normally zero or one.
    ///
    /// # Errors
    /// If the store is unavailable
    async fn history_by_original(&self, original: RecordId) -> Result<Vec<HistoryEntry>>;

    /// # Errors
    /// If the store is unavailable
    async fn history_count(&self) -> Result<u64>;
}
