use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::{
    ArchiveReport, Attachment, Content, HistoryAttachment, HistoryContent, HistoryEntry,
    HistoryId, HistoryRecipient, HistoryRecord, NewAttachment, NewRecipient, NewRecord,
    OutcomeUpdate, QueueRecord, QueueStats, QueueStatus, QueueStore, Recipient, RecordId, Result,
    StoreError,
};

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<RecordId, QueueRecord>,
    contents: HashMap<RecordId, Content>,
    recipients: HashMap<RecordId, Vec<Recipient>>,
    attachments: HashMap<RecordId, Vec<Attachment>>,
    history: BTreeMap<HistoryId, HistoryRecord>,
    history_contents: HashMap<HistoryId, HistoryContent>,
    history_recipients: HashMap<HistoryId, Vec<HistoryRecipient>>,
    history_attachments: HashMap<HistoryId, Vec<HistoryAttachment>>,
    last_record_id: i64,
    last_history_id: i64,
}

impl State {
    fn remove_record(&mut self, id: RecordId) -> Option<QueueRecord> {
        self.contents.remove(&id);
        self.recipients.remove(&id);
        self.attachments.remove(&id);
        self.records.remove(&id)
    }

    fn select<F>(&self, limit: usize, mut filter: F) -> Vec<QueueRecord>
    where
        F: FnMut(&QueueRecord) -> bool,
    {
        let mut matched: Vec<_> = self.records.values().filter(|r| filter(r)).cloned().collect();
        matched.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        matched.truncate(limit);
        matched
    }
}

/// In-memory queue store.
///
/// All tables live behind a single `RwLock`, so every operation, including
/// archival of a whole status, is trivially atomic. Nothing survives a
/// restart; use [`crate::SqliteQueueStore`] for durability.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    state: Arc<RwLock<State>>,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in the active queue
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert(&self, new: NewRecord) -> Result<RecordId> {
        new.validate()?;
        let mut state = self.state.write();
        state.last_record_id += 1;
        let id = RecordId(state.last_record_id);
        let now = Utc::now();

        if let Some(body) = &new.body {
            state.contents.insert(
                id,
                Content {
                    record_id: id,
                    body: body.clone(),
                },
            );
        }
        let recipients = new
            .recipients
            .iter()
            .map(|r| Recipient {
                record_id: id,
                address: r.address.clone(),
                kind: r.kind,
            })
            .collect();
        state.recipients.insert(id, recipients);
        let attachments = new
            .attachments
            .iter()
            .map(|a| Attachment {
                record_id: id,
                file_name: a.file_name.clone(),
                content_type: a.content_type.clone(),
                storage_path: a.storage_path.clone(),
            })
            .collect();
        state.attachments.insert(id, attachments);
        state.records.insert(id, new.into_record(id, now));

        Ok(id)
    }

    async fn get(&self, id: RecordId) -> Result<Option<QueueRecord>> {
        Ok(self.state.read().records.get(&id).cloned())
    }

    async fn find_eligible(&self, limit: usize) -> Result<Vec<QueueRecord>> {
        Ok(self
            .state
            .read()
            .select(limit, |r| r.status == QueueStatus::Queued && !r.locked))
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueRecord>> {
        Ok(self.state.read().select(limit, |r| {
            r.status == QueueStatus::Scheduled && r.is_dispatchable(now)
        }))
    }

    async fn find_retryable(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueRecord>> {
        Ok(self.state.read().select(limit, |r| {
            r.status == QueueStatus::Retry
                && !r.locked
                && r.last_retry_at.is_none_or(|at| at <= threshold)
        }))
    }

    async fn find_stale_locked(&self, threshold: DateTime<Utc>) -> Result<Vec<QueueRecord>> {
        Ok(self.state.read().select(usize::MAX, |r| {
            r.status == QueueStatus::Processing
                && r.locked
                && r.locked_at.is_some_and(|at| at <= threshold)
        }))
    }

    async fn find_by_status(
        &self,
        status: QueueStatus,
        limit: usize,
    ) -> Result<Vec<QueueRecord>> {
        Ok(self.state.read().select(limit, |r| r.status == status))
    }

    async fn find_groupable(&self, sender: &str, subject: &str) -> Result<Option<QueueRecord>> {
        let state = self.state.read();
        Ok(state
            .records
            .values()
            .filter(|r| {
                matches!(r.status, QueueStatus::Queued | QueueStatus::Scheduled)
                    && !r.locked
                    && r.sender == sender
                    && r.subject == subject
            })
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn count_by_status(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for record in self.state.read().records.values() {
            stats.add(record.status, 1);
        }
        Ok(stats)
    }

    async fn try_lock(&self, id: RecordId, owner: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write();
        let Some(record) = state.records.get_mut(&id) else {
            return Ok(false);
        };
        if record.locked || record.status != QueueStatus::Queued {
            return Ok(false);
        }

        record.locked = true;
        record.locked_at = Some(now);
        record.status = QueueStatus::Processing;
        record.processor_id = Some(owner.to_string());
        record.updated_at = now;
        Ok(true)
    }

    async fn release(&self, id: RecordId, owner: &str) -> Result<bool> {
        let mut state = self.state.write();
        match state.records.get_mut(&id) {
            Some(record) if record.locked && record.processor_id.as_deref() == Some(owner) => {
                record.locked = false;
                record.locked_at = None;
                record.processor_id = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reclaim_stale(&self, threshold: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write();
        let mut reclaimed = 0;
        for record in state.records.values_mut() {
            if record.status == QueueStatus::Processing
                && record.locked_at.is_none_or(|at| at <= threshold)
            {
                record.status = QueueStatus::Queued;
                record.locked = false;
                record.locked_at = None;
                record.processor_id = None;
                record.updated_at = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn promote(&self, id: RecordId, from: QueueStatus, now: DateTime<Utc>) -> Result<bool> {
        from.transition(QueueStatus::Queued)?;
        let mut state = self.state.write();
        match state.records.get_mut(&id) {
            Some(record) if record.status == from && !record.locked => {
                record.status = QueueStatus::Queued;
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel(&self, id: RecordId, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write();
        match state.records.get_mut(&id) {
            Some(record) if record.status.is_cancellable() && !record.locked => {
                record.status = QueueStatus::Cancelled;
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, id: RecordId, owner: &str, outcome: OutcomeUpdate) -> Result<bool> {
        QueueStatus::Processing.transition(outcome.status)?;
        let mut state = self.state.write();
        match state.records.get_mut(&id) {
            Some(record)
                if record.status == QueueStatus::Processing
                    && record.processor_id.as_deref() == Some(owner) =>
            {
                outcome.apply_to(record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn content(&self, id: RecordId) -> Result<Option<Content>> {
        Ok(self.state.read().contents.get(&id).cloned())
    }

    async fn set_content(&self, id: RecordId, body: String) -> Result<()> {
        let mut state = self.state.write();
        if !state.records.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        if state.contents.contains_key(&id) {
            return Err(StoreError::ContentExists(id));
        }
        state.contents.insert(id, Content { record_id: id, body });
        Ok(())
    }

    async fn recipients(&self, id: RecordId) -> Result<Vec<Recipient>> {
        Ok(self
            .state
            .read()
            .recipients
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_recipient(&self, id: RecordId, recipient: NewRecipient) -> Result<bool> {
        let mut state = self.state.write();
        if !state.records.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let list = state.recipients.entry(id).or_default();
        if list.iter().any(|r| r.address == recipient.address) {
            return Ok(false);
        }
        list.push(Recipient {
            record_id: id,
            address: recipient.address,
            kind: recipient.kind,
        });
        Ok(true)
    }

    async fn attachments(&self, id: RecordId) -> Result<Vec<Attachment>> {
        Ok(self
            .state
            .read()
            .attachments
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_attachment(&self, id: RecordId, attachment: NewAttachment) -> Result<()> {
        let mut state = self.state.write();
        if !state.records.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        state.attachments.entry(id).or_default().push(Attachment {
            record_id: id,
            file_name: attachment.file_name,
            content_type: attachment.content_type,
            storage_path: attachment.storage_path,
        });
        Ok(())
    }

    async fn delete(&self, id: RecordId) -> Result<bool> {
        Ok(self.state.write().remove_record(id).is_some())
    }

    async fn archive(&self, status: QueueStatus, now: DateTime<Utc>) -> Result<ArchiveReport> {
        let mut state = self.state.write();
        let mut report = ArchiveReport::default();

        let originals: Vec<QueueRecord> = state
            .records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        if originals.is_empty() {
            return Ok(report);
        }

        // Parents first; children are keyed through this map.
        let mut mapping = HashMap::with_capacity(originals.len());
        for record in &originals {
            state.last_history_id += 1;
            let history_id = HistoryId(state.last_history_id);
            state
                .history
                .insert(history_id, HistoryRecord::from_queue(history_id, record, now));
            mapping.insert(record.id, history_id);
            report.moved.push((record.id, history_id));
        }

        for (&original, &history_id) in &mapping {
            match state.contents.get(&original).cloned() {
                Some(content) => {
                    state.history_contents.insert(
                        history_id,
                        HistoryContent {
                            history_id,
                            body: content.body,
                        },
                    );
                }
                None => report.missing_content.push(original),
            }

            let recipients: Vec<_> = state
                .recipients
                .get(&original)
                .map(|list| {
                    list.iter()
                        .map(|r| HistoryRecipient {
                            history_id,
                            address: r.address.clone(),
                            kind: r.kind,
                        })
                        .collect()
                })
                .unwrap_or_default();
            report.recipients_copied += recipients.len();
            state.history_recipients.insert(history_id, recipients);

            let attachments: Vec<_> = state
                .attachments
                .get(&original)
                .map(|list| {
                    list.iter()
                        .map(|a| HistoryAttachment {
                            history_id,
                            file_name: a.file_name.clone(),
                            content_type: a.content_type.clone(),
                            storage_path: a.storage_path.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            report.attachments_copied += attachments.len();
            state.history_attachments.insert(history_id, attachments);
        }

        for record in &originals {
            state.remove_record(record.id);
        }
        report.missing_content.sort();

        Ok(report)
    }

    async fn history_by_original(&self, original: RecordId) -> Result<Vec<HistoryEntry>> {
        let state = self.state.read();
        Ok(state
            .history
            .values()
            .filter(|h| h.original_record_id == original)
            .map(|h| HistoryEntry {
                record: h.clone(),
                content: state.history_contents.get(&h.id).cloned(),
                recipients: state.history_recipients.get(&h.id).cloned().unwrap_or_default(),
                attachments: state
                    .history_attachments
                    .get(&h.id)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn history_count(&self) -> Result<u64> {
        Ok(self.state.read().history.len() as u64)
    }
}
