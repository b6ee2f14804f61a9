//! Operator and ingestion entry points over the queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use postbox_store::{
    HistoryEntry, NewAttachment, NewRecipient, NewRecord, QueueRecord, QueueStats, QueueStatus,
    QueueStore, RecordId, StoreError,
};
use serde::Deserialize;

use crate::{
    config::{ConfigHandle, GroupingPolicy},
    error::{QueueError, Result},
};

/// A message handed to the queue by an ingestion front end
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NewMessage {
    pub sender: String,
    pub subject: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub recipients: Vec<NewRecipient>,
    #[serde(default)]
    pub attachments: Vec<NewAttachment>,
    /// Lower is more urgent; the configured default when absent
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Hold the message until this time
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Generated when absent
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// Where a submission ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Created(RecordId),
    /// Grouped into an existing pending record
    Merged {
        id: RecordId,
        recipients_added: usize,
    },
}

impl Submission {
    #[must_use]
    pub const fn id(&self) -> RecordId {
        match self {
            Self::Created(id) | Self::Merged { id, .. } => *id,
        }
    }
}

/// Queue operations that sit outside the dispatch loop
#[derive(Debug, Clone)]
pub struct QueueService {
    store: Arc<dyn QueueStore>,
    config: ConfigHandle,
}

impl QueueService {
    pub fn new(store: Arc<dyn QueueStore>, config: ConfigHandle) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Queue a message, or fold it into a pending one when grouping is on.
    ///
    /// A message scheduled in the future is created SCHEDULED, otherwise
    /// QUEUED. A merge appends recipients that are not yet present, sets
    /// content only if the existing record has none, and appends attachments.
    ///
    /// # Errors
    /// If the store is unavailable
    pub async fn submit(&self, message: NewMessage) -> Result<Submission> {
        let config = self.config.snapshot();

        if config.grouping == GroupingPolicy::SenderSubject
            && let Some(existing) = self
                .store
                .find_groupable(&message.sender, &message.subject)
                .await?
        {
            return self.merge(existing, message).await;
        }

        let now = Utc::now();
        let mut record = NewRecord::queued(message.sender, message.subject)
            .with_priority(message.priority.unwrap_or(config.default_priority))
            .with_max_retries(message.max_retries.unwrap_or(config.default_max_retries));
        if let Some(at) = message.scheduled_at.filter(|at| *at > now) {
            record = record.scheduled_for(at);
        }
        if message.unique_id.is_some() {
            record.unique_id = message.unique_id;
        }
        record.body = message.body;
        record.recipients = message.recipients;
        record.attachments = message.attachments;
        record.tags = message.tags;
        record.source = message.source;

        let id = self.store.insert(record).await?;
        tracing::debug!(record_id = %id, "Queued message");
        Ok(Submission::Created(id))
    }

    async fn merge(&self, existing: QueueRecord, message: NewMessage) -> Result<Submission> {
        let id = existing.id;
        let mut recipients_added = 0;
        for recipient in message.recipients {
            if self.store.add_recipient(id, recipient).await? {
                recipients_added += 1;
            }
        }

        if let Some(body) = message.body {
            match self.store.set_content(id, body).await {
                Ok(()) | Err(StoreError::ContentExists(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        for attachment in message.attachments {
            self.store.add_attachment(id, attachment).await?;
        }

        tracing::debug!(record_id = %id, recipients_added, "Grouped message into pending record");
        Ok(Submission::Merged {
            id,
            recipients_added,
        })
    }

    /// Cancel a record that has not started processing.
    ///
    /// # Errors
    /// [`QueueError::NotFound`], or [`QueueError::WrongStatus`] if the record
    /// is locked or no longer QUEUED, SCHEDULED or RETRY
    pub async fn cancel(&self, id: RecordId) -> Result<()> {
        if self.store.cancel(id, Utc::now()).await? {
            tracing::info!(record_id = %id, "Cancelled record");
            return Ok(());
        }

        let record = self.store.get(id).await?.ok_or(QueueError::NotFound(id))?;
        Err(QueueError::WrongStatus {
            id,
            status: record.status,
            expected: "an unlocked QUEUED, SCHEDULED or RETRY record",
        })
    }

    /// Queue a fresh copy of a FAILED or CANCELLED record.
    ///
    /// The original keeps its terminal status; the copy starts with a zero
    /// retry count and a new unique id.
    ///
    /// # Errors
    /// [`QueueError::NotFound`], or [`QueueError::WrongStatus`] for any other
    /// status
    pub async fn resubmit(&self, id: RecordId) -> Result<RecordId> {
        let original = self.store.get(id).await?.ok_or(QueueError::NotFound(id))?;
        if !matches!(original.status, QueueStatus::Failed | QueueStatus::Cancelled) {
            return Err(QueueError::WrongStatus {
                id,
                status: original.status,
                expected: "FAILED or CANCELLED",
            });
        }

        let mut copy = NewRecord::queued(original.sender, original.subject)
            .with_priority(original.priority)
            .with_max_retries(original.max_retries);
        copy.tags = original.tags;
        copy.source = original.source;
        copy.body = self.store.content(id).await?.map(|c| c.body);
        copy.recipients = self
            .store
            .recipients(id)
            .await?
            .into_iter()
            .map(|r| NewRecipient {
                address: r.address,
                kind: r.kind,
            })
            .collect();
        copy.attachments = self
            .store
            .attachments(id)
            .await?
            .into_iter()
            .map(|a| NewAttachment {
                file_name: a.file_name,
                content_type: a.content_type,
                storage_path: a.storage_path,
            })
            .collect();

        let new_id = self.store.insert(copy).await?;
        tracing::info!(record_id = %id, new_record_id = %new_id, "Resubmitted record");
        Ok(new_id)
    }

    /// # Errors
    /// If the store is unavailable
    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(self.store.count_by_status().await?)
    }

    /// # Errors
    /// If the store is unavailable
    pub async fn get(&self, id: RecordId) -> Result<Option<QueueRecord>> {
        Ok(self.store.get(id).await?)
    }

    /// # Errors
    /// If the store is unavailable
    pub async fn history(&self, original: RecordId) -> Result<Vec<HistoryEntry>> {
        Ok(self.store.history_by_original(original).await?)
    }
}
