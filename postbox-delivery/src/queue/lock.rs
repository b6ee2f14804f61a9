use std::sync::Arc;

use chrono::{DateTime, Utc};
use postbox_store::{OutcomeUpdate, QueueStore, RecordId};

/// Acquires and releases record leases on behalf of one processor.
#[derive(Debug, Clone)]
pub struct LockManager {
    store: Arc<dyn QueueStore>,
    owner: Arc<str>,
}

impl LockManager {
    pub fn new(store: Arc<dyn QueueStore>, owner: impl Into<Arc<str>>) -> Self {
        Self {
            store,
            owner: owner.into(),
        }
    }

    /// Identity written to `processor_id` on every record this manager locks
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Try to claim `id`.
    ///
    /// `Ok(false)` means someone else holds the record (or it is no longer
    /// QUEUED). That is an expected race, not an error.
    ///
    /// # Errors
    /// If the store is unavailable
    pub async fn try_acquire(&self, id: RecordId, now: DateTime<Utc>) -> postbox_store::Result<bool> {
        let acquired = self.store.try_lock(id, &self.owner, now).await?;
        if !acquired {
            tracing::debug!(record_id = %id, processor_id = %self.owner, "Lock conflict, skipping record");
        }
        Ok(acquired)
    }

    /// Drop a lease without deciding an outcome.
    ///
    /// # Errors
    /// If the store is unavailable
    pub async fn release(&self, id: RecordId) -> postbox_store::Result<bool> {
        self.store.release(id, &self.owner).await
    }

    /// Record the outcome of a delivery and drop the lease.
    ///
    /// Returns `false` when the lease was lost in the meantime (reclaimed and
    /// possibly claimed by another processor); the outcome is then discarded.
    ///
    /// # Errors
    /// If the store is unavailable
    pub async fn complete(&self, id: RecordId, outcome: OutcomeUpdate) -> postbox_store::Result<bool> {
        let applied = self.store.complete(id, &self.owner, outcome).await?;
        if !applied {
            tracing::warn!(
                record_id = %id,
                processor_id = %self.owner,
                "Lease was lost before the outcome could be recorded"
            );
        }
        Ok(applied)
    }
}
