use chrono::{DateTime, Utc};
use postbox_store::{QueueStatus, QueueStore};

use crate::policy::RetryPolicy;

/// Queue every unlocked SCHEDULED record whose time has come.
///
/// Returns how many this call promoted; records promoted concurrently by
/// another processor are not counted.
///
/// # Errors
/// If the store is unavailable
pub async fn promote_due(store: &dyn QueueStore, now: DateTime<Utc>) -> postbox_store::Result<u64> {
    let mut promoted = 0;
    for record in store.find_due(now, usize::MAX).await? {
        if store.promote(record.id, QueueStatus::Scheduled, now).await? {
            tracing::debug!(record_id = %record.id, "Scheduled record is due");
            promoted += 1;
        }
    }
    Ok(promoted)
}

/// Queue every unlocked RETRY record that has waited out the retry delay.
///
/// # Errors
/// If the store is unavailable
pub async fn promote_retryable(
    store: &dyn QueueStore,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> postbox_store::Result<u64> {
    let mut promoted = 0;
    for record in store
        .find_retryable(policy.retry_threshold(now), usize::MAX)
        .await?
    {
        if store.promote(record.id, QueueStatus::Retry, now).await? {
            tracing::debug!(
                record_id = %record.id,
                retry_count = record.retry_count,
                "Retrying record"
            );
            promoted += 1;
        }
    }
    Ok(promoted)
}
