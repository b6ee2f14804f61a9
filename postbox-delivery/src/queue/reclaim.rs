use chrono::{DateTime, Duration, Utc};
use postbox_store::QueueStore;

/// Return abandoned PROCESSING records to QUEUED.
///
/// A lease older than `lock_timeout` is assumed to belong to a crashed or hung
/// worker. The reclaim cannot tell whether that worker delivered before dying,
/// so a reclaimed record may be delivered twice.
///
/// # Errors
/// If the store is unavailable
pub async fn reclaim_stale(
    store: &dyn QueueStore,
    lock_timeout: Duration,
    now: DateTime<Utc>,
) -> postbox_store::Result<u64> {
    let threshold = now
        .checked_sub_signed(lock_timeout)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let reclaimed = store.reclaim_stale(threshold, now).await?;

    if reclaimed > 0 {
        tracing::warn!(
            reclaimed,
            lock_timeout_minutes = lock_timeout.num_minutes(),
            "Reclaimed stale locks; these records may be delivered again"
        );
    }

    Ok(reclaimed)
}
