//! One delivery attempt for one locked record.

use std::sync::Arc;

use chrono::Utc;
use postbox_store::{QueueRecord, QueueStatus, QueueStore};

use crate::{
    error::DeliveryError,
    events::{EventSink, QueueEvent},
    policy::RetryPolicy,
    queue::LockManager,
    transport::{OutboundMessage, Transport},
};

/// Everything a worker task needs, cheap to clone into each task
#[derive(Debug, Clone)]
pub(crate) struct WorkerContext {
    pub store: Arc<dyn QueueStore>,
    pub transport: Arc<dyn Transport>,
    pub events: Arc<dyn EventSink>,
    pub locks: LockManager,
    pub policy: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkerOutcome {
    /// The outcome was written and the lease released
    Completed {
        status: QueueStatus,
        error: Option<String>,
    },
    /// The lease was reclaimed before the outcome could be written
    LeaseLost,
    /// Writing the outcome failed; the lease stays until reclaimed
    Unrecorded,
}

async fn load(store: &dyn QueueStore, record: QueueRecord) -> Result<OutboundMessage, DeliveryError> {
    let id = record.id;
    Ok(OutboundMessage {
        content: store.content(id).await?,
        recipients: store.recipients(id).await?,
        attachments: store.attachments(id).await?,
        record,
    })
}

/// Deliver a record this processor has just locked.
///
/// `candidate` is the row as fetched before locking. Another processor may
/// have attempted it between that fetch and our lock, so the row is read again
/// under the lease and the retry policy works from that copy. Every delivery
/// failure, including failing to load the record's children, becomes a state
/// transition.
pub(crate) async fn deliver(ctx: WorkerContext, candidate: QueueRecord) -> WorkerOutcome {
    let id = candidate.id;
    let record = match ctx.store.get(id).await {
        Ok(Some(current))
            if current.status == QueueStatus::Processing
                && current.processor_id.as_deref() == Some(ctx.locks.owner()) =>
        {
            current
        }
        Ok(_) => return WorkerOutcome::LeaseLost,
        Err(err) => {
            tracing::error!(record_id = %id, error = %err, "Unable to read locked record");
            return WorkerOutcome::Unrecorded;
        }
    };

    let result = match load(ctx.store.as_ref(), record.clone()).await {
        Ok(message) => ctx.transport.deliver(&message).await,
        Err(err) => Err(err),
    };

    let finished = Utc::now();
    let outcome = match &result {
        Ok(()) => ctx.policy.on_success(&record, finished),
        Err(err) => ctx.policy.on_failure(&record, err, finished),
    };
    let status = outcome.status;
    let retry_count = outcome.retry_count;
    let error = outcome.error_message.clone();

    match ctx.locks.complete(id, outcome).await {
        Ok(true) => {
            ctx.events.emit(QueueEvent::RecordOutcome {
                record_id: id,
                status,
                retry_count,
                error: error.clone(),
            });
            WorkerOutcome::Completed { status, error }
        }
        Ok(false) => WorkerOutcome::LeaseLost,
        Err(err) => {
            tracing::error!(record_id = %id, error = %err, "Unable to record delivery outcome");
            WorkerOutcome::Unrecorded
        }
    }
}

#[cfg(test)]
mod tests {
    use postbox_store::{MemoryQueueStore, NewRecipient, NewRecord};

    use super::*;
    use crate::{events::NullSink, transport::SimulatedTransport};

    fn context(store: &Arc<MemoryQueueStore>, owner: &str) -> WorkerContext {
        let store: Arc<dyn QueueStore> = store.clone();
        WorkerContext {
            locks: LockManager::new(Arc::clone(&store), owner),
            store,
            transport: Arc::new(SimulatedTransport {
                failure_rate: 1.0,
                min_latency_ms: 0,
                max_latency_ms: 0,
            }),
            events: Arc::new(NullSink),
            policy: RetryPolicy {
                retry_delay: chrono::Duration::zero(),
            },
        }
    }

    #[tokio::test]
    async fn test_failure_counts_attempts_made_before_our_lock() {
        let store = Arc::new(MemoryQueueStore::new());
        let id = store
            .insert(
                NewRecord::queued("sender@example.com", "contested")
                    .with_max_retries(2)
                    .with_recipient(NewRecipient::to("rcpt@example.com")),
            )
            .await
            .expect("insert");
        let first = context(&store, "first");
        let second = context(&store, "second");

        // First fetches the candidate, then second attempts and re-queues it
        let candidate = store.find_eligible(1).await.expect("find").remove(0);
        assert!(second.locks.try_acquire(id, Utc::now()).await.expect("lock"));
        let outcome = deliver(second.clone(), candidate.clone()).await;
        assert!(matches!(
            outcome,
            WorkerOutcome::Completed {
                status: QueueStatus::Retry,
                ..
            }
        ));
        assert!(
            store
                .promote(id, QueueStatus::Retry, Utc::now())
                .await
                .expect("promote")
        );

        assert!(first.locks.try_acquire(id, Utc::now()).await.expect("lock"));
        deliver(first, candidate).await;

        let record = store.get(id).await.expect("get").expect("present");
        assert_eq!(record.status, QueueStatus::Retry);
        assert_eq!(record.retry_count, 2);
    }

    #[tokio::test]
    async fn test_unowned_record_is_not_delivered() {
        let store = Arc::new(MemoryQueueStore::new());
        let id = store
            .insert(NewRecord::queued("sender@example.com", "taken"))
            .await
            .expect("insert");
        let candidate = store.get(id).await.expect("get").expect("present");

        let owner = context(&store, "owner");
        assert!(owner.locks.try_acquire(id, Utc::now()).await.expect("lock"));

        let other = context(&store, "other");
        assert_eq!(deliver(other, candidate).await, WorkerOutcome::LeaseLost);
        let record = store.get(id).await.expect("get").expect("present");
        assert_eq!(record.processor_id.as_deref(), Some("owner"));
        assert_eq!(record.retry_count, 0);
    }
}
