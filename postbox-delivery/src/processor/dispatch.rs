//! A single dispatch cycle.

use chrono::Utc;
use tokio::task::JoinSet;

use crate::{
    error::Result,
    events::QueueEvent,
    policy::RetryPolicy,
    processor::{
        Dispatcher,
        worker::{self, WorkerContext, WorkerOutcome},
    },
    queue::{promote_due, promote_retryable, reclaim_stale},
    summary::{CycleSummary, SummaryBuilder},
};

/// Run one cycle against the configuration snapshot taken at its start.
///
/// 1. Reclaim stale locks
/// 2. Promote due SCHEDULED and rested RETRY records to QUEUED
/// 3. Fetch sub-batches of at most `concurrent_batch_size` QUEUED records
///    until `batch_size` candidates have been attempted or none remain;
///    each sub-batch is locked, delivered in parallel and fully drained
///    before the next fetch
/// 4. Summarise and emit the result
///
/// Lost lock races count towards `batch_size` so the cycle always ends.
pub(crate) async fn run_cycle(dispatcher: &Dispatcher) -> Result<CycleSummary> {
    let config = dispatcher.config.snapshot();
    let policy = RetryPolicy::from_config(&config);
    let store = dispatcher.store.as_ref();
    let started = Utc::now();
    let mut summary = SummaryBuilder::new(dispatcher.processor_id(), started);

    summary.reclaimed(reclaim_stale(store, config.lock_timeout(), started).await?);
    let scheduled = promote_due(store, started).await?;
    let retry = promote_retryable(store, &policy, started).await?;
    summary.promoted(scheduled, retry);

    let ctx = WorkerContext {
        store: dispatcher.store.clone(),
        transport: dispatcher.transport.clone(),
        events: dispatcher.events.clone(),
        locks: dispatcher.locks.clone(),
        policy,
    };

    let mut attempted = 0;
    while attempted < config.batch_size {
        if attempted > 0 && !config.batch_pause().is_zero() {
            tokio::time::sleep(config.batch_pause()).await;
        }

        let wanted = config.concurrent_batch_size.min(config.batch_size - attempted);
        let candidates = store.find_eligible(wanted).await?;
        if candidates.is_empty() {
            break;
        }
        attempted += candidates.len();
        summary.attempted(candidates.len());

        let mut workers = JoinSet::new();
        let mut lock_failure = None;
        for candidate in candidates {
            match dispatcher.locks.try_acquire(candidate.id, Utc::now()).await {
                Ok(true) => {
                    workers.spawn(worker::deliver(ctx.clone(), candidate));
                }
                Ok(false) => summary.lock_conflict(),
                Err(err) => {
                    lock_failure = Some(err);
                    break;
                }
            }
        }

        // Workers already started always run to completion
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(WorkerOutcome::Completed { status, error }) => {
                    summary.outcome(status, error.as_deref());
                }
                Ok(WorkerOutcome::LeaseLost) => summary.lost_lease(),
                Ok(WorkerOutcome::Unrecorded) => summary.unrecorded(),
                Err(err) => {
                    tracing::error!(error = %err, "Delivery worker panicked; its lease will be reclaimed");
                    summary.unrecorded();
                }
            }
        }

        if let Some(err) = lock_failure {
            return Err(err.into());
        }
    }

    let summary = summary.finish(Utc::now());
    dispatcher
        .events
        .emit(QueueEvent::CycleCompleted(summary.clone()));
    Ok(summary)
}
