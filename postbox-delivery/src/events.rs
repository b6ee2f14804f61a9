//! Observability sink for queue events.
//!
//! Emitting never blocks and never fails from the engine's point of view.

use std::fmt::Debug;

use postbox_store::{QueueStatus, RecordId};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::summary::CycleSummary;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum QueueEvent {
    /// A dispatch cycle finished
    CycleCompleted(CycleSummary),
    /// A delivery attempt produced an outcome
    RecordOutcome {
        record_id: RecordId,
        status: QueueStatus,
        retry_count: u32,
        error: Option<String>,
    },
    /// An archival unit committed
    Archived {
        status: QueueStatus,
        count: usize,
        missing_content: Vec<RecordId>,
    },
}

/// Receives [`QueueEvent`]s. Implementations must return promptly.
pub trait EventSink: Send + Sync + Debug {
    fn emit(&self, event: QueueEvent);
}

/// Writes events to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: QueueEvent) {
        match event {
            QueueEvent::CycleCompleted(summary) if summary.is_idle() => {
                tracing::debug!(processor_id = %summary.processor_id, "Dispatch cycle found no work");
            }
            QueueEvent::CycleCompleted(summary) => tracing::info!("{summary}"),
            QueueEvent::RecordOutcome {
                record_id,
                status,
                retry_count,
                error,
            } => match error {
                Some(error) => tracing::warn!(%record_id, %status, retry_count, %error, "Delivery failed"),
                None => tracing::info!(%record_id, %status, "Delivered"),
            },
            QueueEvent::Archived {
                status,
                count,
                missing_content,
            } => tracing::info!(
                %status,
                count,
                missing_content = missing_content.len(),
                "Archived records"
            ),
        }
    }
}

/// Fans events out to any number of in-process subscribers.
///
/// Slow subscribers lag and lose events rather than slowing the engine.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<QueueEvent>,
}

impl BroadcastSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: QueueEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_subscriber() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();

        sink.emit(QueueEvent::Archived {
            status: QueueStatus::Sent,
            count: 2,
            missing_content: Vec::new(),
        });

        assert_eq!(
            rx.recv().await.expect("event"),
            QueueEvent::Archived {
                status: QueueStatus::Sent,
                count: 2,
                missing_content: Vec::new(),
            }
        );
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        BroadcastSink::new(1).emit(QueueEvent::CycleCompleted(CycleSummary::default()));
    }
}
