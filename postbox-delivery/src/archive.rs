//! Moves terminal records into history storage.

use std::sync::Arc;

use chrono::Utc;
use postbox_common::{Signal, internal};
use postbox_store::{ArchiveReport, QueueStatus, QueueStore};
use tokio::sync::broadcast;

use crate::{
    config::ConfigHandle,
    error::{QueueError, Result},
    events::{EventSink, QueueEvent, TracingSink},
    processor::idle,
};

#[derive(Debug, Clone)]
pub struct ArchivalService {
    store: Arc<dyn QueueStore>,
    config: ConfigHandle,
    events: Arc<dyn EventSink>,
}

impl ArchivalService {
    pub fn new(store: Arc<dyn QueueStore>, config: ConfigHandle) -> Self {
        Self {
            store,
            config,
            events: Arc::new(TracingSink),
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Archive every record currently in `status` as one atomic unit.
    ///
    /// Records without content (or without recipients or attachments) are
    /// archived all the same; missing content is logged per record.
    ///
    /// # Errors
    /// [`QueueError::NotArchivable`] for a non-terminal status, or the store
    /// error that rolled the unit back
    pub async fn archive(&self, status: QueueStatus) -> Result<ArchiveReport> {
        if !status.is_terminal() {
            return Err(QueueError::NotArchivable(status));
        }

        let report = self.store.archive(status, Utc::now()).await?;
        if report.moved.is_empty() {
            tracing::debug!(%status, "Nothing to archive");
            return Ok(report);
        }

        for id in &report.missing_content {
            tracing::warn!(record_id = %id, %status, "Archived record had no content");
        }

        self.events.emit(QueueEvent::Archived {
            status,
            count: report.count(),
            missing_content: report.missing_content.clone(),
        });
        Ok(report)
    }

    /// Archive each configured status in turn. Returns the total moved.
    ///
    /// # Errors
    /// The first failing status ends the cycle; statuses already archived
    /// stay archived.
    pub async fn run_cycle(&self) -> Result<usize> {
        let config = self.config.snapshot();
        let mut total = 0;
        for &status in &config.archive_statuses {
            total += self.archive(status).await?.count();
        }
        Ok(total)
    }

    /// Run archival cycles until shutdown, `archive_interval_secs` apart.
    ///
    /// # Errors
    /// Cycle failures are logged, not returned.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<()> {
        internal!("Archival service starting");

        loop {
            let delay = self.config.snapshot().archive_interval();
            if !idle(delay, &mut shutdown).await {
                break;
            }

            match self.run_cycle().await {
                Ok(0) => {}
                Ok(total) => tracing::info!(total, "Archival cycle complete"),
                Err(err) => tracing::error!(error = %err, "Archival cycle aborted"),
            }
        }

        internal!("Archival service shutdown complete");
        Ok(())
    }
}
