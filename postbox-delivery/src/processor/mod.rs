//! Dispatch orchestration

mod dispatch;
pub(crate) mod worker;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use postbox_common::{Signal, internal};
use postbox_store::QueueStore;
use rand::{Rng, distr::Alphanumeric};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    config::ConfigHandle,
    error::{QueueError, Result},
    events::{EventSink, TracingSink},
    queue::LockManager,
    summary::CycleSummary,
    transport::Transport,
};

/// `hostname-pid-xxxxxxxx`, unique per process start
#[must_use]
pub fn generate_processor_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();

    match hostname::get().ok().and_then(|h| h.into_string().ok()) {
        Some(host) => format!("{host}-{}-{suffix}", std::process::id()),
        None => ulid::Ulid::new().to_string().to_lowercase(),
    }
}

/// Point-in-time view of a dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorStatus {
    pub processor_id: String,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub cycles: u64,
    pub last_cycle: Option<CycleSummary>,
}

/// Pulls batches from the queue and drives them through delivery.
///
/// Several dispatchers, in one process or many, may share a store; they
/// coordinate only through the store's conditional updates.
#[derive(Debug)]
pub struct Dispatcher {
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn Transport>,
    events: Arc<dyn EventSink>,
    config: ConfigHandle,
    locks: LockManager,
    running: AtomicBool,
    cycles: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
    last_cycle: Mutex<Option<CycleSummary>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
        config: ConfigHandle,
    ) -> Self {
        let locks = LockManager::new(Arc::clone(&store), generate_processor_id());
        Self {
            store,
            transport,
            events: Arc::new(TracingSink),
            config,
            locks,
            running: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            started_at: Mutex::new(None),
            last_cycle: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_processor_id(mut self, processor_id: impl Into<Arc<str>>) -> Self {
        self.locks = LockManager::new(Arc::clone(&self.store), processor_id);
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn processor_id(&self) -> &str {
        self.locks.owner()
    }

    #[must_use]
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Allow cycles to run
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            *self.started_at.lock() = Some(Utc::now());
            internal!(level = INFO, "Queue processor {} started", self.processor_id());
        }
    }

    /// Refuse new cycles. A cycle already in flight runs to completion.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            internal!(level = INFO, "Queue processor {} stopped", self.processor_id());
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn status(&self) -> ProcessorStatus {
        ProcessorStatus {
            processor_id: self.processor_id().to_string(),
            running: self.is_running(),
            started_at: *self.started_at.lock(),
            cycles: self.cycles.load(Ordering::Relaxed),
            last_cycle: self.last_cycle.lock().clone(),
        }
    }

    /// Run one dispatch cycle now.
    ///
    /// # Errors
    /// [`QueueError::Stopped`] if the processor is not running; otherwise a
    /// cycle-level failure such as the store being unavailable. Failures of
    /// individual deliveries are never returned; they become record state.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        if !self.is_running() {
            return Err(QueueError::Stopped);
        }

        let summary = dispatch::run_cycle(self).await?;
        self.cycles.fetch_add(1, Ordering::Relaxed);
        *self.last_cycle.lock() = Some(summary.clone());
        Ok(summary)
    }

    /// Run cycles until shutdown, waiting `dispatch_interval_secs` (read
    /// afresh each time) between the end of one cycle and the start of the next.
    ///
    /// Cycles never overlap. A shutdown received mid-cycle takes effect once
    /// the cycle has finished.
    ///
    /// # Errors
    /// Cycle failures are logged, not returned; this only ends on shutdown.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<()> {
        self.start();

        loop {
            match self.run_cycle().await {
                Ok(_) => {}
                Err(QueueError::Stopped) => {
                    tracing::debug!("Queue processor is not running, skipping cycle");
                }
                Err(err) => tracing::error!(error = %err, "Dispatch cycle aborted"),
            }

            let delay = self.config.snapshot().dispatch_interval();
            if !idle(delay, &mut shutdown).await {
                break;
            }
        }

        self.stop();
        internal!("Dispatcher shutdown complete");
        Ok(())
    }
}

/// Sleep for `delay`, returning `false` early if shutdown is signalled.
pub(crate) async fn idle(delay: Duration, shutdown: &mut broadcast::Receiver<Signal>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            () = &mut sleep => return true,
            signal = shutdown.recv() => match signal {
                Ok(Signal::Shutdown | Signal::Finalised)
                | Err(broadcast::error::RecvError::Closed) => return false,
                Ok(Signal::Reload) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            }
        }
    }
}
