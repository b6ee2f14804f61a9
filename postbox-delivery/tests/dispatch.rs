#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use postbox_common::Signal;
use postbox_delivery::{
    BroadcastSink, ConfigHandle, DeliveryError, Dispatcher, NullSink, OutboundMessage,
    PermanentError, QueueConfig, QueueError, QueueEvent, TemporaryError, Transport,
};
use postbox_store::{
    MemoryQueueStore, NewRecipient, NewRecord, QueueStatus, QueueStore, RecordId,
};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    Succeed,
    FailTemporarily,
    FailPermanently,
}

/// Records every attempt and answers with a fixed behaviour
#[derive(Debug)]
struct RecordingTransport {
    behaviour: Behaviour,
    attempts: Mutex<Vec<(RecordId, String)>>,
    latency: Duration,
}

impl RecordingTransport {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            attempts: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        })
    }

    fn slow(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            behaviour: Behaviour::Succeed,
            attempts: Mutex::new(Vec::new()),
            latency,
        })
    }

    fn subjects(&self) -> Vec<String> {
        self.attempts.lock().iter().map(|(_, s)| s.clone()).collect()
    }

    fn ids(&self) -> Vec<RecordId> {
        self.attempts.lock().iter().map(|(id, _)| *id).collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        self.attempts
            .lock()
            .push((message.record.id, message.record.subject.clone()));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::FailTemporarily => {
                Err(TemporaryError::ServerBusy("try later".to_string()).into())
            }
            Behaviour::FailPermanently => {
                Err(PermanentError::MessageRejected("no thanks".to_string()).into())
            }
        }
    }
}

/// Reclaims every lock while the delivery is in flight
#[derive(Debug)]
struct ReclaimingTransport {
    store: Arc<dyn QueueStore>,
}

#[async_trait]
impl Transport for ReclaimingTransport {
    async fn deliver(&self, _message: &OutboundMessage) -> Result<(), DeliveryError> {
        let now = Utc::now();
        self.store
            .reclaim_stale(now + chrono::Duration::hours(1), now)
            .await?;
        Ok(())
    }
}

/// Tracks how many deliveries overlap and the order they start and finish in
#[derive(Debug, Default)]
struct OverlapTransport {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    timeline: Mutex<Vec<(String, bool)>>,
}

impl OverlapTransport {
    fn position(&self, subject: &str, started: bool) -> usize {
        self.timeline
            .lock()
            .iter()
            .position(|(s, start)| s == subject && *start == started)
            .expect("delivery was seen")
    }
}

#[async_trait]
impl Transport for OverlapTransport {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let subject = message.record.subject.clone();
        self.timeline.lock().push((subject.clone(), true));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(5)).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.timeline.lock().push((subject, false));
        Ok(())
    }
}

fn config(batch_size: usize, concurrent_batch_size: usize) -> ConfigHandle {
    ConfigHandle::new(QueueConfig {
        batch_size,
        concurrent_batch_size,
        retry_delay_minutes: 0,
        batch_pause_ms: 0,
        ..QueueConfig::default()
    })
    .expect("valid config")
}

fn dispatcher(
    store: &Arc<MemoryQueueStore>,
    transport: Arc<dyn Transport>,
    config: ConfigHandle,
) -> Dispatcher {
    let dispatcher = Dispatcher::new(store.clone(), transport, config).with_events(Arc::new(NullSink));
    dispatcher.start();
    dispatcher
}

async fn enqueue(store: &MemoryQueueStore, subject: &str, priority: i32) -> RecordId {
    store
        .insert(
            NewRecord::queued("sender@example.com", subject)
                .with_priority(priority)
                .with_body("hello")
                .with_recipient(NewRecipient::to("rcpt@example.com")),
        )
        .await
        .expect("insert")
}

async fn assert_at_rest(store: &MemoryQueueStore) {
    for status in QueueStatus::ALL {
        for record in store.find_by_status(status, 1_000).await.expect("find") {
            assert_eq!(
                record.locked,
                record.status == QueueStatus::Processing,
                "record {} is {} with locked={}",
                record.id,
                record.status,
                record.locked
            );
        }
    }
}

#[tokio::test]
async fn test_stopped_dispatcher_refuses_cycles() {
    let store = Arc::new(MemoryQueueStore::new());
    let dispatcher = Dispatcher::new(store, RecordingTransport::new(Behaviour::Succeed), config(10, 5));
    assert!(matches!(dispatcher.run_cycle().await, Err(QueueError::Stopped)));

    dispatcher.start();
    assert!(dispatcher.run_cycle().await.is_ok());
    dispatcher.stop();
    assert!(matches!(dispatcher.run_cycle().await, Err(QueueError::Stopped)));
}

#[tokio::test]
async fn test_delivers_in_priority_order() {
    let store = Arc::new(MemoryQueueStore::new());
    enqueue(&store, "three", 3).await;
    enqueue(&store, "one", 1).await;
    enqueue(&store, "two", 2).await;

    let transport = RecordingTransport::new(Behaviour::Succeed);
    let dispatcher = dispatcher(&store, transport.clone(), config(10, 1));
    let summary = dispatcher.run_cycle().await.expect("cycle");

    assert_eq!(transport.subjects(), vec!["one", "two", "three"]);
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.sent, 3);
    assert_eq!(store.count_by_status().await.expect("stats").sent, 3);
    assert_at_rest(&store).await;
}

#[tokio::test]
async fn test_batch_size_bounds_a_cycle() {
    let store = Arc::new(MemoryQueueStore::new());
    for n in 0..7 {
        enqueue(&store, &format!("m{n}"), 5).await;
    }

    let transport = RecordingTransport::new(Behaviour::Succeed);
    let dispatcher = dispatcher(&store, transport.clone(), config(4, 3));

    let first = dispatcher.run_cycle().await.expect("cycle");
    assert_eq!(first.attempted, 4);
    assert_eq!(store.count_by_status().await.expect("stats").queued, 3);

    let second = dispatcher.run_cycle().await.expect("cycle");
    assert_eq!(second.attempted, 3);
    assert_eq!(transport.ids().len(), 7);
    assert_eq!(dispatcher.status().cycles, 2);
    assert_eq!(dispatcher.status().last_cycle, Some(second));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sub_batches_are_bounded_and_drained_in_turn() {
    let store = Arc::new(MemoryQueueStore::new());
    for priority in 1..=9 {
        enqueue(&store, &format!("m{priority}"), priority).await;
    }

    let transport = Arc::new(OverlapTransport::default());
    let dispatcher = dispatcher(&store, transport.clone(), config(9, 3));
    let summary = dispatcher.run_cycle().await.expect("cycle");

    assert_eq!(summary.sent, 9);
    let peak = transport.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "{peak} deliveries overlapped");

    // Sub-batches follow priority order: m1..m3, m4..m6, m7..m9
    for (current, next) in [(1..=3, 4..=6), (4..=6, 7..=9)] {
        let last_end = current
            .map(|n| transport.position(&format!("m{n}"), false))
            .max()
            .expect("non-empty");
        let first_start = next
            .map(|n| transport.position(&format!("m{n}"), true))
            .min()
            .expect("non-empty");
        assert!(
            last_end < first_start,
            "next sub-batch started before the previous one drained"
        );
    }
    assert_at_rest(&store).await;
}

#[tokio::test]
async fn test_due_scheduled_record_completes_in_one_cycle() {
    let store = Arc::new(MemoryQueueStore::new());
    let due = store
        .insert(
            NewRecord::queued("sender@example.com", "due")
                .scheduled_for(Utc::now() - chrono::Duration::seconds(1))
                .with_recipient(NewRecipient::to("rcpt@example.com")),
        )
        .await
        .expect("insert");
    let later = store
        .insert(
            NewRecord::queued("sender@example.com", "later")
                .scheduled_for(Utc::now() + chrono::Duration::hours(1))
                .with_recipient(NewRecipient::to("rcpt@example.com")),
        )
        .await
        .expect("insert");

    let dispatcher = dispatcher(&store, RecordingTransport::new(Behaviour::Succeed), config(10, 5));
    let summary = dispatcher.run_cycle().await.expect("cycle");

    assert_eq!(summary.promoted_scheduled, 1);
    let due = store.get(due).await.expect("get").expect("present");
    assert_eq!(due.status, QueueStatus::Sent);
    assert!(due.sent_at.is_some());
    let later = store.get(later).await.expect("get").expect("present");
    assert_eq!(later.status, QueueStatus::Scheduled);
}

#[tokio::test]
async fn test_temporary_failures_exhaust_the_retry_budget() {
    let store = Arc::new(MemoryQueueStore::new());
    let id = store
        .insert(
            NewRecord::queued("sender@example.com", "flaky")
                .with_max_retries(2)
                .with_recipient(NewRecipient::to("rcpt@example.com")),
        )
        .await
        .expect("insert");

    let transport = RecordingTransport::new(Behaviour::FailTemporarily);
    let dispatcher = dispatcher(&store, transport.clone(), config(10, 5));

    for expected in [1, 2] {
        let summary = dispatcher.run_cycle().await.expect("cycle");
        assert_eq!(summary.retried, 1);
        let record = store.get(id).await.expect("get").expect("present");
        assert_eq!(record.status, QueueStatus::Retry);
        assert_eq!(record.retry_count, expected);
        assert!(!record.locked);
    }

    let summary = dispatcher.run_cycle().await.expect("cycle");
    assert_eq!(summary.promoted_retry, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.top_errors.len(), 1);

    let record = store.get(id).await.expect("get").expect("present");
    assert_eq!(record.status, QueueStatus::Failed);
    assert_eq!(record.retry_count, 2);
    assert!(record.error_message.is_some_and(|e| e.contains("try later")));
    assert_eq!(transport.ids(), vec![id, id, id]);

    // Terminal records are never attempted again
    dispatcher.run_cycle().await.expect("cycle");
    assert_eq!(transport.ids().len(), 3);
}

#[tokio::test]
async fn test_permanent_failure_skips_retries() {
    let store = Arc::new(MemoryQueueStore::new());
    let id = enqueue(&store, "rejected", 5).await;

    let dispatcher = dispatcher(&store, RecordingTransport::new(Behaviour::FailPermanently), config(10, 5));
    let summary = dispatcher.run_cycle().await.expect("cycle");

    assert_eq!(summary.failed, 1);
    let record = store.get(id).await.expect("get").expect("present");
    assert_eq!(record.status, QueueStatus::Failed);
    assert_eq!(record.retry_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dispatchers_sharing_a_store_never_double_deliver() {
    let store = Arc::new(MemoryQueueStore::new());
    for n in 0..30 {
        enqueue(&store, &format!("m{n}"), n % 3).await;
    }

    let transport = RecordingTransport::slow(Duration::from_millis(2));
    let first = dispatcher(&store, transport.clone(), config(30, 5)).with_processor_id("first");
    let second = dispatcher(&store, transport.clone(), config(30, 5)).with_processor_id("second");
    first.start();
    second.start();

    for _ in 0..5 {
        let (a, b) = tokio::join!(first.run_cycle(), second.run_cycle());
        a.expect("first cycle");
        b.expect("second cycle");
        assert_at_rest(&store).await;
    }

    let mut ids = transport.ids();
    ids.sort();
    let delivered = ids.len();
    ids.dedup();
    assert_eq!(ids.len(), delivered, "a record was delivered twice");
    assert_eq!(delivered, 30);
    assert_eq!(store.count_by_status().await.expect("stats").sent, 30);
}

#[tokio::test]
async fn test_reload_applies_to_next_cycle() {
    let store = Arc::new(MemoryQueueStore::new());
    for n in 0..5 {
        enqueue(&store, &format!("m{n}"), 5).await;
    }

    let handle = config(1, 1);
    let dispatcher = dispatcher(&store, RecordingTransport::new(Behaviour::Succeed), handle.clone());
    assert_eq!(dispatcher.run_cycle().await.expect("cycle").attempted, 1);

    handle
        .update(QueueConfig {
            batch_size: 10,
            batch_pause_ms: 0,
            ..QueueConfig::default()
        })
        .expect("valid");
    assert_eq!(dispatcher.run_cycle().await.expect("cycle").attempted, 4);

    // Invalid updates leave the running configuration alone
    assert!(
        handle
            .update(QueueConfig {
                batch_size: 0,
                ..QueueConfig::default()
            })
            .is_err()
    );
    assert_eq!(dispatcher.config().snapshot().batch_size, 10);
}

#[tokio::test]
async fn test_lost_lease_leaves_record_to_its_new_owner() {
    let store = Arc::new(MemoryQueueStore::new());
    let id = enqueue(&store, "contested", 5).await;

    let transport = Arc::new(ReclaimingTransport {
        store: store.clone(),
    });
    let dispatcher = dispatcher(&store, transport, config(1, 1));
    let summary = dispatcher.run_cycle().await.expect("cycle");

    assert_eq!(summary.lost_leases, 1);
    assert_eq!(summary.sent, 0);
    let record = store.get(id).await.expect("get").expect("present");
    assert_eq!(record.status, QueueStatus::Queued);
    assert!(!record.locked);
    assert_eq!(record.processor_id, None);
}

#[tokio::test]
async fn test_events_report_outcomes_and_summary() {
    let store = Arc::new(MemoryQueueStore::new());
    let id = enqueue(&store, "watched", 5).await;

    let sink = Arc::new(BroadcastSink::new(16));
    let mut events = sink.subscribe();
    let dispatcher = Dispatcher::new(store.clone(), RecordingTransport::new(Behaviour::Succeed), config(10, 5))
        .with_events(sink);
    dispatcher.start();
    dispatcher.run_cycle().await.expect("cycle");

    assert_eq!(
        events.recv().await.expect("outcome"),
        QueueEvent::RecordOutcome {
            record_id: id,
            status: QueueStatus::Sent,
            retry_count: 0,
            error: None,
        }
    );
    match events.recv().await.expect("summary") {
        QueueEvent::CycleCompleted(summary) => assert_eq!(summary.sent, 1),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_serve_runs_until_shutdown() {
    let store = Arc::new(MemoryQueueStore::new());
    enqueue(&store, "served", 5).await;

    let sink = Arc::new(BroadcastSink::new(16));
    let mut events = sink.subscribe();
    let dispatcher = Arc::new(
        Dispatcher::new(store.clone(), RecordingTransport::new(Behaviour::Succeed), config(10, 5))
            .with_events(sink),
    );

    let (tx, rx) = broadcast::channel(4);
    let serving = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.serve(rx).await }
    });

    loop {
        if let QueueEvent::CycleCompleted(_) = events.recv().await.expect("event") {
            break;
        }
    }
    assert!(dispatcher.is_running());

    tx.send(Signal::Shutdown).expect("send");
    serving.await.expect("join").expect("serve");
    assert!(!dispatcher.is_running());
    assert_eq!(store.count_by_status().await.expect("stats").sent, 1);
}
