#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Submission through archival against a file-backed store.

use std::sync::Arc;

use postbox_delivery::{
    ArchivalService, ConfigHandle, Dispatcher, NewMessage, NullSink, QueueConfig, QueueService,
    SimulatedTransport,
};
use postbox_store::{NewAttachment, NewRecipient, QueueStatus, QueueStore, SqliteQueueStore};

#[tokio::test]
async fn test_submitted_mail_is_delivered_then_archived() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn QueueStore> =
        Arc::new(SqliteQueueStore::open_path(dir.path().join("queue.db")).expect("open"));
    let config = ConfigHandle::new(QueueConfig {
        batch_pause_ms: 0,
        ..QueueConfig::default()
    })
    .expect("valid");

    let service = QueueService::new(store.clone(), config.clone());
    let mut ids = Vec::new();
    for n in 0..3 {
        let submission = service
            .submit(NewMessage {
                sender: "reports@example.com".to_string(),
                subject: format!("report {n}"),
                body: Some("see attached".to_string()),
                recipients: vec![NewRecipient::to("a@example.com"), NewRecipient::to("b@example.com")],
                attachments: vec![NewAttachment {
                    file_name: "report.pdf".to_string(),
                    content_type: "application/pdf".to_string(),
                    storage_path: format!("/var/spool/reports/{n}.pdf"),
                }],
                ..NewMessage::default()
            })
            .await
            .expect("submit");
        ids.push(submission.id());
    }

    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(SimulatedTransport::instant()),
        config.clone(),
    )
    .with_events(Arc::new(NullSink));
    dispatcher.start();
    let summary = dispatcher.run_cycle().await.expect("cycle");
    assert_eq!(summary.sent, 3);

    let archival = ArchivalService::new(store.clone(), config).with_events(Arc::new(NullSink));
    assert_eq!(archival.run_cycle().await.expect("archive"), 3);

    let stats = service.stats().await.expect("stats");
    assert_eq!(stats.total, 0);
    assert_eq!(store.history_count().await.expect("count"), 3);

    for id in ids {
        assert!(service.get(id).await.expect("get").is_none());
        let history = service.history(id).await.expect("history");
        assert_eq!(history.len(), 1);
        let entry = &history[0];
        assert_eq!(entry.record.status, QueueStatus::Sent);
        assert_eq!(entry.record.original_record_id, id);
        assert!(entry.record.sent_at.is_some());
        assert_eq!(entry.content.as_ref().map(|c| c.body.as_str()), Some("see attached"));
        assert_eq!(entry.recipients.len(), 2);
        assert_eq!(entry.attachments.len(), 1);
    }

    // Nothing left to move
    assert_eq!(archival.run_cycle().await.expect("archive"), 0);
}
