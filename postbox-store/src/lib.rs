//! Persistence for queued mail and its archived history.
//!
//! The queue is modelled as a parent table ([`QueueRecord`]) with owned child
//! collections keyed by the parent's [`RecordId`]. All mutations that the
//! processing engine relies on for coordination are conditional updates,
//! so independent processes sharing one store never double-claim a record.

pub mod backends;
pub mod config;
pub mod error;
pub mod status;
pub mod store;
pub mod types;

pub use backends::{MemoryQueueStore, SqliteQueueStore};
pub use config::{SqliteConfig, StoreConfig};
pub use error::{Result, StoreError};
pub use status::QueueStatus;
pub use store::QueueStore;
pub use types::{
    ArchiveReport, Attachment, Content, HistoryAttachment, HistoryContent, HistoryEntry,
    HistoryId, HistoryRecipient, HistoryRecord, NewAttachment, NewRecipient, NewRecord,
    OutcomeUpdate, QueueRecord, QueueStats, Recipient, RecipientKind, RecordId,
};
