//! Queue processing for postbox.
//!
//! A [`Dispatcher`] periodically reclaims abandoned locks, promotes due and
//! retryable records, then claims batches of QUEUED records and hands each to
//! a [`Transport`] on its own task. Outcomes flow through the [`RetryPolicy`]
//! into the store. An [`ArchivalService`] moves terminal records to history on
//! its own schedule, and [`QueueService`] covers submission and operator
//! actions.

pub mod archive;
pub mod config;
pub mod error;
pub mod events;
pub mod policy;
pub mod processor;
pub mod queue;
pub mod service;
pub mod summary;
pub mod transport;

pub use archive::ArchivalService;
pub use config::{ConfigHandle, GroupingPolicy, QueueConfig};
pub use error::{
    ConfigError, DeliveryError, PermanentError, QueueError, SystemError, TemporaryError,
};
pub use events::{BroadcastSink, EventSink, NullSink, QueueEvent, TracingSink};
pub use policy::RetryPolicy;
pub use processor::{Dispatcher, ProcessorStatus, generate_processor_id};
pub use service::{NewMessage, QueueService, Submission};
pub use summary::CycleSummary;
pub use transport::{OutboundMessage, SimulatedTransport, Transport, TransportConfig};
