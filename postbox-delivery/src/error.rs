//! Typed error handling for queue processing.
//!
//! Delivery errors distinguish between:
//! - Permanent failures - the record goes straight to FAILED
//! - Temporary failures - retried until the record's budget is spent
//! - System errors - internal problems, also retried
//!
//! Losing a lock race is not an error at all and has no variant here.

use postbox_store::StoreError;
use thiserror::Error;

/// Outcome of a failed delivery attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Failure that will not go away by retrying.
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// Failure that may succeed on a later attempt.
    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    /// Internal error while preparing or recording the attempt.
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Errors that should not be retried.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// Recipient address is invalid or rejected.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// The record has no recipients to deliver to.
    #[error("No recipients for record {0}")]
    NoRecipients(String),

    /// Message was rejected by the relay.
    #[error("Message rejected: {0}")]
    MessageRejected(String),

    /// Message size exceeds relay limits.
    #[error("Message too large: {0}")]
    MessageTooLarge(String),
}

/// Errors that should be retried after the retry delay.
#[derive(Debug, Error)]
pub enum TemporaryError {
    /// Failed to reach the relay.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Relay is temporarily busy or unavailable.
    #[error("Server busy: {0}")]
    ServerBusy(String),

    /// Rate limit exceeded.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Attempt timed out.
    #[error("Timed out: {0}")]
    Timeout(String),
}

/// System-level errors that indicate internal problems.
#[derive(Debug, Error)]
pub enum SystemError {
    /// Reading the record or its children failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl DeliveryError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Returns `true` if this error is permanent and should not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Returns `true` if this is a system error.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Whether the retry policy may schedule another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !self.is_permanent()
    }
}

impl From<StoreError> for DeliveryError {
    fn from(error: StoreError) -> Self {
        Self::System(SystemError::Store(error))
    }
}

/// Invalid queue configuration. Fatal at startup, rejected on reload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration for `{field}`: {reason}")]
    InvalidConfiguration { field: &'static str, reason: String },
}

/// Cycle-level failure; the cycle ends early and the next firing retries.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Store(#[from] StoreError),

    /// The processor is not running.
    #[error("Processor is stopped")]
    Stopped,

    /// A record referenced by an operator request does not exist.
    #[error("Record not found: {0}")]
    NotFound(postbox_store::RecordId),

    /// The request is not valid for the record's current status.
    #[error("Record {id} is {status}, expected one of {expected}")]
    WrongStatus {
        id: postbox_store::RecordId,
        status: postbox_store::QueueStatus,
        expected: &'static str,
    },

    /// Only terminal records may be archived.
    #[error("{0} is not a terminal status and cannot be archived")]
    NotArchivable(postbox_store::QueueStatus),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, QueueError>;
