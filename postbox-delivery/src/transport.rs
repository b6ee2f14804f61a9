//! The seam between the queue engine and whatever actually sends mail.

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use postbox_store::{Attachment, Content, QueueRecord, Recipient};
use rand::Rng;
use serde::Deserialize;

use crate::error::{ConfigError, DeliveryError, PermanentError, TemporaryError};

/// A locked record with everything needed to send it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub record: QueueRecord,
    pub content: Option<Content>,
    pub recipients: Vec<Recipient>,
    pub attachments: Vec<Attachment>,
}

/// Delivers one message.
///
/// Any error is treated as retryable unless it is [`DeliveryError::Permanent`].
/// The engine imposes no timeout of its own; implementations that talk to
/// the network should enforce one.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// # Errors
    /// Why the message could not be delivered
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError>;
}

/// Stand-in transport that sleeps for a random latency and fails at random.
///
/// Random failures are temporary. A message without recipients fails
/// permanently.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimulatedTransport {
    /// Probability in `[0, 1]` that an attempt fails
    #[serde(default)]
    pub failure_rate: f64,
    #[serde(default = "defaults::min_latency_ms")]
    pub min_latency_ms: u64,
    #[serde(default = "defaults::max_latency_ms")]
    pub max_latency_ms: u64,
}

mod defaults {
    pub const fn min_latency_ms() -> u64 {
        50
    }

    pub const fn max_latency_ms() -> u64 {
        500
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            min_latency_ms: defaults::min_latency_ms(),
            max_latency_ms: defaults::max_latency_ms(),
        }
    }
}

impl SimulatedTransport {
    /// Always succeeds, immediately
    #[must_use]
    pub const fn instant() -> Self {
        Self {
            failure_rate: 0.0,
            min_latency_ms: 0,
            max_latency_ms: 0,
        }
    }

    /// # Errors
    /// If the failure rate is outside `[0, 1]` or the latency range is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(ConfigError::InvalidConfiguration {
                field: "transport.failure_rate",
                reason: format!("{} is not between 0 and 1", self.failure_rate),
            });
        }
        if self.min_latency_ms > self.max_latency_ms {
            return Err(ConfigError::InvalidConfiguration {
                field: "transport.min_latency_ms",
                reason: format!(
                    "{} exceeds max_latency_ms {}",
                    self.min_latency_ms, self.max_latency_ms
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        if message.recipients.is_empty() {
            return Err(PermanentError::NoRecipients(message.record.id.to_string()).into());
        }

        let (latency, fail) = {
            let mut rng = rand::rng();
            let latency = if self.max_latency_ms > self.min_latency_ms {
                rng.random_range(self.min_latency_ms..=self.max_latency_ms)
            } else {
                self.min_latency_ms
            };
            let rate = if (0.0..=1.0).contains(&self.failure_rate) {
                self.failure_rate
            } else {
                0.0
            };
            (latency, rng.random_bool(rate))
        };

        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if fail {
            return Err(TemporaryError::ConnectionFailed(format!(
                "simulated failure after {latency}ms"
            ))
            .into());
        }

        tracing::debug!(
            record_id = %message.record.id,
            recipients = message.recipients.len(),
            latency_ms = latency,
            "Simulated delivery"
        );
        Ok(())
    }
}

/// Which transport the daemon delivers through
///
/// ```ron
/// transport: Simulated(failure_rate: 0.1, min_latency_ms: 300, max_latency_ms: 3000),
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub enum TransportConfig {
    Simulated(SimulatedTransport),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Simulated(SimulatedTransport::default())
    }
}

impl TransportConfig {
    /// # Errors
    /// If the transport settings are invalid
    pub fn into_transport(self) -> Result<std::sync::Arc<dyn Transport>, ConfigError> {
        match self {
            Self::Simulated(transport) => {
                transport.validate()?;
                Ok(std::sync::Arc::new(transport))
            }
        }
    }
}
