//! Retry policy for delivery outcomes.
//!
//! Turns the result of one delivery attempt into the [`OutcomeUpdate`] the
//! store applies, independently of how the attempt was made.

use chrono::{DateTime, Duration, Utc};
use postbox_store::{OutcomeUpdate, QueueRecord, QueueStatus};

use crate::{config::QueueConfig, error::DeliveryError};

/// Decides the next status of a record after a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long a RETRY record rests before it is queued again
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            retry_delay: config.retry_delay(),
        }
    }

    /// Delivery succeeded: SENT, stamped, unlocked.
    #[must_use]
    pub fn on_success(&self, record: &QueueRecord, now: DateTime<Utc>) -> OutcomeUpdate {
        OutcomeUpdate {
            status: QueueStatus::Sent,
            retry_count: record.retry_count,
            error_message: None,
            sent_at: Some(now),
            last_retry_at: None,
            at: now,
        }
    }

    /// Delivery failed.
    ///
    /// A record that has already used its retry budget, or whose error is
    /// permanent, becomes FAILED. Otherwise its retry count grows by one and it
    /// becomes RETRY. `retry_count` never exceeds `max_retries`.
    #[must_use]
    pub fn on_failure(
        &self,
        record: &QueueRecord,
        error: &DeliveryError,
        now: DateTime<Utc>,
    ) -> OutcomeUpdate {
        let reason = Some(error.to_string());

        if !error.is_retryable() || self.is_exhausted(record) {
            return OutcomeUpdate {
                status: QueueStatus::Failed,
                retry_count: record.retry_count.min(record.max_retries),
                error_message: reason,
                sent_at: None,
                last_retry_at: Some(now),
                at: now,
            };
        }

        OutcomeUpdate {
            status: QueueStatus::Retry,
            retry_count: record.retry_count + 1,
            error_message: reason,
            sent_at: None,
            last_retry_at: Some(now),
            at: now,
        }
    }

    /// Whether another failure would be terminal
    #[must_use]
    pub const fn is_exhausted(&self, record: &QueueRecord) -> bool {
        record.retry_count >= record.max_retries
    }

    /// RETRY records last attempted at or before this instant may be queued again
    #[must_use]
    pub fn retry_threshold(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.retry_delay)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Whether a RETRY record has rested long enough
    #[must_use]
    pub fn is_due(&self, record: &QueueRecord, now: DateTime<Utc>) -> bool {
        record.status == QueueStatus::Retry
            && record
                .last_retry_at
                .is_none_or(|at| at <= self.retry_threshold(now))
    }
}

#[cfg(test)]
mod tests {
    use postbox_store::RecordId;

    use super::*;
    use crate::error::{PermanentError, TemporaryError};

    fn record(max_retries: u32) -> QueueRecord {
        let now = Utc::now();
        QueueRecord {
            id: RecordId(1),
            sender: "a@example.com".to_string(),
            subject: "hello".to_string(),
            status: QueueStatus::Processing,
            priority: 5,
            retry_count: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            sent_at: None,
            last_retry_at: None,
            error_message: None,
            processor_id: Some("worker".to_string()),
            unique_id: None,
            tags: Vec::new(),
            source: None,
            locked: true,
            locked_at: Some(now),
        }
    }

    fn temporary() -> DeliveryError {
        TemporaryError::ConnectionFailed("refused".to_string()).into()
    }

    #[test]
    fn test_success() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let update = policy.on_success(&record(3), now);

        assert_eq!(update.status, QueueStatus::Sent);
        assert_eq!(update.sent_at, Some(now));
        assert_eq!(update.error_message, None);
    }

    #[test]
    fn test_retry_bound() {
        let policy = RetryPolicy::default();
        let mut rec = record(3);
        let now = Utc::now();

        // max_retries + 1 consecutive failures
        for attempt in 1..=4 {
            let update = policy.on_failure(&rec, &temporary(), now);
            assert!(update.retry_count <= rec.max_retries);
            rec.status = update.status;
            rec.retry_count = update.retry_count;
            rec.last_retry_at = update.last_retry_at;

            if attempt <= 3 {
                assert_eq!(rec.status, QueueStatus::Retry);
                assert_eq!(rec.retry_count, attempt);
            }
        }

        assert_eq!(rec.status, QueueStatus::Failed);
        assert_eq!(rec.retry_count, 3);
        assert_eq!(rec.last_retry_at, Some(now));
    }

    #[test]
    fn test_zero_budget_fails_immediately() {
        let policy = RetryPolicy::default();
        let update = policy.on_failure(&record(0), &temporary(), Utc::now());
        assert_eq!(update.status, QueueStatus::Failed);
        assert_eq!(update.retry_count, 0);
    }

    #[test]
    fn test_permanent_error_skips_retry() {
        let policy = RetryPolicy::default();
        let error: DeliveryError =
            PermanentError::InvalidRecipient("nobody@invalid".to_string()).into();
        let update = policy.on_failure(&record(3), &error, Utc::now());

        assert_eq!(update.status, QueueStatus::Failed);
        assert_eq!(update.retry_count, 0);
        assert_eq!(
            update.error_message.as_deref(),
            Some("Permanent failure: Invalid recipient: nobody@invalid")
        );
    }

    #[test]
    fn test_retry_due() {
        let policy = RetryPolicy {
            retry_delay: Duration::minutes(15),
        };
        let now = Utc::now();
        let mut rec = record(3);
        rec.status = QueueStatus::Retry;

        rec.last_retry_at = Some(now - Duration::minutes(5));
        assert!(!policy.is_due(&rec, now));

        rec.last_retry_at = Some(now - Duration::minutes(15));
        assert!(policy.is_due(&rec, now));
    }
}
