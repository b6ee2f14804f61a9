//! Lifecycle of a queued message.
//!
//! ```text
//! SCHEDULED ──due──▶ QUEUED ──lock──▶ PROCESSING ──ok──▶ SENT
//!     │               ▲  │                 │
//!     │        delay  │  │                 ├──fail, attempts left──▶ RETRY
//!     │               └──┼─────────────────┼──────────────────────────┘
//!     │                  │                 └──fail, exhausted──▶ FAILED
//!     └──────────────────┴──── cancel (also from RETRY) ──▶ CANCELLED
//! ```

use core::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::StoreError;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum QueueStatus {
    Scheduled,
    Queued,
    Processing,
    Retry,
    Sent,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub const ALL: [Self; 7] = [
        Self::Scheduled,
        Self::Queued,
        Self::Processing,
        Self::Retry,
        Self::Sent,
        Self::Failed,
        Self::Cancelled,
    ];

    /// No processing-driven transition leaves a terminal status
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancelled)
    }

    /// Whether a user may still cancel a record in this status
    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        matches!(self, Self::Queued | Self::Scheduled | Self::Retry)
    }

    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Scheduled, Self::Queued | Self::Cancelled)
                | (Self::Queued, Self::Processing | Self::Cancelled)
                | (Self::Processing, Self::Sent | Self::Retry | Self::Failed | Self::Queued)
                | (Self::Retry, Self::Queued | Self::Cancelled)
        )
    }

    /// Validate a transition, returning the new status.
    ///
    /// `PROCESSING -> QUEUED` is only ever applied by stale lock reclaim.
    ///
    /// # Errors
    /// [`StoreError::InvalidTransition`] for any edge not in the lifecycle
    pub fn transition(self, next: Self) -> Result<Self, StoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(StoreError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Retry => "RETRY",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| StoreError::Corrupted(format!("unknown status {s:?}")))
    }
}

impl Display for QueueStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::QueueStatus::{self, *};

    #[test]
    fn terminal() {
        assert!(Sent.is_terminal());
        assert!(Failed.is_terminal());
        assert!(Cancelled.is_terminal());
        assert!(!Processing.is_terminal());
        assert!(!Retry.is_terminal());
    }

    #[test]
    fn lifecycle_edges() {
        assert!(Scheduled.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Sent));
        assert!(Processing.can_transition_to(Retry));
        assert!(Processing.can_transition_to(Failed));
        assert!(Retry.can_transition_to(Queued));

        for from in [Queued, Scheduled, Retry] {
            assert!(from.can_transition_to(Cancelled), "{from} should cancel");
        }
        for from in [Processing, Sent, Failed] {
            assert!(!from.can_transition_to(Cancelled), "{from} must not cancel");
        }
    }

    #[test]
    fn terminal_states_are_sinks() {
        for from in [Sent, Failed, Cancelled] {
            for to in QueueStatus::ALL {
                assert!(from.transition(to).is_err(), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn rejects_skipping_the_lock() {
        assert!(Queued.transition(Sent).is_err());
        assert!(Retry.transition(Processing).is_err());
        assert!(Scheduled.transition(Processing).is_err());
    }

    #[test]
    fn round_trips_names() {
        for status in QueueStatus::ALL {
            assert_eq!(status.as_str().parse::<QueueStatus>().ok(), Some(status));
        }
        assert_eq!("sent".parse::<QueueStatus>().ok(), Some(Sent));
        assert!("DELIVERED".parse::<QueueStatus>().is_err());
    }
}
