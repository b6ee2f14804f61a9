use std::fmt;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use postbox_store::QueueStatus;
use serde::Serialize;

/// How many distinct error messages a summary keeps
pub const TOP_ERRORS: usize = 3;

/// What one dispatch cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub processor_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub reclaimed: u64,
    pub promoted_scheduled: u64,
    pub promoted_retry: u64,
    /// Candidates fetched, including those lost to another processor
    pub attempted: usize,
    pub lock_conflicts: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    /// Outcomes discarded because the lease had been reclaimed
    pub lost_leases: usize,
    /// Outcomes that could not be written; the lease is left for reclaim
    pub unrecorded: usize,
    /// Most frequent failure messages, most frequent first
    pub top_errors: Vec<(String, usize)>,
}

impl CycleSummary {
    /// Records that reached an outcome this cycle
    #[must_use]
    pub const fn processed(&self) -> usize {
        self.sent + self.retried + self.failed
    }

    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.attempted == 0 && self.reclaimed == 0
    }
}

/// Accumulates worker outcomes into a [`CycleSummary`]
#[derive(Debug, Default)]
pub struct SummaryBuilder {
    summary: CycleSummary,
    errors: AHashMap<String, usize>,
}

impl SummaryBuilder {
    pub fn new(processor_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            summary: CycleSummary {
                processor_id: processor_id.to_string(),
                started_at: Some(started_at),
                ..CycleSummary::default()
            },
            errors: AHashMap::new(),
        }
    }

    pub const fn reclaimed(&mut self, count: u64) {
        self.summary.reclaimed = count;
    }

    pub const fn promoted(&mut self, scheduled: u64, retry: u64) {
        self.summary.promoted_scheduled = scheduled;
        self.summary.promoted_retry = retry;
    }

    pub const fn attempted(&mut self, count: usize) {
        self.summary.attempted += count;
    }

    pub const fn lock_conflict(&mut self) {
        self.summary.lock_conflicts += 1;
    }

    pub const fn lost_lease(&mut self) {
        self.summary.lost_leases += 1;
    }

    pub const fn unrecorded(&mut self) {
        self.summary.unrecorded += 1;
    }

    /// Count one outcome; `error` is the message stored on the record
    pub fn outcome(&mut self, status: QueueStatus, error: Option<&str>) {
        match status {
            QueueStatus::Sent => self.summary.sent += 1,
            QueueStatus::Retry => self.summary.retried += 1,
            QueueStatus::Failed => self.summary.failed += 1,
            _ => {}
        }
        if let Some(error) = error {
            *self.errors.entry(error.to_string()).or_default() += 1;
        }
    }

    #[must_use]
    pub fn finish(mut self, finished_at: DateTime<Utc>) -> CycleSummary {
        let mut errors: Vec<_> = self.errors.into_iter().collect();
        errors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        errors.truncate(TOP_ERRORS);
        self.summary.top_errors = errors;

        if let Some(started_at) = self.summary.started_at {
            self.summary.duration_ms =
                u64::try_from((finished_at - started_at).num_milliseconds()).unwrap_or_default();
        }
        self.summary
    }
}

#[allow(
    clippy::cast_precision_loss,
    reason = "Percentages of per-cycle counts are display only"
)]
fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

impl fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.processed();
        writeln!(f, "Dispatch cycle summary ({}):", self.processor_id)?;
        writeln!(f, "- processed: {total} of {} attempted", self.attempted)?;
        if self.sent > 0 {
            writeln!(f, "- sent: {} ({:.1}%)", self.sent, percent(self.sent, total))?;
        }
        if self.failed > 0 {
            writeln!(f, "- failed: {} ({:.1}%)", self.failed, percent(self.failed, total))?;
        }
        if self.retried > 0 {
            writeln!(f, "- retry: {} ({:.1}%)", self.retried, percent(self.retried, total))?;
        }
        if !self.top_errors.is_empty() {
            writeln!(f, "- top errors:")?;
            for (message, count) in &self.top_errors {
                writeln!(f, "  * {message} ({count})")?;
            }
        }
        if self.lock_conflicts > 0 {
            writeln!(f, "- lock conflicts: {}", self.lock_conflicts)?;
        }
        if self.lost_leases > 0 {
            writeln!(f, "- lost leases: {}", self.lost_leases)?;
        }
        if self.unrecorded > 0 {
            writeln!(f, "- unrecorded outcomes: {}", self.unrecorded)?;
        }
        write!(
            f,
            "- reclaimed: {}, promoted: {} scheduled / {} retry, took {}ms",
            self.reclaimed, self.promoted_scheduled, self.promoted_retry, self.duration_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_top_errors_by_frequency() {
        let start = Utc::now();
        let mut builder = SummaryBuilder::new("p1", start);
        builder.attempted(9);
        for _ in 0..3 {
            builder.outcome(QueueStatus::Retry, Some("timeout"));
        }
        builder.outcome(QueueStatus::Failed, Some("rejected"));
        builder.outcome(QueueStatus::Retry, Some("refused"));
        builder.outcome(QueueStatus::Retry, Some("refused"));
        builder.outcome(QueueStatus::Retry, Some("reset"));
        builder.outcome(QueueStatus::Sent, None);
        builder.lock_conflict();

        let summary = builder.finish(start);
        assert_eq!(summary.processed(), 8);
        assert_eq!(summary.retried, 6);
        assert_eq!(
            summary.top_errors,
            vec![
                ("timeout".to_string(), 3),
                ("refused".to_string(), 2),
                ("rejected".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_display() {
        let summary = CycleSummary {
            processor_id: "host-1-abcd".to_string(),
            attempted: 4,
            sent: 3,
            failed: 1,
            top_errors: vec![("boom".to_string(), 1)],
            ..CycleSummary::default()
        };

        assert_eq!(
            summary.to_string(),
            "Dispatch cycle summary (host-1-abcd):\n\
             - processed: 4 of 4 attempted\n\
             - sent: 3 (75.0%)\n\
             - failed: 1 (25.0%)\n\
             - top errors:\n  \
             * boom (1)\n\
             - reclaimed: 0, promoted: 0 scheduled / 0 retry, took 0ms"
        );
    }
}
