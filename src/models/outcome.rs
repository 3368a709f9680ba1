//! Per-attempt outcome records and cycle summaries.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::duration;

/// What happened when the scheduler attempted one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub domain: String,
    pub success: bool,
    /// Items returned by the adapter
    pub items_found: usize,
    /// Items left after duplicate suppression
    pub items_accepted: usize,
    /// Items the sink acknowledged
    pub items_published: usize,
    #[serde(with = "duration::millis")]
    pub duration: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ScrapeOutcome {
    pub fn success(
        domain: impl Into<String>,
        items_found: usize,
        items_accepted: usize,
        items_published: usize,
        duration: Duration,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            domain: domain.into(),
            success: true,
            items_found,
            items_accepted,
            items_published,
            duration,
            error: None,
            timestamp,
        }
    }

    pub fn failure(
        domain: impl Into<String>,
        error: impl Into<String>,
        duration: Duration,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            domain: domain.into(),
            success: false,
            items_found: 0,
            items_accepted: 0,
            items_published: 0,
            duration,
            error: Some(error.into()),
            timestamp,
        }
    }
}

/// Summary of one scheduling cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    /// Sources that were due (or forced) this cycle
    pub due: usize,
    /// Sources that passed admission and were fetched
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Sources skipped by rate limiting or a block
    pub deferred: usize,
    pub items_found: usize,
    pub items_accepted: usize,
    pub items_published: usize,
    #[serde(with = "duration::millis")]
    pub elapsed: Duration,
}

impl CycleReport {
    /// Fold one outcome into the totals.
    pub fn absorb(&mut self, outcome: &ScrapeOutcome) {
        self.attempted += 1;
        if outcome.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.items_found += outcome.items_found;
        self.items_accepted += outcome.items_accepted;
        self.items_published += outcome.items_published;
    }

    pub fn is_idle(&self) -> bool {
        self.due == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_absorbs_outcomes() {
        let now = Utc::now();
        let mut report = CycleReport::default();
        report.absorb(&ScrapeOutcome::success(
            "promobit.com.br",
            10,
            4,
            4,
            Duration::seconds(2),
            now,
        ));
        report.absorb(&ScrapeOutcome::failure(
            "pelando.com.br",
            "timed out after 30s",
            Duration::seconds(30),
            now,
        ));

        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.items_found, 10);
        assert_eq!(report.items_accepted, 4);
    }
}
