use serde::{Deserialize, Serialize};

use crate::sink::AdmissionOutcome;

/// Fetcher counters plus point-in-time gauges.
///
/// Counters only grow; gauges are refreshed by
/// [`Fetcher::stats`](crate::fetcher::Fetcher::stats).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetcherStats {
    pub announces_accepted: u64,
    pub announces_known: u64,
    pub announces_over_quota: u64,
    pub announces_bad_metadata: u64,
    pub announce_metadata_mismatches: u64,
    pub requests_issued: u64,
    pub hashes_requested: u64,
    pub request_timeouts: u64,
    pub transmit_failures: u64,
    pub hashes_released_missing: u64,
    pub hashes_given_up: u64,
    pub deliveries: u64,
    pub items_delivered: u64,
    pub unexpected_items: u64,
    pub duplicates_skipped: u64,
    pub dropped_items: u64,
    pub validation_jobs: u64,
    pub items_validated: u64,
    pub outcomes_accepted: u64,
    pub outcomes_duplicate: u64,
    pub outcomes_underpriced: u64,
    pub outcomes_invalid: u64,
    pub outcomes_other: u64,
    pub sink_panics: u64,
    pub cooldowns: u64,
    pub disconnect_signals: u64,

    pub announced_hashes: usize,
    pub outstanding_requests: usize,
    pub requested_hashes: usize,
    pub validating_hashes: usize,
    pub tracked_peers: usize,
    pub busy_workers: usize,
    pub queued_validation_items: usize,
}

impl FetcherStats {
    /// Counts one validated item's outcome.
    pub fn record_outcome(&mut self, outcome: AdmissionOutcome) {
        match outcome {
            AdmissionOutcome::Accepted => self.outcomes_accepted += 1,
            AdmissionOutcome::Duplicate => self.outcomes_duplicate += 1,
            AdmissionOutcome::Underpriced => self.outcomes_underpriced += 1,
            AdmissionOutcome::Invalid => self.outcomes_invalid += 1,
            AdmissionOutcome::OtherReject => self.outcomes_other += 1,
            AdmissionOutcome::Dropped => self.dropped_items += 1,
        }
    }

    /// Expensive rejects observed so far.
    pub fn expensive_rejects(&self) -> u64 {
        self.outcomes_invalid + self.outcomes_other
    }
}
