use std::time::Duration;

use serde::{Deserialize, Serialize};
use sluice_core::ItemKind;

use crate::batch::BatchLimits;
use crate::error::FetcherError;
use crate::policy::AbuseConfig;
use crate::schedule::RetryPolicy;

/// Default sub-batch size handed to the admission sink per call.
pub const DEFAULT_ADD_BATCH_SIZE: usize = 128;
/// Default byte cap of one sub-batch (largest protocol message).
pub const DEFAULT_ADD_BATCH_BYTES: usize = 10 * 1024 * 1024;

/// Whether items nobody asked for may reach the admission sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnsolicitedPolicy {
    /// Admit unrequested items at all.
    pub allow_unsolicited: bool,
    /// Kinds that are never validated unless explicitly requested.
    pub denied_kinds: Vec<ItemKind>,
}

impl Default for UnsolicitedPolicy {
    fn default() -> Self {
        Self {
            allow_unsolicited: true,
            denied_kinds: Vec::new(),
        }
    }
}

impl UnsolicitedPolicy {
    /// Returns true when an unrequested item of `kind` may be validated.
    pub fn admits(&self, kind: ItemKind) -> bool {
        self.allow_unsolicited && !self.denied_kinds.contains(&kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Hashes one peer may have announced and not yet resolved.
    pub max_announces_per_peer: usize,
    /// Announcements with a larger size hint are rejected as bad metadata.
    pub max_item_size: usize,
    /// Global fan-out limit on outstanding requests.
    pub max_inflight_requests: usize,
    /// Concurrent outstanding requests per peer.
    pub max_requests_per_peer: usize,
    /// Maximum hashes per request.
    pub max_request_hashes: usize,
    /// Soft byte cap per request, summed over size hints.
    pub max_request_bytes: usize,
    /// Deadline for a request to be answered.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// First per-hash backoff after a failed attempt; doubles per attempt.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Upper bound on per-hash backoff.
    #[serde(with = "humantime_serde")]
    pub max_retry_backoff: Duration,
    /// Failed attempts after which a hash is given up.
    pub max_fetch_attempts: u32,
    /// Timeouts after which a peer is only used as a last resort.
    pub slow_peer_timeouts: u32,
    /// Items per admission sink call.
    pub add_batch_size: usize,
    /// Byte cap per admission sink call; the first item always fits.
    pub add_batch_bytes: usize,
    /// Global cap on concurrently running admission calls.
    pub max_validation_workers: usize,
    /// Items one peer may have queued for validation.
    pub max_pending_items_per_peer: usize,
    /// Abuse mitigation thresholds.
    pub abuse: AbuseConfig,
    /// Handling of items that were never requested.
    pub unsolicited: UnsolicitedPolicy,
    /// Bounded memory of admitted hashes used for dedup.
    pub admitted_cache_size: usize,
    /// Bounded memory of underpriced hashes; re-announcements are ignored.
    pub underpriced_cache_size: usize,
    /// Abuse records retained across disconnects.
    pub peer_record_cache_size: usize,
    /// Runtime sweep/schedule period.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Capacity of the runtime's inbound event queue.
    pub command_queue_capacity: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_announces_per_peer: 4096,
            max_item_size: 1024 * 1024,
            max_inflight_requests: 256,
            max_requests_per_peer: 2,
            max_request_hashes: 256,
            max_request_bytes: 128 * 1024,
            request_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(250),
            max_retry_backoff: Duration::from_secs(5),
            max_fetch_attempts: 8,
            slow_peer_timeouts: 3,
            add_batch_size: DEFAULT_ADD_BATCH_SIZE,
            add_batch_bytes: DEFAULT_ADD_BATCH_BYTES,
            max_validation_workers: 64,
            max_pending_items_per_peer: 4096,
            abuse: AbuseConfig::default(),
            unsolicited: UnsolicitedPolicy::default(),
            admitted_cache_size: 65_536,
            underpriced_cache_size: 32_768,
            peer_record_cache_size: 16_384,
            tick_interval: Duration::from_millis(100),
            command_queue_capacity: 1024,
        }
    }
}

impl FetcherConfig {
    /// Create config optimized for low-latency local networks.
    pub fn for_local() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            retry_backoff: Duration::from_millis(50),
            max_retry_backoff: Duration::from_secs(1),
            tick_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    /// Create config for high-latency WANs.
    pub fn for_wan() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(30),
            ..Default::default()
        }
    }

    /// Rejects settings that would stall or disable the pipeline.
    pub fn validate(&self) -> Result<(), FetcherError> {
        if self.max_request_hashes == 0 {
            return Err(FetcherError::InvalidConfig("max_request_hashes must be > 0"));
        }
        if self.max_requests_per_peer == 0 || self.max_inflight_requests == 0 {
            return Err(FetcherError::InvalidConfig(
                "request concurrency limits must be > 0",
            ));
        }
        if self.add_batch_size == 0 {
            return Err(FetcherError::InvalidConfig("add_batch_size must be > 0"));
        }
        if self.max_validation_workers == 0 {
            return Err(FetcherError::InvalidConfig(
                "max_validation_workers must be > 0",
            ));
        }
        if self.max_fetch_attempts == 0 {
            return Err(FetcherError::InvalidConfig("max_fetch_attempts must be > 0"));
        }
        if self.admitted_cache_size == 0
            || self.underpriced_cache_size == 0
            || self.peer_record_cache_size == 0
        {
            return Err(FetcherError::InvalidConfig("cache sizes must be > 0"));
        }
        if self.tick_interval.is_zero() {
            return Err(FetcherError::InvalidConfig("tick_interval must be > 0"));
        }
        self.abuse.validate()
    }

    /// Returns per-hash retry policy derived from runtime config.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_backoff: self.retry_backoff,
            max_backoff: self.max_retry_backoff,
            max_attempts: self.max_fetch_attempts,
        }
    }

    /// Returns the sub-batch limits for admission sink calls.
    pub fn add_batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_items: self.add_batch_size,
            max_bytes: self.add_batch_bytes,
        }
    }
}
