use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use sluice_core::{ItemKind, PeerId};
use sluice_transport::DisconnectReason;

use crate::error::FetcherError;
use crate::sink::AdmissionOutcome;

/// Relative validation cost of one item kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KindCost {
    pub kind: ItemKind,
    pub cost: f64,
}

/// Tunable thresholds for [`WindowedAbusePolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbuseConfig {
    /// Per-batch share of expensive rejects above which a cooldown starts.
    pub cooldown_fraction: f64,
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// Cost-weighted reject ratio that must hold over `sustained_batches`.
    pub sustained_reject_threshold: f64,
    pub sustained_batches: usize,
    /// Kinds missing here weigh 1.0.
    pub kind_costs: Vec<KindCost>,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            cooldown_fraction: 0.25,
            cooldown: Duration::from_millis(200),
            sustained_reject_threshold: 0.10,
            sustained_batches: 8,
            kind_costs: Vec::new(),
        }
    }
}

impl AbuseConfig {
    /// Rejects thresholds outside `[0, 1]` and non-positive costs.
    pub fn validate(&self) -> Result<(), FetcherError> {
        if !(0.0..=1.0).contains(&self.cooldown_fraction) {
            return Err(FetcherError::InvalidConfig(
                "cooldown_fraction must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.sustained_reject_threshold) {
            return Err(FetcherError::InvalidConfig(
                "sustained_reject_threshold must be within [0, 1]",
            ));
        }
        if self.sustained_reject_threshold > self.cooldown_fraction {
            return Err(FetcherError::InvalidConfig(
                "sustained_reject_threshold must not exceed cooldown_fraction",
            ));
        }
        if self.sustained_batches == 0 {
            return Err(FetcherError::InvalidConfig("sustained_batches must be > 0"));
        }
        if self.kind_costs.iter().any(|k| k.cost <= 0.0 || !k.cost.is_finite()) {
            return Err(FetcherError::InvalidConfig("kind costs must be positive"));
        }
        Ok(())
    }

    /// Validation cost weight of `kind`; 1.0 unless configured.
    pub fn cost_of(&self, kind: ItemKind) -> f64 {
        self.kind_costs
            .iter()
            .find(|k| k.kind == kind)
            .map_or(1.0, |k| k.cost)
    }

    /// Largest expensive-reject count in a batch of `n` that does not cool down.
    pub fn cooldown_allowance(&self, n: usize) -> usize {
        (n as f64 * self.cooldown_fraction + 1e-9).floor() as usize
    }
}

/// Decision for one observed batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Verdict {
    /// Set when this batch started a cooldown.
    pub cooldown_until: Option<Instant>,
    /// Set when the peer should be penalized/disconnected.
    pub disconnect: Option<DisconnectReason>,
}

/// Abuse accounting that outlives the peer connection.
#[derive(Debug, Clone, Default)]
pub struct PeerRecord {
    /// Consecutive batches above the sustained threshold.
    pub reject_streak: usize,
    /// Cost-weighted ratios of the most recent batches.
    pub window: VecDeque<f64>,
    pub cooldown_until: Option<Instant>,
    pub last_throttle_at: Option<Instant>,
    pub batches: u64,
    pub expensive_rejects: u64,
    pub disconnects: u64,
}

impl PeerRecord {
    /// Mean reject ratio over the retained window.
    pub fn window_mean(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }
}

/// Policy interface for throttling and penalizing delivering peers.
pub trait AbusePolicy {
    /// Accounts one validated batch from `peer`.
    fn observe(
        &mut self,
        peer: &PeerId,
        batch: &[(ItemKind, AdmissionOutcome)],
        now: Instant,
    ) -> Verdict;

    /// Instant until which `peer`'s next batch must wait, if any.
    fn cooldown_until(&self, peer: &PeerId) -> Option<Instant>;
}

/// Sliding-window policy: a per-batch count rule for cooldowns and a
/// cost-weighted streak rule for disconnects.
#[derive(Debug)]
pub struct WindowedAbusePolicy {
    pub config: AbuseConfig,
    records: LruCache<PeerId, PeerRecord>,
}

impl WindowedAbusePolicy {
    /// Policy keeping at most `max_records` peer records.
    pub fn new(config: AbuseConfig, max_records: usize) -> Self {
        Self {
            config,
            records: LruCache::new(NonZeroUsize::new(max_records).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Abuse record of `peer`, if one is retained.
    pub fn record(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.records.peek(peer)
    }

    /// Number of retained peer records.
    pub fn tracked_records(&self) -> usize {
        self.records.len()
    }
}

impl AbusePolicy for WindowedAbusePolicy {
    fn observe(
        &mut self,
        peer: &PeerId,
        batch: &[(ItemKind, AdmissionOutcome)],
        now: Instant,
    ) -> Verdict {
        let mut verdict = Verdict::default();
        if batch.is_empty() {
            return verdict;
        }

        let mut expensive = 0usize;
        let mut expensive_cost = 0.0f64;
        let mut total_cost = 0.0f64;
        for (kind, outcome) in batch {
            let cost = self.config.cost_of(*kind);
            total_cost += cost;
            if outcome.is_expensive_reject() {
                expensive += 1;
                expensive_cost += cost;
            }
        }
        let ratio = if total_cost > 0.0 {
            expensive_cost / total_cost
        } else {
            0.0
        };

        if self.records.peek(peer).is_none() {
            self.records.put(peer.clone(), PeerRecord::default());
        }
        let Some(record) = self.records.get_mut(peer) else {
            return verdict;
        };
        record.batches += 1;
        record.expensive_rejects += expensive as u64;

        record.window.push_back(ratio);
        while record.window.len() > self.config.sustained_batches {
            record.window.pop_front();
        }

        if expensive > self.config.cooldown_allowance(batch.len()) {
            let until = now + self.config.cooldown;
            record.cooldown_until = Some(until);
            record.last_throttle_at = Some(now);
            verdict.cooldown_until = Some(until);
        }

        if ratio > self.config.sustained_reject_threshold {
            record.reject_streak += 1;
        } else {
            record.reject_streak = 0;
        }
        if record.reject_streak >= self.config.sustained_batches {
            verdict.disconnect = Some(DisconnectReason::SustainedRejects {
                ratio: record.window_mean(),
                batches: record.reject_streak,
            });
            record.reject_streak = 0;
            record.disconnects += 1;
        }
        verdict
    }

    fn cooldown_until(&self, peer: &PeerId) -> Option<Instant> {
        self.records.peek(peer).and_then(|r| r.cooldown_until)
    }
}
