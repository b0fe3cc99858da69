use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use sluice_core::{ItemHash, ItemKind, PeerId};
use sluice_transport::{PeerDisconnector, RequestTransport};
use tracing::{debug, warn};

use crate::announce::{
    announce, finish_validation, purge_peer_announcements, release_validation, AnnouncedItem,
};
use crate::batch::{PendingItem, ValidationQueue};
use crate::config::FetcherConfig;
use crate::deliver::reconcile;
use crate::error::FetcherError;
use crate::policy::{AbusePolicy, WindowedAbusePolicy};
use crate::schedule::{expired_requests, fail_request, plan_requests, release_request};
use crate::sink::{run_admission, AdmissionOutcome, AdmissionSink, PoolItem, RejectClassifier};
use crate::state::{DeliveryId, FetcherState, HashStatus, JobId};
use crate::stats::FetcherStats;

/// One admission sink call handed to a worker.
#[derive(Debug)]
pub struct ValidationJob<I> {
    pub id: JobId,
    pub peer: PeerId,
    pub items: Vec<I>,
}

/// Final per-item outcomes of one `deliver` call, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub id: DeliveryId,
    pub peer: PeerId,
    pub outcomes: Vec<AdmissionOutcome>,
}

#[derive(Debug)]
struct JobEntry {
    delivery: DeliveryId,
    index: usize,
    hash: ItemHash,
    kind: ItemKind,
}

#[derive(Debug)]
struct InFlightJob {
    peer: PeerId,
    entries: Vec<JobEntry>,
}

#[derive(Debug)]
struct PendingDelivery {
    peer: PeerId,
    outcomes: Vec<Option<AdmissionOutcome>>,
    remaining: usize,
}

/// Deterministic fetcher core.
///
/// Owns every tracking table and is driven one event at a time: announce,
/// deliver, disconnect, tick, and job completion. Sink work is handed out as
/// [`ValidationJob`]s and reported back through [`Fetcher::complete_job`],
/// which lets the caller run it anywhere.
pub struct Fetcher<I, T, D, P = WindowedAbusePolicy> {
    config: FetcherConfig,
    state: FetcherState,
    transport: T,
    disconnector: D,
    policy: P,
    stats: FetcherStats,
    queues: HashMap<PeerId, ValidationQueue<I>>,
    /// Peers with queued items, served round-robin.
    ready: VecDeque<PeerId>,
    busy: HashSet<PeerId>,
    jobs: HashMap<JobId, InFlightJob>,
    deliveries: HashMap<DeliveryId, PendingDelivery>,
    completed: Vec<DeliveryReport>,
    next_delivery: u64,
    next_job: u64,
}

impl<I, T, D> Fetcher<I, T, D>
where
    I: PoolItem,
    T: RequestTransport,
    D: PeerDisconnector,
{
    /// Creates a fetcher with the default windowed abuse policy.
    pub fn new(config: FetcherConfig, transport: T, disconnector: D) -> Result<Self, FetcherError> {
        let policy = WindowedAbusePolicy::new(config.abuse.clone(), config.peer_record_cache_size);
        Self::with_policy(config, transport, disconnector, policy)
    }
}

impl<I, T, D, P> Fetcher<I, T, D, P>
where
    I: PoolItem,
    T: RequestTransport,
    D: PeerDisconnector,
    P: AbusePolicy,
{
    /// Creates a fetcher with a custom abuse policy.
    pub fn with_policy(
        config: FetcherConfig,
        transport: T,
        disconnector: D,
        policy: P,
    ) -> Result<Self, FetcherError> {
        config.validate()?;
        Ok(Self {
            state: FetcherState::new(&config),
            config,
            transport,
            disconnector,
            policy,
            stats: FetcherStats::default(),
            queues: HashMap::new(),
            ready: VecDeque::new(),
            busy: HashSet::new(),
            jobs: HashMap::new(),
            deliveries: HashMap::new(),
            completed: Vec::new(),
            next_delivery: 0,
            next_job: 0,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Read-only view of the tracking tables.
    pub fn state(&self) -> &FetcherState {
        &self.state
    }

    /// Abuse policy in use.
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Request transport in use.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Records announcements from `peer`. Returns how many were accepted.
    pub fn announce(&mut self, peer: &PeerId, items: &[AnnouncedItem], now: Instant) -> usize {
        let summary = announce(&mut self.state, &self.config, peer, items, now);
        self.stats.announces_accepted += summary.accepted as u64;
        self.stats.announces_known += summary.known as u64;
        self.stats.announces_over_quota += summary.over_quota as u64;
        self.stats.announces_bad_metadata += summary.bad_metadata as u64;
        self.stats.announce_metadata_mismatches += summary.mismatched as u64;
        summary.accepted
    }

    /// Plans and transmits requests. Returns how many were handed to the
    /// transport; a transmit failure counts as an immediate timeout.
    pub fn schedule(&mut self, now: Instant) -> usize {
        let issued = plan_requests(&mut self.state, &self.config, now);
        let retry = self.config.retry_policy();
        let mut sent = 0;
        for req in issued {
            match self.transport.request(&req.peer, &req.hashes) {
                Ok(()) => {
                    sent += 1;
                    self.stats.requests_issued += 1;
                    self.stats.hashes_requested += req.hashes.len() as u64;
                }
                Err(err) => {
                    debug!("fetcher: request to {} failed: {}", req.peer, err);
                    self.stats.transmit_failures += 1;
                    let failed = fail_request(&mut self.state, &retry, req.id, now);
                    self.stats.hashes_given_up += failed.given_up.len() as u64;
                }
            }
        }
        sent
    }

    /// Fails every request past its deadline. Returns how many expired.
    pub fn sweep_timeouts(&mut self, now: Instant) -> usize {
        let expired = expired_requests(&self.state, &self.config, now);
        let retry = self.config.retry_policy();
        for id in &expired {
            let failed = fail_request(&mut self.state, &retry, *id, now);
            self.stats.request_timeouts += 1;
            self.stats.hashes_given_up += failed.given_up.len() as u64;
            if let Some(peer) = failed.peer {
                debug!(
                    "fetcher: request {} to {} timed out, {} hashes released",
                    id.0,
                    peer,
                    failed.released.len()
                );
            }
        }
        expired.len()
    }

    /// Periodic sweep followed by a scheduling pass.
    pub fn tick(&mut self, now: Instant) {
        self.sweep_timeouts(now);
        self.schedule(now);
    }

    /// Accepts a delivery. Items needing validation are queued for the
    /// peer; the rest are decided immediately. The report appears in
    /// [`Fetcher::take_completed`] once every item has an outcome.
    pub fn deliver(&mut self, peer: &PeerId, items: Vec<I>, solicited: bool) -> DeliveryId {
        self.next_delivery += 1;
        let id = DeliveryId(self.next_delivery);
        self.stats.deliveries += 1;
        self.stats.items_delivered += items.len() as u64;

        let queued = self.queues.get(peer).map_or(0, ValidationQueue::len);
        let r = reconcile(&mut self.state, &self.config, peer, items, solicited, queued);
        self.stats.unexpected_items += r.unexpected as u64;
        self.stats.duplicates_skipped += r.duplicates as u64;
        self.stats.dropped_items += r.dropped as u64;
        self.stats.hashes_released_missing += r.missing.len() as u64;

        if r.to_validate.is_empty() {
            self.completed.push(DeliveryReport {
                id,
                peer: peer.clone(),
                outcomes: finalize(r.outcomes),
            });
            return id;
        }

        self.deliveries.insert(
            id,
            PendingDelivery {
                peer: peer.clone(),
                outcomes: r.outcomes,
                remaining: r.to_validate.len(),
            },
        );
        if !self.queues.contains_key(peer) {
            self.ready.push_back(peer.clone());
        }
        let queue = self.queues.entry(peer.clone()).or_default();
        for (index, item) in r.to_validate {
            queue.enqueue(PendingItem {
                delivery: id,
                index,
                item,
            });
        }
        id
    }

    /// Hands out sub-batches for peers that are idle and not cooling down,
    /// up to the global worker cap.
    pub fn next_jobs(&mut self, now: Instant) -> Vec<ValidationJob<I>> {
        let limits = self.config.add_batch_limits();
        let mut out = Vec::new();
        let mut scanned = 0;
        let candidates = self.ready.len();

        while scanned < candidates && self.jobs.len() < self.config.max_validation_workers {
            scanned += 1;
            let Some(peer) = self.ready.pop_front() else {
                break;
            };
            let cooling = self
                .policy
                .cooldown_until(&peer)
                .is_some_and(|until| until > now);
            if self.busy.contains(&peer) || cooling {
                self.ready.push_back(peer);
                continue;
            }
            let Some(queue) = self.queues.get_mut(&peer) else {
                continue;
            };
            let batch = queue.drain_next_batch(limits);
            if queue.is_empty() {
                self.queues.remove(&peer);
            } else {
                self.ready.push_back(peer.clone());
            }
            if batch.is_empty() {
                continue;
            }

            self.next_job += 1;
            let id = JobId(self.next_job);
            let mut entries = Vec::with_capacity(batch.len());
            let mut items = Vec::with_capacity(batch.len());
            for pending in batch {
                entries.push(JobEntry {
                    delivery: pending.delivery,
                    index: pending.index,
                    hash: pending.item.hash(),
                    kind: pending.item.kind(),
                });
                items.push(pending.item);
            }
            self.stats.validation_jobs += 1;
            self.stats.items_validated += items.len() as u64;
            self.busy.insert(peer.clone());
            self.jobs.insert(
                id,
                InFlightJob {
                    peer: peer.clone(),
                    entries,
                },
            );
            out.push(ValidationJob { id, peer, items });
        }
        out
    }

    /// Records a finished sink call and feeds it to the abuse policy.
    ///
    /// Still applies when the peer disconnected while the job ran.
    pub fn complete_job(&mut self, id: JobId, outcomes: Vec<AdmissionOutcome>, now: Instant) {
        let Some(job) = self.jobs.remove(&id) else {
            warn!("fetcher: completion for unknown job {}", id.0);
            return;
        };
        self.busy.remove(&job.peer);

        let mut observed = Vec::with_capacity(job.entries.len());
        for (i, entry) in job.entries.iter().enumerate() {
            let outcome = outcomes
                .get(i)
                .copied()
                .unwrap_or(AdmissionOutcome::OtherReject);
            if outcome == AdmissionOutcome::Dropped {
                if release_validation(&mut self.state, &entry.hash, &job.peer) {
                    self.stats.hashes_given_up += 1;
                }
            } else {
                finish_validation(&mut self.state, &entry.hash);
            }
            match outcome {
                AdmissionOutcome::Accepted | AdmissionOutcome::Duplicate => {
                    self.state.admitted.put(entry.hash, ());
                }
                AdmissionOutcome::Underpriced => {
                    self.state.underpriced.put(entry.hash, ());
                }
                _ => {}
            }
            self.stats.record_outcome(outcome);
            observed.push((entry.kind, outcome));
            self.resolve_item(entry.delivery, entry.index, outcome);
        }

        let verdict = self.policy.observe(&job.peer, &observed, now);
        if let Some(until) = verdict.cooldown_until {
            self.stats.cooldowns += 1;
            debug!(
                "fetcher: cooling down {} for {:?}",
                job.peer,
                until.saturating_duration_since(now)
            );
        }
        if let Some(reason) = verdict.disconnect {
            self.stats.disconnect_signals += 1;
            warn!("fetcher: disconnecting {}: {}", job.peer, reason);
            self.disconnector.disconnect(&job.peer, &reason);
            self.disconnect_peer(&job.peer);
        }
    }

    /// Drains delivery reports whose items all have outcomes.
    pub fn take_completed(&mut self) -> Vec<DeliveryReport> {
        std::mem::take(&mut self.completed)
    }

    /// Forgets a peer: drops its queued items, releases its requests to
    /// other announcers and drops its announcements. Jobs already running
    /// are left alone.
    pub fn disconnect_peer(&mut self, peer: &PeerId) {
        let mut dropped = 0;
        let mut orphaned = 0;
        if let Some(mut queue) = self.queues.remove(peer) {
            for pending in queue.drain_all() {
                if release_validation(&mut self.state, &pending.item.hash(), peer) {
                    orphaned += 1;
                }
                self.resolve_item(pending.delivery, pending.index, AdmissionOutcome::Dropped);
                dropped += 1;
            }
        }
        self.stats.dropped_items += dropped as u64;
        self.ready.retain(|p| p != peer);

        let mut request_ids: Vec<_> = self
            .state
            .peers
            .get(peer)
            .map(|p| p.requests.iter().copied().collect())
            .unwrap_or_default();
        request_ids.sort_unstable();
        let mut released = 0;
        for id in request_ids {
            released += release_request(&mut self.state, id).len();
        }
        orphaned += purge_peer_announcements(&mut self.state, peer).len();
        self.stats.hashes_given_up += orphaned as u64;
        self.state.peers.remove(peer);

        debug!(
            "fetcher: peer {} gone, {} hashes released, {} orphaned, {} queued items dropped",
            peer, released, orphaned, dropped
        );
    }

    /// Runs every runnable job on the calling thread until none is left.
    ///
    /// Peers cooling down keep their queued items.
    pub fn drain_jobs_inline<S, C>(&mut self, sink: &S, classifier: &C, now: Instant) -> usize
    where
        S: AdmissionSink<Item = I>,
        C: RejectClassifier<S::Error>,
    {
        let mut ran = 0;
        loop {
            let jobs = self.next_jobs(now);
            if jobs.is_empty() {
                return ran;
            }
            for job in jobs {
                let outcomes = run_admission(sink, classifier, job.items);
                self.complete_job(job.id, outcomes, now);
                ran += 1;
            }
        }
    }

    /// Sink calls handed out and not yet completed.
    pub fn in_flight_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Items waiting for a sink call, across all peers.
    pub fn queued_items(&self) -> usize {
        self.queues.values().map(ValidationQueue::len).sum()
    }

    /// Whether any item is queued or being validated.
    pub fn has_pending_validation(&self) -> bool {
        !self.jobs.is_empty() || !self.queues.is_empty()
    }

    /// Counters plus current gauges.
    pub fn stats(&self) -> FetcherStats {
        let mut stats = self.stats.clone();
        stats.announced_hashes = self
            .state
            .hashes
            .values()
            .filter(|e| e.status == HashStatus::Announced)
            .count();
        stats.outstanding_requests = self.state.requests.len();
        stats.requested_hashes = self.state.requested_hash_count();
        stats.validating_hashes = self.state.validating.len();
        stats.tracked_peers = self.state.peers.len();
        stats.busy_workers = self.jobs.len();
        stats.queued_validation_items = self.queued_items();
        stats
    }

    fn resolve_item(&mut self, delivery: DeliveryId, index: usize, outcome: AdmissionOutcome) {
        let done = match self.deliveries.get_mut(&delivery) {
            Some(pending) => {
                if let Some(slot) = pending.outcomes.get_mut(index) {
                    if slot.is_none() {
                        *slot = Some(outcome);
                        pending.remaining = pending.remaining.saturating_sub(1);
                    }
                }
                pending.remaining == 0
            }
            None => false,
        };
        if done {
            if let Some(pending) = self.deliveries.remove(&delivery) {
                self.completed.push(DeliveryReport {
                    id: delivery,
                    peer: pending.peer,
                    outcomes: finalize(pending.outcomes),
                });
            }
        }
    }
}

fn finalize(outcomes: Vec<Option<AdmissionOutcome>>) -> Vec<AdmissionOutcome> {
    outcomes
        .into_iter()
        .map(|o| o.unwrap_or(AdmissionOutcome::Dropped))
        .collect()
}
