use std::collections::HashMap;
use std::time::{Duration, Instant};

use sluice_core::{ItemHash, PeerId};

use crate::announce::forget_hash;
use crate::config::FetcherConfig;
use crate::state::{FetcherState, HashStatus, OutstandingRequest, RequestId};

/// Per-hash exponential backoff after failed fetch attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before a hash with `attempts` failures may be requested again.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let shift = (attempts - 1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    /// Whether a hash with `attempts` failures should be given up.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// A request the fetcher must hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedRequest {
    pub id: RequestId,
    pub peer: PeerId,
    pub hashes: Vec<ItemHash>,
}

/// Hashes a failed request put back into circulation, and hashes it dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailedRequest {
    pub peer: Option<PeerId>,
    pub released: Vec<ItemHash>,
    pub given_up: Vec<ItemHash>,
}

struct Draft {
    peer: PeerId,
    hashes: Vec<ItemHash>,
    bytes: usize,
}

/// Assigns ready hashes to announcers and records the resulting requests.
///
/// Hashes are visited in first-announce order. Among eligible announcers the
/// peer with the fewest outstanding requests wins, then the earliest
/// announcement; peers with repeated timeouts are only used when nobody
/// else is eligible.
pub fn plan_requests(
    state: &mut FetcherState,
    config: &FetcherConfig,
    now: Instant,
) -> Vec<IssuedRequest> {
    let mut global_free = config
        .max_inflight_requests
        .saturating_sub(state.requests.len());
    if global_free == 0 {
        return Vec::new();
    }

    let mut ready: Vec<(u64, ItemHash)> = state
        .hashes
        .iter()
        .filter(|(_, e)| e.is_ready(now))
        .map(|(h, e)| (e.first_seq, *h))
        .collect();
    ready.sort_unstable();

    let mut drafts: Vec<Draft> = Vec::new();
    let mut open: HashMap<PeerId, usize> = HashMap::new();
    let mut new_per_peer: HashMap<PeerId, usize> = HashMap::new();

    for (_, hash) in ready {
        let Some(entry) = state.hashes.get(&hash) else {
            continue;
        };
        let size = entry.size;

        let mut best: Option<((bool, usize, u64), &PeerId, bool)> = None;
        for a in &entry.announcers {
            let Some(peer) = state.peers.get(&a.peer) else {
                continue;
            };
            let fresh = new_per_peer.get(&a.peer).copied().unwrap_or(0);
            let joins_open = open.get(&a.peer).is_some_and(|&i| {
                let d = &drafts[i];
                d.hashes.len() < config.max_request_hashes
                    && d.bytes + size <= config.max_request_bytes
            });
            let can_open = global_free > 0
                && peer.active_request_count() + fresh < config.max_requests_per_peer;
            if !joins_open && !can_open {
                continue;
            }
            let key = (
                peer.timeouts >= config.slow_peer_timeouts,
                peer.active_request_count() + fresh,
                a.seq,
            );
            if best.as_ref().map_or(true, |(k, _, _)| key < *k) {
                best = Some((key, &a.peer, joins_open));
            }
        }
        let Some((_, peer, joins_open)) = best else {
            continue;
        };
        let peer = peer.clone();

        if joins_open {
            if let Some(&i) = open.get(&peer) {
                drafts[i].hashes.push(hash);
                drafts[i].bytes += size;
                continue;
            }
        }
        open.insert(peer.clone(), drafts.len());
        drafts.push(Draft {
            peer: peer.clone(),
            hashes: vec![hash],
            bytes: size,
        });
        *new_per_peer.entry(peer).or_insert(0) += 1;
        global_free -= 1;
    }

    let mut issued = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let id = state.next_request_id();
        for hash in &draft.hashes {
            if let Some(entry) = state.hashes.get_mut(hash) {
                entry.status = HashStatus::Requested(id);
            }
        }
        state.peer_mut(&draft.peer).requests.insert(id);
        state.requests.insert(
            id,
            OutstandingRequest {
                id,
                peer: draft.peer.clone(),
                hashes: draft.hashes.clone(),
                issued_at: now,
            },
        );
        issued.push(IssuedRequest {
            id,
            peer: draft.peer,
            hashes: draft.hashes,
        });
    }
    issued
}

/// Requests whose delivery deadline has passed, oldest first.
pub fn expired_requests(
    state: &FetcherState,
    config: &FetcherConfig,
    now: Instant,
) -> Vec<RequestId> {
    let mut expired: Vec<RequestId> = state
        .requests
        .values()
        .filter(|r| now.saturating_duration_since(r.issued_at) >= config.request_timeout)
        .map(|r| r.id)
        .collect();
    expired.sort_unstable();
    expired
}

/// Fails a request after a timeout or transmit error.
///
/// The peer loses its announcement of every hash in the batch and gains a
/// timeout. Each hash backs off before it is tried against another
/// announcer, or is given up once attempts or announcers run out.
pub fn fail_request(
    state: &mut FetcherState,
    policy: &RetryPolicy,
    id: RequestId,
    now: Instant,
) -> FailedRequest {
    let Some(req) = state.requests.remove(&id) else {
        return FailedRequest::default();
    };
    if let Some(p) = state.peers.get_mut(&req.peer) {
        p.requests.remove(&id);
        p.timeouts = p.timeouts.saturating_add(1);
    }

    let mut out = FailedRequest {
        peer: Some(req.peer.clone()),
        ..FailedRequest::default()
    };
    for hash in req.hashes {
        let give_up = match state.hashes.get_mut(&hash) {
            Some(entry) if entry.status == HashStatus::Requested(id) => {
                entry.remove_announcer(&req.peer);
                if let Some(p) = state.peers.get_mut(&req.peer) {
                    p.announced.remove(&hash);
                }
                entry.status = HashStatus::Announced;
                entry.attempts = entry.attempts.saturating_add(1);
                entry.retry_after = Some(now + policy.backoff(entry.attempts));
                policy.exhausted(entry.attempts) || entry.announcers.is_empty()
            }
            _ => continue,
        };
        if give_up {
            forget_hash(state, &hash);
            out.given_up.push(hash);
        } else {
            out.released.push(hash);
        }
    }
    out
}

/// Returns a request's hashes to "announced" without penalty. Used when the
/// requested peer goes away.
pub fn release_request(state: &mut FetcherState, id: RequestId) -> Vec<ItemHash> {
    let Some(req) = state.requests.remove(&id) else {
        return Vec::new();
    };
    if let Some(p) = state.peers.get_mut(&req.peer) {
        p.requests.remove(&id);
    }
    let mut released = Vec::with_capacity(req.hashes.len());
    for hash in req.hashes {
        if let Some(entry) = state.hashes.get_mut(&hash) {
            if entry.status == HashStatus::Requested(id) {
                entry.status = HashStatus::Announced;
                released.push(hash);
            }
        }
    }
    released
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use sluice_core::{ItemHash, PeerId, ITEM_KIND_LEGACY};

    use super::{expired_requests, fail_request, plan_requests, release_request, RetryPolicy};
    use crate::announce::{announce, AnnouncedItem};
    use crate::config::FetcherConfig;
    use crate::state::{FetcherState, HashPhase, HashStatus};

    fn items(range: std::ops::Range<u8>, size: usize) -> Vec<AnnouncedItem> {
        range
            .map(|b| AnnouncedItem {
                hash: ItemHash([b; 32]),
                size,
                kind: ITEM_KIND_LEGACY,
            })
            .collect()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            max_attempts: 3,
        };
        assert_eq!(p.backoff(0), Duration::ZERO);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(350));
        assert_eq!(p.backoff(40), Duration::from_millis(350));
        assert!(!p.exhausted(2));
        assert!(p.exhausted(3));
    }

    #[test]
    fn plan_respects_batch_and_peer_limits() {
        let cfg = FetcherConfig {
            max_request_hashes: 4,
            max_requests_per_peer: 2,
            ..FetcherConfig::default()
        };
        let mut state = FetcherState::new(&cfg);
        let now = Instant::now();
        announce(&mut state, &cfg, &PeerId::from("a"), &items(1..11, 10), now);

        let issued = plan_requests(&mut state, &cfg, now);
        assert_eq!(issued.len(), 2);
        assert!(issued.iter().all(|r| r.hashes.len() == 4));
        assert_eq!(state.requests.len(), 2);
        state.check_invariants().expect("tables consistent");

        // Peer is saturated; remaining hashes wait.
        assert!(plan_requests(&mut state, &cfg, now).is_empty());
        assert_eq!(state.phase(&ItemHash([10; 32])), HashPhase::Announced);
    }

    #[test]
    fn plan_honors_byte_cap_but_always_fits_one() {
        let cfg = FetcherConfig {
            max_request_bytes: 1000,
            max_requests_per_peer: 8,
            ..FetcherConfig::default()
        };
        let mut state = FetcherState::new(&cfg);
        let now = Instant::now();
        announce(&mut state, &cfg, &PeerId::from("a"), &items(1..4, 600), now);
        announce(&mut state, &cfg, &PeerId::from("a"), &items(9..10, 5000), now);

        let issued = plan_requests(&mut state, &cfg, now);
        assert_eq!(issued.len(), 4);
        assert!(issued.iter().all(|r| r.hashes.len() == 1));
    }

    #[test]
    fn plan_spreads_load_across_announcers() {
        let cfg = FetcherConfig {
            max_request_hashes: 1,
            max_requests_per_peer: 4,
            ..FetcherConfig::default()
        };
        let mut state = FetcherState::new(&cfg);
        let now = Instant::now();
        for p in ["a", "b"] {
            announce(&mut state, &cfg, &PeerId::from(p), &items(1..5, 10), now);
        }
        let issued = plan_requests(&mut state, &cfg, now);
        assert_eq!(issued.len(), 4);
        let to_a = issued.iter().filter(|r| r.peer.as_str() == "a").count();
        assert_eq!(to_a, 2);
        state.check_invariants().expect("one request per hash");
    }

    #[test]
    fn plan_respects_global_inflight_cap() {
        let cfg = FetcherConfig {
            max_inflight_requests: 3,
            ..FetcherConfig::default()
        };
        let mut state = FetcherState::new(&cfg);
        let now = Instant::now();
        for b in 1..=6u8 {
            let peer = PeerId::new(format!("p{b}"));
            announce(&mut state, &cfg, &peer, &items(b..b + 1, 10), now);
        }
        assert_eq!(plan_requests(&mut state, &cfg, now).len(), 3);
        assert!(plan_requests(&mut state, &cfg, now).is_empty());
    }

    #[test]
    fn slow_peer_is_last_resort() {
        let cfg = FetcherConfig {
            slow_peer_timeouts: 1,
            ..FetcherConfig::default()
        };
        let mut state = FetcherState::new(&cfg);
        let now = Instant::now();
        let slow = PeerId::from("slow");
        announce(&mut state, &cfg, &slow, &items(1..2, 10), now);
        announce(&mut state, &cfg, &PeerId::from("fast"), &items(1..2, 10), now);
        state.peer_mut(&slow).timeouts = 1;

        let issued = plan_requests(&mut state, &cfg, now);
        assert_eq!(issued[0].peer, PeerId::from("fast"));
    }

    #[test]
    fn timeout_moves_hash_to_next_announcer_after_backoff() {
        let cfg = FetcherConfig::default();
        let mut state = FetcherState::new(&cfg);
        let now = Instant::now();
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        announce(&mut state, &cfg, &a, &items(1..2, 10), now);
        announce(&mut state, &cfg, &b, &items(1..2, 10), now);

        let issued = plan_requests(&mut state, &cfg, now);
        assert_eq!(issued[0].peer, a);

        let later = now + cfg.request_timeout;
        let expired = expired_requests(&state, &cfg, later);
        assert_eq!(expired, vec![issued[0].id]);
        let failed = fail_request(&mut state, &cfg.retry_policy(), expired[0], later);
        assert_eq!(failed.released, vec![ItemHash([1; 32])]);
        assert_eq!(state.peers[&a].timeouts, 1);
        state.check_invariants().expect("tables consistent");

        assert!(plan_requests(&mut state, &cfg, later).is_empty());
        let retry_at = later + cfg.retry_backoff;
        let reissued = plan_requests(&mut state, &cfg, retry_at);
        assert_eq!(reissued[0].peer, b);
        assert_eq!(reissued[0].hashes, vec![ItemHash([1; 32])]);
    }

    #[test]
    fn failure_gives_up_without_announcers() {
        let cfg = FetcherConfig::default();
        let mut state = FetcherState::new(&cfg);
        let now = Instant::now();
        announce(&mut state, &cfg, &PeerId::from("a"), &items(1..2, 10), now);
        let issued = plan_requests(&mut state, &cfg, now);

        let failed = fail_request(&mut state, &cfg.retry_policy(), issued[0].id, now);
        assert_eq!(failed.given_up, vec![ItemHash([1; 32])]);
        assert_eq!(state.phase(&ItemHash([1; 32])), HashPhase::Unknown);
        state.check_invariants().expect("tables consistent");
    }

    #[test]
    fn release_keeps_announcer_and_attempts() {
        let cfg = FetcherConfig::default();
        let mut state = FetcherState::new(&cfg);
        let now = Instant::now();
        announce(&mut state, &cfg, &PeerId::from("a"), &items(1..2, 10), now);
        let issued = plan_requests(&mut state, &cfg, now);

        let released = release_request(&mut state, issued[0].id);
        assert_eq!(released.len(), 1);
        let entry = &state.hashes[&ItemHash([1; 32])];
        assert_eq!(entry.status, HashStatus::Announced);
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.announcers.len(), 1);
    }
}
