use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;
use sluice_core::{ItemHash, ItemKind, PeerId};

use crate::config::FetcherConfig;

/// Identifier of one outstanding request batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Identifier of one `deliver` call awaiting per-item outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryId(pub u64);

/// Identifier of one admission sink call dispatched to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

/// One peer's claim to hold an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcer {
    pub peer: PeerId,
    pub announced_at: Instant,
    /// Global announce sequence; breaks ties between equal instants.
    pub seq: u64,
}

/// Tracking status of a hash that is still being fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStatus {
    Announced,
    Requested(RequestId),
    /// A delivered copy is queued for or inside the admission sink.
    Validating,
}

/// Coarse lifecycle phase of a hash, as seen from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashPhase {
    Unknown,
    Announced,
    Requested,
    Validating,
    Admitted,
}

/// Per-hash fetch bookkeeping.
#[derive(Debug, Clone)]
pub struct HashEntry {
    /// Metadata from the first announcement; later mismatches are counted, not applied.
    pub kind: ItemKind,
    pub size: usize,
    /// Announcers ordered by announce time.
    pub announcers: Vec<Announcer>,
    pub status: HashStatus,
    /// Failed fetch attempts (timeouts and transmit failures).
    pub attempts: u32,
    /// Earliest instant the hash may be requested again.
    pub retry_after: Option<Instant>,
    /// Announce sequence of the first announcer; scheduling order.
    pub first_seq: u64,
}

impl HashEntry {
    /// Whether `peer` announced this hash.
    pub fn has_announcer(&self, peer: &PeerId) -> bool {
        self.announcers.iter().any(|a| &a.peer == peer)
    }

    /// Removes `peer` from the announcer list. Returns true if it was present.
    pub fn remove_announcer(&mut self, peer: &PeerId) -> bool {
        let before = self.announcers.len();
        self.announcers.retain(|a| &a.peer != peer);
        self.announcers.len() != before
    }

    /// Whether the hash may be requested at `now`.
    pub fn is_ready(&self, now: Instant) -> bool {
        self.status == HashStatus::Announced && self.retry_after.map_or(true, |t| t <= now)
    }
}

#[derive(Debug, Clone)]
pub struct OutstandingRequest {
    pub id: RequestId,
    pub peer: PeerId,
    /// Hashes still awaiting delivery; shrinks as other peers deliver them.
    pub hashes: Vec<ItemHash>,
    pub issued_at: Instant,
}

/// Per-connected-peer bookkeeping. Destroyed on disconnect.
///
/// Reject streaks and throttle times live in the abuse policy's records so
/// they outlive the connection.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub peer: PeerId,
    pub requests: HashSet<RequestId>,
    pub announced: HashSet<ItemHash>,
    pub timeouts: u32,
}

impl PeerState {
    /// Fresh state for a newly seen peer.
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            requests: HashSet::new(),
            announced: HashSet::new(),
            timeouts: 0,
        }
    }

    /// Requests to this peer still awaiting delivery.
    pub fn active_request_count(&self) -> usize {
        self.requests.len()
    }
}

/// Mutable tracking tables owned by the fetcher event loop.
#[derive(Debug)]
pub struct FetcherState {
    pub hashes: HashMap<ItemHash, HashEntry>,
    pub requests: HashMap<RequestId, OutstandingRequest>,
    pub peers: HashMap<PeerId, PeerState>,
    /// Hashes handed to the admission sink and not yet reported back.
    pub validating: HashSet<ItemHash>,
    pub admitted: LruCache<ItemHash, ()>,
    pub underpriced: LruCache<ItemHash, ()>,
    next_request_id: u64,
    next_seq: u64,
}

fn cache_capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

impl FetcherState {
    /// Empty tables sized from `config`.
    pub fn new(config: &FetcherConfig) -> Self {
        Self {
            hashes: HashMap::new(),
            requests: HashMap::new(),
            peers: HashMap::new(),
            validating: HashSet::new(),
            admitted: LruCache::new(cache_capacity(config.admitted_cache_size)),
            underpriced: LruCache::new(cache_capacity(config.underpriced_cache_size)),
            next_request_id: 0,
            next_seq: 0,
        }
    }

    /// Allocates a request id.
    pub fn next_request_id(&mut self) -> RequestId {
        self.next_request_id += 1;
        RequestId(self.next_request_id)
    }

    /// Allocates an announce sequence number.
    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// State of `peer`, created on first use.
    pub fn peer_mut(&mut self, peer: &PeerId) -> &mut PeerState {
        self.peers
            .entry(peer.clone())
            .or_insert_with(|| PeerState::new(peer.clone()))
    }

    /// True when announcements of `hash` should be ignored.
    pub fn is_known(&self, hash: &ItemHash) -> bool {
        self.admitted.contains(hash)
            || self.underpriced.contains(hash)
            || self.validating.contains(hash)
    }

    /// Lifecycle phase of `hash`.
    pub fn phase(&self, hash: &ItemHash) -> HashPhase {
        if self.validating.contains(hash) {
            return HashPhase::Validating;
        }
        if self.admitted.contains(hash) {
            return HashPhase::Admitted;
        }
        match self.hashes.get(hash).map(|e| e.status) {
            Some(HashStatus::Announced) => HashPhase::Announced,
            Some(HashStatus::Requested(_)) => HashPhase::Requested,
            Some(HashStatus::Validating) => HashPhase::Validating,
            None => HashPhase::Unknown,
        }
    }

    /// Hashes held by outstanding requests.
    pub fn requested_hash_count(&self) -> usize {
        self.requests.values().map(|r| r.hashes.len()).sum()
    }

    /// Checks cross-table consistency. Used by tests and the fuzz target.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut owners: HashMap<ItemHash, RequestId> = HashMap::new();
        for (id, req) in &self.requests {
            if req.hashes.is_empty() {
                return Err(format!("request {} is empty", id.0));
            }
            for hash in &req.hashes {
                if let Some(prev) = owners.insert(*hash, *id) {
                    return Err(format!(
                        "hash {hash:?} referenced by requests {} and {}",
                        prev.0, id.0
                    ));
                }
                match self.hashes.get(hash).map(|e| e.status) {
                    Some(HashStatus::Requested(owner)) if owner == *id => {}
                    other => {
                        return Err(format!(
                            "hash {hash:?} in request {} has status {other:?}",
                            id.0
                        ))
                    }
                }
            }
            match self.peers.get(&req.peer) {
                Some(p) if p.requests.contains(id) => {}
                _ => return Err(format!("request {} not linked to its peer", id.0)),
            }
        }
        for (hash, entry) in &self.hashes {
            let validating = entry.status == HashStatus::Validating;
            if entry.announcers.is_empty() && !validating {
                return Err(format!("hash {hash:?} tracked without announcers"));
            }
            if self.validating.contains(hash) != validating {
                return Err(format!(
                    "hash {hash:?} has status {:?} but validating set disagrees",
                    entry.status
                ));
            }
            if let HashStatus::Requested(id) = entry.status {
                if owners.get(hash) != Some(&id) {
                    return Err(format!("hash {hash:?} points at missing request {}", id.0));
                }
            }
            for a in &entry.announcers {
                match self.peers.get(&a.peer) {
                    Some(p) if p.announced.contains(hash) => {}
                    _ => return Err(format!("announcer {} of {hash:?} not linked", a.peer)),
                }
            }
        }
        for peer in self.peers.values() {
            for id in &peer.requests {
                if !self.requests.contains_key(id) {
                    return Err(format!("peer {} holds stale request {}", peer.peer, id.0));
                }
            }
            for hash in &peer.announced {
                match self.hashes.get(hash) {
                    Some(e) if e.has_announcer(&peer.peer) => {}
                    _ => return Err(format!("peer {} holds stale hash {hash:?}", peer.peer)),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use sluice_core::{ItemHash, PeerId, ITEM_KIND_LEGACY};

    use super::{Announcer, FetcherState, HashEntry, HashPhase, HashStatus};
    use crate::config::FetcherConfig;

    fn entry(peer: &str, now: Instant) -> HashEntry {
        HashEntry {
            kind: ITEM_KIND_LEGACY,
            size: 100,
            announcers: vec![Announcer {
                peer: PeerId::from(peer),
                announced_at: now,
                seq: 1,
            }],
            status: HashStatus::Announced,
            attempts: 0,
            retry_after: None,
            first_seq: 1,
        }
    }

    #[test]
    fn phase_prefers_validating_over_tables() {
        let mut state = FetcherState::new(&FetcherConfig::default());
        let h = ItemHash([1; 32]);
        assert_eq!(state.phase(&h), HashPhase::Unknown);

        state.validating.insert(h);
        assert_eq!(state.phase(&h), HashPhase::Validating);
        state.validating.remove(&h);

        state.admitted.put(h, ());
        assert_eq!(state.phase(&h), HashPhase::Admitted);
        assert!(state.is_known(&h));
    }

    #[test]
    fn ready_respects_retry_after() {
        let now = Instant::now();
        let mut e = entry("a", now);
        assert!(e.is_ready(now));
        e.retry_after = Some(now + Duration::from_millis(10));
        assert!(!e.is_ready(now));
        assert!(e.is_ready(now + Duration::from_millis(10)));
    }

    #[test]
    fn invariants_catch_unlinked_announcer() {
        let now = Instant::now();
        let mut state = FetcherState::new(&FetcherConfig::default());
        state.hashes.insert(ItemHash([2; 32]), entry("a", now));
        assert!(state.check_invariants().is_err());

        state
            .peer_mut(&PeerId::from("a"))
            .announced
            .insert(ItemHash([2; 32]));
        state
            .check_invariants()
            .expect("linked announcer should be consistent");
    }

    #[test]
    fn validating_entry_may_outlive_its_announcers() {
        let now = Instant::now();
        let mut state = FetcherState::new(&FetcherConfig::default());
        let h = ItemHash([3; 32]);
        let mut e = entry("a", now);
        e.announcers.clear();
        e.status = HashStatus::Validating;
        state.hashes.insert(h, e);
        assert!(state.check_invariants().is_err());

        state.validating.insert(h);
        state
            .check_invariants()
            .expect("validating entry without announcers should be consistent");
        assert_eq!(state.phase(&h), HashPhase::Validating);
    }

    #[test]
    fn remove_announcer_reports_presence() {
        let mut e = entry("a", Instant::now());
        assert!(!e.remove_announcer(&PeerId::from("b")));
        assert!(e.remove_announcer(&PeerId::from("a")));
        assert!(e.announcers.is_empty());
    }
}
