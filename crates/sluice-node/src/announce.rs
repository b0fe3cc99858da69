use std::time::Instant;

use sluice_core::{ItemHash, ItemKind, PeerId};
use tracing::debug;

use crate::config::FetcherConfig;
use crate::state::{Announcer, FetcherState, HashEntry, HashStatus, RequestId};

/// One hash advertised by a peer, with its metadata hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnouncedItem {
    pub hash: ItemHash,
    pub size: usize,
    pub kind: ItemKind,
}

/// Per-call tally of how announced hashes were handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceSummary {
    pub accepted: usize,
    /// Already admitted, underpriced, validating, or announced by this peer.
    pub known: usize,
    pub over_quota: usize,
    pub bad_metadata: usize,
    /// Accepted, but metadata differs from the first announcement.
    pub mismatched: usize,
}

/// Records `peer` as an announcer of each item.
///
/// Hashes beyond the peer's quota are dropped silently; the quota frees as
/// hashes resolve.
pub fn announce(
    state: &mut FetcherState,
    config: &FetcherConfig,
    peer: &PeerId,
    items: &[AnnouncedItem],
    now: Instant,
) -> AnnounceSummary {
    let mut summary = AnnounceSummary::default();

    for item in items {
        if item.size > config.max_item_size {
            summary.bad_metadata += 1;
            continue;
        }
        if state.is_known(&item.hash) {
            summary.known += 1;
            continue;
        }
        let peer_state = state.peer_mut(peer);
        if peer_state.announced.contains(&item.hash) {
            summary.known += 1;
            continue;
        }
        if peer_state.announced.len() >= config.max_announces_per_peer {
            summary.over_quota += 1;
            continue;
        }
        peer_state.announced.insert(item.hash);

        let seq = state.next_seq();
        let announcer = Announcer {
            peer: peer.clone(),
            announced_at: now,
            seq,
        };
        match state.hashes.get_mut(&item.hash) {
            Some(entry) => {
                if entry.kind != item.kind || entry.size != item.size {
                    summary.mismatched += 1;
                }
                entry.announcers.push(announcer);
            }
            None => {
                state.hashes.insert(
                    item.hash,
                    HashEntry {
                        kind: item.kind,
                        size: item.size,
                        announcers: vec![announcer],
                        status: HashStatus::Announced,
                        attempts: 0,
                        retry_after: None,
                        first_seq: seq,
                    },
                );
            }
        }
        summary.accepted += 1;
    }

    if summary.over_quota > 0 {
        debug!(
            "fetcher: peer {} over announce quota, dropped {} hashes",
            peer, summary.over_quota
        );
    }
    summary
}

/// Removes `peer` as an announcer of `hash`. Returns true if the entry was
/// left without announcers and dropped.
///
/// The hash's request status is not touched; callers release requests first.
/// Entries still validating are kept even without announcers.
pub fn remove_announcer(state: &mut FetcherState, hash: &ItemHash, peer: &PeerId) -> bool {
    if let Some(p) = state.peers.get_mut(peer) {
        p.announced.remove(hash);
    }
    let orphaned = match state.hashes.get_mut(hash) {
        Some(entry) => {
            entry.remove_announcer(peer);
            entry.announcers.is_empty() && entry.status == HashStatus::Announced
        }
        None => false,
    };
    if orphaned {
        state.hashes.remove(hash);
    }
    orphaned
}

/// Stops tracking `hash` entirely, unlinking announcers and any request
/// that still references it.
pub fn forget_hash(state: &mut FetcherState, hash: &ItemHash) -> Option<HashEntry> {
    let entry = state.hashes.remove(hash)?;
    for a in &entry.announcers {
        if let Some(p) = state.peers.get_mut(&a.peer) {
            p.announced.remove(hash);
        }
    }
    if let HashStatus::Requested(id) = entry.status {
        detach_from_request(state, hash, id);
    }
    Some(entry)
}

/// Takes `hash` out of request `id`, dropping the request once it is empty.
fn detach_from_request(state: &mut FetcherState, hash: &ItemHash, id: RequestId) {
    let emptied = match state.requests.get_mut(&id) {
        Some(req) => {
            req.hashes.retain(|h| h != hash);
            req.hashes.is_empty()
        }
        None => false,
    };
    if emptied {
        if let Some(req) = state.requests.remove(&id) {
            if let Some(p) = state.peers.get_mut(&req.peer) {
                p.requests.remove(&id);
            }
        }
    }
}

/// Moves `hash` into the validating set. A tracked entry keeps its
/// announcers so the hash can be fetched again if the item never gets an
/// outcome; any request still holding it is retired.
pub fn mark_validating(state: &mut FetcherState, hash: &ItemHash) {
    state.validating.insert(*hash);
    let Some(entry) = state.hashes.get_mut(hash) else {
        return;
    };
    let previous = std::mem::replace(&mut entry.status, HashStatus::Validating);
    if let HashStatus::Requested(id) = previous {
        detach_from_request(state, hash, id);
    }
}

/// Ends validation of `hash` once the sink decided it: the entry is no
/// longer needed.
pub fn finish_validation(state: &mut FetcherState, hash: &ItemHash) {
    state.validating.remove(hash);
    forget_hash(state, hash);
}

/// Returns a hash whose item was dropped before validation to "announced",
/// without `peer` as an announcer. Returns true if no announcer is left and
/// the hash was dropped from tracking.
pub fn release_validation(state: &mut FetcherState, hash: &ItemHash, peer: &PeerId) -> bool {
    state.validating.remove(hash);
    match state.hashes.get_mut(hash) {
        Some(entry) if entry.status == HashStatus::Validating => {
            entry.status = HashStatus::Announced;
        }
        _ => return false,
    }
    remove_announcer(state, hash, peer)
}

/// Drops every announcement made by `peer`. Returns hashes left with no
/// announcer, which are no longer tracked.
pub fn purge_peer_announcements(state: &mut FetcherState, peer: &PeerId) -> Vec<ItemHash> {
    let announced: Vec<ItemHash> = match state.peers.get(peer) {
        Some(p) => p.announced.iter().copied().collect(),
        None => return Vec::new(),
    };
    let mut orphaned = Vec::new();
    for hash in announced {
        if remove_announcer(state, &hash, peer) {
            orphaned.push(hash);
        }
    }
    orphaned.sort();
    orphaned
}
