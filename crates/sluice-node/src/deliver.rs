use std::collections::{BTreeSet, HashSet};

use sluice_core::{ItemHash, PeerId};
use tracing::debug;

use crate::announce::{mark_validating, remove_announcer};
use crate::config::FetcherConfig;
use crate::sink::{AdmissionOutcome, PoolItem};
use crate::state::{FetcherState, HashStatus, RequestId};

/// Result of matching one delivery against tracking state.
///
/// Items with an outcome already decided never reach the admission sink;
/// the rest are listed in `to_validate` with their position in the delivery.
#[derive(Debug)]
pub struct Reconciled<I> {
    pub outcomes: Vec<Option<AdmissionOutcome>>,
    pub to_validate: Vec<(usize, I)>,
    pub unexpected: usize,
    pub duplicates: usize,
    pub dropped: usize,
    pub resolved_requests: usize,
    /// Requested hashes the peer left out of its response.
    pub missing: Vec<ItemHash>,
}

/// Deduplicates a delivery, matches it against the peer's requests, and
/// moves items bound for validation into the validating set.
///
/// `queued_for_peer` is the number of items from this peer already waiting
/// for the sink; items past `max_pending_items_per_peer` are dropped.
pub fn reconcile<I: PoolItem>(
    state: &mut FetcherState,
    config: &FetcherConfig,
    peer: &PeerId,
    items: Vec<I>,
    solicited: bool,
    queued_for_peer: usize,
) -> Reconciled<I> {
    let mut out = Reconciled {
        outcomes: vec![None; items.len()],
        to_validate: Vec::new(),
        unexpected: 0,
        duplicates: 0,
        dropped: 0,
        resolved_requests: 0,
        missing: Vec::new(),
    };
    let mut seen: HashSet<ItemHash> = HashSet::with_capacity(items.len());
    let mut matched: BTreeSet<RequestId> = BTreeSet::new();
    let mut deferred: HashSet<ItemHash> = HashSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let hash = item.hash();
        if seen.contains(&hash) || state.admitted.contains(&hash) || state.validating.contains(&hash)
        {
            out.outcomes[index] = Some(AdmissionOutcome::Duplicate);
            out.duplicates += 1;
            continue;
        }
        if state.underpriced.contains(&hash) {
            out.outcomes[index] = Some(AdmissionOutcome::Underpriced);
            continue;
        }

        let requested_from = match state.hashes.get(&hash).map(|e| e.status) {
            Some(HashStatus::Requested(id))
                if state.requests.get(&id).is_some_and(|r| &r.peer == peer) =>
            {
                Some(id)
            }
            _ => None,
        };
        if requested_from.is_none() {
            if solicited {
                out.unexpected += 1;
                debug!("fetcher: unexpected item {:?} from {}", hash, peer);
            }
            if !config.unsolicited.admits(item.kind()) {
                out.outcomes[index] = Some(AdmissionOutcome::Dropped);
                out.dropped += 1;
                continue;
            }
        }

        if queued_for_peer + out.to_validate.len() >= config.max_pending_items_per_peer {
            out.outcomes[index] = Some(AdmissionOutcome::Dropped);
            out.dropped += 1;
            // Delivered, just not accepted now: the request keeps it until
            // it times out.
            if requested_from.is_some() {
                deferred.insert(hash);
            }
            continue;
        }
        if let Some(id) = requested_from {
            matched.insert(id);
        }

        seen.insert(hash);
        mark_validating(state, &hash);
        out.to_validate.push((index, item));
    }

    // Whatever a matched request still holds was not delivered: the peer
    // does not have it.
    for id in matched {
        // Fully delivered requests were already retired by mark_validating.
        let Some(req) = state.requests.get_mut(&id) else {
            out.resolved_requests += 1;
            continue;
        };
        let (kept, missing): (Vec<ItemHash>, Vec<ItemHash>) = std::mem::take(&mut req.hashes)
            .into_iter()
            .partition(|h| deferred.contains(h));
        req.hashes = kept;
        let owner = req.peer.clone();
        if req.hashes.is_empty() {
            out.resolved_requests += 1;
            state.requests.remove(&id);
            if let Some(p) = state.peers.get_mut(&owner) {
                p.requests.remove(&id);
            }
        }
        for hash in missing {
            if let Some(entry) = state.hashes.get_mut(&hash) {
                if entry.status == HashStatus::Requested(id) {
                    entry.status = HashStatus::Announced;
                }
            }
            remove_announcer(state, &hash, &owner);
            out.missing.push(hash);
        }
    }
    out
}
