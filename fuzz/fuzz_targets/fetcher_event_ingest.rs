#![no_main]

use std::time::{Duration, Instant};

use libfuzzer_sys::fuzz_target;
use sluice_core::{ItemHash, ItemKind, PeerId, ITEM_KIND_BLOB, ITEM_KIND_LEGACY};
use sluice_node::{AdmissionOutcome, AnnouncedItem, Fetcher, FetcherConfig, PoolItem};
use sluice_transport::{InMemoryDisconnector, InMemoryTransport};

#[derive(Debug, Clone, Copy)]
struct Tx(u8);

impl PoolItem for Tx {
    fn hash(&self) -> ItemHash {
        ItemHash([self.0; 32])
    }
    fn kind(&self) -> ItemKind {
        if self.0 % 4 == 0 {
            ITEM_KIND_BLOB
        } else {
            ITEM_KIND_LEGACY
        }
    }
    fn size(&self) -> usize {
        64 + self.0 as usize
    }
}

fn outcome(byte: u8) -> AdmissionOutcome {
    match byte % 5 {
        0 => AdmissionOutcome::Accepted,
        1 => AdmissionOutcome::Duplicate,
        2 => AdmissionOutcome::Underpriced,
        3 => AdmissionOutcome::Invalid,
        _ => AdmissionOutcome::OtherReject,
    }
}

// Each input byte pair is one event: (opcode, argument).
fuzz_target!(|data: &[u8]| {
    let cfg = FetcherConfig {
        max_announces_per_peer: 16,
        max_request_hashes: 3,
        max_inflight_requests: 4,
        max_requests_per_peer: 1,
        add_batch_size: 2,
        max_validation_workers: 2,
        max_pending_items_per_peer: 8,
        admitted_cache_size: 16,
        underpriced_cache_size: 8,
        peer_record_cache_size: 4,
        ..FetcherConfig::for_local()
    };
    let transport = InMemoryTransport::default();
    let Ok(mut fetcher) = Fetcher::<Tx, _, _>::new(
        cfg,
        transport.clone(),
        InMemoryDisconnector::default(),
    ) else {
        return;
    };
    let peers: Vec<PeerId> = (0..4).map(|i| PeerId::new(format!("fz-{i}"))).collect();
    let mut running = Vec::new();
    let mut now = Instant::now();

    for pair in data.chunks_exact(2) {
        let (op, arg) = (pair[0], pair[1]);
        let peer = &peers[(op >> 4) as usize % peers.len()];
        let hash_byte = arg % 32;
        match op % 8 {
            0 => {
                let items: Vec<AnnouncedItem> = (0..(arg >> 5) + 1)
                    .map(|k| {
                        let tx = Tx(hash_byte.wrapping_add(k) % 32);
                        AnnouncedItem {
                            hash: tx.hash(),
                            size: tx.size(),
                            kind: tx.kind(),
                        }
                    })
                    .collect();
                fetcher.announce(peer, &items, now);
            }
            1 => {
                fetcher.schedule(now);
            }
            2 => {
                for (to, hashes) in transport.take_sent() {
                    let keep = arg as usize % (hashes.len() + 1);
                    let items = hashes.iter().take(keep).map(|h| Tx(h.0[0])).collect();
                    fetcher.deliver(&to, items, true);
                }
            }
            3 => {
                fetcher.deliver(peer, vec![Tx(hash_byte), Tx(hash_byte / 2)], arg & 1 == 0);
            }
            4 => {
                running.extend(fetcher.next_jobs(now));
                if let Some(job) = running.pop() {
                    let n = job.items.len();
                    let outcomes = (0..n).map(|i| outcome(arg.wrapping_add(i as u8))).collect();
                    fetcher.complete_job(job.id, outcomes, now);
                }
            }
            5 => {
                transport.set_failing(peer.clone(), arg & 1 == 1);
            }
            6 => fetcher.disconnect_peer(peer),
            _ => {
                now += Duration::from_millis(u64::from(arg) * 8);
                fetcher.tick(now);
            }
        }
        if let Err(err) = fetcher.state().check_invariants() {
            panic!("invariant broken: {err}");
        }
    }

    for job in running {
        let outcomes = vec![AdmissionOutcome::Invalid; job.items.len()];
        fetcher.complete_job(job.id, outcomes, now);
    }
    if let Err(err) = fetcher.state().check_invariants() {
        panic!("invariant broken after drain: {err}");
    }
});
