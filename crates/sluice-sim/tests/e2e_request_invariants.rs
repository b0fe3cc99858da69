use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};
use sluice_core::{ItemHash, PeerId};
use sluice_node::state::HashPhase;
use sluice_node::{AdmissionOutcome, FetcherConfig, PoolItem};
use sluice_sim::scenarios::{classify_sim_error, sim_fetcher, sim_peers, ScriptedSink, SimTx};

const STEPS: usize = 3_000;
const ID_SPACE: u64 = 64;

fn scripted(id: u64) -> SimTx {
    if id % 7 == 0 {
        SimTx::invalid(id)
    } else if id % 11 == 0 {
        SimTx::underpriced(id)
    } else {
        SimTx::valid(id)
    }
}

fn run_interleaving(seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let cfg = FetcherConfig {
        max_request_hashes: 6,
        max_inflight_requests: 8,
        max_requests_per_peer: 2,
        add_batch_size: 4,
        max_validation_workers: 3,
        admitted_cache_size: 1_024,
        ..FetcherConfig::for_local()
    };
    let (mut fetcher, transport, _disconnector) =
        sim_fetcher(cfg.clone()).expect("config should be valid");
    let sink = ScriptedSink::default();
    let peers = sim_peers(5);
    let mut ids: HashMap<ItemHash, u64> = HashMap::new();
    let mut in_flight: Vec<(PeerId, Vec<ItemHash>)> = Vec::new();
    let mut now = Instant::now();

    for step in 0..STEPS {
        let peer = peers.choose(&mut rng).expect("peers is non-empty").clone();
        match rng.gen_range(0..10) {
            0..=2 => {
                let batch: Vec<_> = (0..rng.gen_range(1..6))
                    .map(|_| scripted(rng.gen_range(0..ID_SPACE)))
                    .inspect(|tx| {
                        ids.insert(tx.hash(), tx.id);
                    })
                    .map(|tx| tx.announcement())
                    .collect();
                fetcher.announce(&peer, &batch, now);
            }
            3 => {
                fetcher.schedule(now);
            }
            4 | 5 if !in_flight.is_empty() => {
                let pick = rng.gen_range(0..in_flight.len());
                let (to, hashes) = in_flight.swap_remove(pick);
                let keep = rng.gen_range(0..=hashes.len());
                let items = hashes[..keep].iter().map(|h| scripted(ids[h])).collect();
                fetcher.deliver(&to, items, true);
            }
            6 => {
                let items = vec![scripted(rng.gen_range(0..ID_SPACE))];
                fetcher.deliver(&peer, items, false);
            }
            7 => {
                fetcher.drain_jobs_inline(&sink, &classify_sim_error, now);
            }
            8 if rng.gen_bool(0.1) => {
                fetcher.disconnect_peer(&peer);
                in_flight.retain(|(p, _)| p != &peer);
            }
            _ => {
                now += Duration::from_millis(rng.gen_range(0..400));
                fetcher.tick(now);
            }
        }

        for (to, hashes) in transport.take_sent() {
            for hash in &hashes {
                assert_eq!(
                    fetcher.state().phase(hash),
                    HashPhase::Requested,
                    "seed {seed:#x} step {step}: sent hash is not tracked as requested",
                );
                assert!(
                    !fetcher.state().admitted.contains(hash),
                    "seed {seed:#x} step {step}: admitted hash was requested",
                );
            }
            in_flight.push((to, hashes));
        }

        let mut per_hash: HashMap<ItemHash, usize> = HashMap::new();
        for req in fetcher.state().requests.values() {
            assert!(req.hashes.len() <= cfg.max_request_hashes);
            for hash in &req.hashes {
                *per_hash.entry(*hash).or_default() += 1;
            }
        }
        assert!(
            per_hash.values().all(|count| *count == 1),
            "seed {seed:#x} step {step}: a hash is in two outstanding requests",
        );
        assert!(fetcher.state().requests.len() <= cfg.max_inflight_requests);
        for p in fetcher.state().peers.values() {
            assert!(p.requests.len() <= cfg.max_requests_per_peer);
        }
        fetcher
            .state()
            .check_invariants()
            .unwrap_or_else(|err| panic!("seed {seed:#x} step {step}: {err}"));
    }

    // Cooldowns started during the drain need time to lapse.
    while fetcher.has_pending_validation() {
        now += Duration::from_secs(1);
        fetcher.drain_jobs_inline(&sink, &classify_sim_error, now);
    }
    assert!(fetcher.state().validating.is_empty());
}

#[test]
fn random_interleavings_keep_at_most_one_request_per_hash() {
    for seed in [0x5EED_CAFE_u64, 0xDEC0_DED, 0xBAD_5EED, 42] {
        run_interleaving(seed);
    }
}

#[test]
fn admitted_item_is_never_validated_twice() {
    let (mut fetcher, transport, _) =
        sim_fetcher(FetcherConfig::for_local()).expect("config should be valid");
    let sink = ScriptedSink::default();
    let now = Instant::now();
    let a = PeerId::from("a");
    let b = PeerId::from("b");
    let tx = SimTx::valid(1);

    assert_eq!(fetcher.announce(&a, &[tx.announcement()], now), 1);
    assert_eq!(fetcher.schedule(now), 1);
    assert_eq!(transport.take_sent(), vec![(a.clone(), vec![tx.hash()])]);

    fetcher.deliver(&a, vec![tx], true);
    fetcher.drain_jobs_inline(&sink, &classify_sim_error, now);
    assert_eq!(sink.calls(), 1);
    let first = fetcher.take_completed();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].outcomes, vec![AdmissionOutcome::Accepted]);

    fetcher.deliver(&b, vec![tx], false);
    fetcher.deliver(&a, vec![tx, tx], true);
    fetcher.drain_jobs_inline(&sink, &classify_sim_error, now);
    assert_eq!(sink.calls(), 1, "duplicates must not reach the sink");

    let reports = fetcher.take_completed();
    assert_eq!(reports.len(), 2);
    for report in reports {
        assert!(report
            .outcomes
            .iter()
            .all(|o| *o == AdmissionOutcome::Duplicate));
    }

    assert_eq!(fetcher.announce(&b, &[tx.announcement()], now), 0);
    assert_eq!(fetcher.schedule(now), 0);
    assert_eq!(fetcher.stats().announces_known, 1);
}

#[test]
fn concurrent_copy_of_validating_item_is_a_duplicate() {
    let (mut fetcher, _, _) =
        sim_fetcher(FetcherConfig::for_local()).expect("config should be valid");
    let sink = ScriptedSink::default();
    let now = Instant::now();
    let tx = SimTx::valid(9);

    fetcher.deliver(&PeerId::from("a"), vec![tx], false);
    let jobs = fetcher.next_jobs(now);
    assert_eq!(jobs.len(), 1);

    // Same item arrives from another peer while the first copy is in the sink.
    fetcher.deliver(&PeerId::from("b"), vec![tx], false);
    let reports = fetcher.take_completed();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcomes, vec![AdmissionOutcome::Duplicate]);

    for job in jobs {
        fetcher.complete_job(job.id, vec![AdmissionOutcome::Accepted], now);
    }
    assert_eq!(fetcher.drain_jobs_inline(&sink, &classify_sim_error, now), 0);
    assert_eq!(sink.calls(), 0);
    assert_eq!(fetcher.stats().outcomes_accepted, 1);
}
