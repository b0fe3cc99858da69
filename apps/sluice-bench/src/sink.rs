use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sluice_core::hash::item_hash;
use sluice_core::{ItemHash, ItemKind};
use sluice_node::{AdmissionSink, PoolItem, RejectClass};

use crate::config::BenchConfig;

/// Synthetic transaction. Invalid ones model a well-formed item whose proof
/// only fails after the full validation cost has been paid.
#[derive(Debug, Clone, Copy)]
pub struct BenchTx {
    pub nonce: u64,
    pub kind: ItemKind,
    pub size: usize,
    pub invalid: bool,
    hash: ItemHash,
}

impl BenchTx {
    /// Builds an item whose hash covers its nonce and kind.
    pub fn new(nonce: u64, kind: ItemKind, size: usize, invalid: bool) -> Self {
        let mut encoded = [0_u8; 9];
        encoded[..8].copy_from_slice(&nonce.to_be_bytes());
        encoded[8] = kind.0;
        Self {
            nonce,
            kind,
            size,
            invalid,
            hash: item_hash(&encoded),
        }
    }
}

impl PoolItem for BenchTx {
    fn hash(&self) -> ItemHash {
        self.hash
    }
    fn kind(&self) -> ItemKind {
        self.kind
    }
    fn size(&self) -> usize {
        self.size
    }
}

/// Distinct items the flooders cycle through. The first `invalid_percent`
/// of every hundred nonces are invalid.
pub fn build_corpus(cfg: &BenchConfig) -> Vec<BenchTx> {
    let kind = ItemKind(cfg.item_kind);
    (0..cfg.effective_corpus_size() as u64)
        .map(|nonce| {
            let invalid = nonce % 100 < u64::from(cfg.invalid_percent);
            BenchTx::new(nonce, kind, cfg.item_size, invalid)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchReject {
    BadProof,
}

/// Every bench reject is a failed proof.
pub fn classify_bench_reject(err: &BenchReject) -> RejectClass {
    match err {
        BenchReject::BadProof => RejectClass::Invalid,
    }
}

#[derive(Debug, Default)]
struct Counters {
    validations: AtomicU64,
    failures: AtomicU64,
}

/// Sink that spends `rounds` BLAKE3 compressions per item before deciding.
#[derive(Debug, Clone)]
pub struct BenchSink {
    rounds: u32,
    counters: Arc<Counters>,
}

impl BenchSink {
    /// Sink spending `rounds` compressions per item.
    pub fn new(rounds: u32) -> Self {
        Self {
            rounds,
            counters: Arc::default(),
        }
    }

    /// Items validated so far.
    pub fn validations(&self) -> u64 {
        self.counters.validations.load(Ordering::Relaxed)
    }

    /// Items that failed validation so far.
    pub fn failures(&self) -> u64 {
        self.counters.failures.load(Ordering::Relaxed)
    }

    /// Runs the per-item validation work and returns whether it passed.
    pub fn validate(&self, tx: &BenchTx) -> bool {
        let mut digest = *tx.hash.as_bytes();
        for _ in 0..self.rounds {
            digest = *blake3::hash(&digest).as_bytes();
        }
        std::hint::black_box(digest);
        !tx.invalid
    }
}

impl AdmissionSink for BenchSink {
    type Item = BenchTx;
    type Error = BenchReject;

    fn add(&self, items: Vec<BenchTx>) -> Vec<Result<(), BenchReject>> {
        items
            .iter()
            .map(|tx| {
                self.counters.validations.fetch_add(1, Ordering::Relaxed);
                if self.validate(tx) {
                    Ok(())
                } else {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    Err(BenchReject::BadProof)
                }
            })
            .collect()
    }
}
