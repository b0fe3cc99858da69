use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sluice_core::hash::blake3_32;
use sluice_core::{ItemHash, ItemKind, PeerId, ITEM_KIND_DYNAMIC_FEE};
use sluice_node::{
    AdmissionSink, AnnouncedItem, Fetcher, FetcherConfig, FetcherError, PoolItem, RejectClass,
};
use sluice_transport::{InMemoryDisconnector, InMemoryTransport};

/// Flood shape used by the abuse scenarios.
#[derive(Debug, Clone, Copy)]
pub struct FloodScenario {
    pub peers: usize,
    pub items_per_delivery: usize,
    /// Share of each delivery the sink rejects as invalid, in percent.
    pub invalid_percent: u8,
    /// BLAKE3 rounds the sink spends per item.
    pub validation_rounds: u32,
}

pub const PRACTICAL_FLOOD: FloodScenario = FloodScenario {
    peers: 8,
    items_per_delivery: 16,
    invalid_percent: 20,
    validation_rounds: 64,
};

/// Flood shape used by the concurrent service tests.
pub fn practical_flood() -> FloodScenario {
    PRACTICAL_FLOOD
}

impl FloodScenario {
    /// Invalid items per delivery; they lead each delivery.
    pub fn invalid_per_delivery(&self) -> usize {
        self.items_per_delivery * self.invalid_percent as usize / 100
    }

    /// Items `peer_idx` sends in round `round`. Ids never repeat across
    /// peers or rounds.
    pub fn delivery(&self, peer_idx: usize, round: usize) -> Vec<SimTx> {
        let invalid = self.invalid_per_delivery();
        let base = ((peer_idx as u64) << 32) | ((round * self.items_per_delivery) as u64);
        (0..self.items_per_delivery)
            .map(|i| {
                let id = base + i as u64;
                if i < invalid {
                    SimTx::invalid(id)
                } else {
                    SimTx::valid(id)
                }
            })
            .collect()
    }
}

/// What the scripted sink does with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Valid,
    Invalid,
    Underpriced,
}

/// Synthetic pool item. The hash is derived from `id`, so two `SimTx`
/// with the same id are the same transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimTx {
    pub id: u64,
    pub kind: ItemKind,
    pub size: usize,
    pub script: Script,
}

impl SimTx {
    /// Item the sink accepts.
    pub fn valid(id: u64) -> Self {
        Self {
            id,
            kind: ITEM_KIND_DYNAMIC_FEE,
            size: 256,
            script: Script::Valid,
        }
    }

    /// Item whose proof check fails.
    pub fn invalid(id: u64) -> Self {
        Self {
            script: Script::Invalid,
            ..Self::valid(id)
        }
    }

    /// Item the sink rejects as underpriced.
    pub fn underpriced(id: u64) -> Self {
        Self {
            script: Script::Underpriced,
            ..Self::valid(id)
        }
    }

    /// Metadata a peer would gossip before delivering this item.
    pub fn announcement(&self) -> AnnouncedItem {
        AnnouncedItem {
            hash: self.hash(),
            size: self.size,
            kind: self.kind,
        }
    }
}

/// Hash of the item with `id`.
pub fn sim_hash(id: u64) -> ItemHash {
    ItemHash(blake3_32(&id.to_be_bytes()))
}

impl PoolItem for SimTx {
    fn hash(&self) -> ItemHash {
        sim_hash(self.id)
    }
    fn kind(&self) -> ItemKind {
        self.kind
    }
    fn size(&self) -> usize {
        self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    BadSignature,
    FeeTooLow,
    AlreadyKnown,
}

/// Maps [`SimError`] to the fetcher's reject classes.
pub fn classify_sim_error(err: &SimError) -> RejectClass {
    match err {
        SimError::BadSignature => RejectClass::Invalid,
        SimError::FeeTooLow => RejectClass::Underpriced,
        SimError::AlreadyKnown => RejectClass::Duplicate,
    }
}

/// Pool stand-in that follows each item's [`Script`] and counts its work.
///
/// Clones share counters and pool contents.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSink {
    pool: Arc<Mutex<HashSet<ItemHash>>>,
    calls: Arc<AtomicU64>,
    items: Arc<AtomicU64>,
    rounds: u32,
}

impl ScriptedSink {
    /// Sink that hashes each item `rounds` times before deciding.
    pub fn with_rounds(rounds: u32) -> Self {
        Self {
            rounds,
            ..Self::default()
        }
    }

    /// Number of `add` calls so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of items passed to `add` so far.
    pub fn items_seen(&self) -> u64 {
        self.items.load(Ordering::SeqCst)
    }

    /// Distinct items admitted so far.
    pub fn pool_len(&self) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn burn(&self, tx: &SimTx) {
        let mut digest = blake3_32(&tx.id.to_le_bytes());
        for _ in 0..self.rounds {
            digest = blake3_32(&digest);
        }
        std::hint::black_box(digest);
    }
}

impl AdmissionSink for ScriptedSink {
    type Item = SimTx;
    type Error = SimError;

    fn add(&self, items: Vec<SimTx>) -> Vec<Result<(), SimError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.items.fetch_add(items.len() as u64, Ordering::SeqCst);
        let mut pool = self
            .pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        items
            .iter()
            .map(|tx| {
                self.burn(tx);
                match tx.script {
                    Script::Invalid => Err(SimError::BadSignature),
                    Script::Underpriced => Err(SimError::FeeTooLow),
                    Script::Valid if !pool.insert(tx.hash()) => Err(SimError::AlreadyKnown),
                    Script::Valid => Ok(()),
                }
            })
            .collect()
    }
}

pub type SimFetcher = Fetcher<SimTx, InMemoryTransport, InMemoryDisconnector>;

/// Fetcher wired to in-memory capabilities; the returned handles observe
/// what it sends and whom it disconnects.
pub fn sim_fetcher(
    config: FetcherConfig,
) -> Result<(SimFetcher, InMemoryTransport, InMemoryDisconnector), FetcherError> {
    let transport = InMemoryTransport::default();
    let disconnector = InMemoryDisconnector::default();
    let fetcher = Fetcher::new(config, transport.clone(), disconnector.clone())?;
    Ok((fetcher, transport, disconnector))
}

/// `n` distinct peer ids.
pub fn sim_peers(n: usize) -> Vec<PeerId> {
    (0..n).map(|i| PeerId::new(format!("sim-peer-{i}"))).collect()
}

#[cfg(test)]
mod tests {
    use sluice_node::{AdmissionSink, PoolItem, RejectClass};

    use super::{
        classify_sim_error, practical_flood, Script, ScriptedSink, SimError, SimTx,
    };

    #[test]
    fn practical_flood_is_reasonable() {
        let flood = practical_flood();
        assert!(flood.peers > 1);
        assert!(flood.invalid_percent <= 100);
        assert_eq!(flood.invalid_per_delivery(), 3);
    }

    #[test]
    fn flood_deliveries_are_disjoint() {
        let flood = practical_flood();
        let a = flood.delivery(0, 0);
        let b = flood.delivery(0, 1);
        let c = flood.delivery(1, 0);
        assert_eq!(a.len(), flood.items_per_delivery);
        assert!(a.iter().all(|tx| !b.contains(tx) && !c.contains(tx)));
        let invalid = a.iter().filter(|tx| tx.script == Script::Invalid).count();
        assert_eq!(invalid, flood.invalid_per_delivery());
    }

    #[test]
    fn scripted_sink_follows_scripts_and_dedups() {
        let sink = ScriptedSink::default();
        let results = sink.add(vec![
            SimTx::valid(1),
            SimTx::invalid(2),
            SimTx::underpriced(3),
            SimTx::valid(1),
        ]);
        assert_eq!(
            results,
            vec![
                Ok(()),
                Err(SimError::BadSignature),
                Err(SimError::FeeTooLow),
                Err(SimError::AlreadyKnown),
            ]
        );
        assert_eq!(sink.calls(), 1);
        assert_eq!(sink.items_seen(), 4);
        assert_eq!(sink.pool_len(), 1);
    }

    #[test]
    fn sim_hash_depends_only_on_id() {
        assert_eq!(SimTx::valid(7).hash(), SimTx::invalid(7).hash());
        assert_ne!(SimTx::valid(7).hash(), SimTx::valid(8).hash());
        assert_eq!(classify_sim_error(&SimError::AlreadyKnown), RejectClass::Duplicate);
    }
}
