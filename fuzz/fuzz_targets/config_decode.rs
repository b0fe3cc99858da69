#![no_main]

use libfuzzer_sys::fuzz_target;
use sluice_core::ItemHash;
use sluice_node::{Fetcher, FetcherConfig, PoolItem};
use sluice_transport::{InMemoryDisconnector, InMemoryTransport};

struct Never;

impl PoolItem for Never {
    fn hash(&self) -> ItemHash {
        ItemHash([0; 32])
    }
    fn kind(&self) -> sluice_core::ItemKind {
        sluice_core::ITEM_KIND_LEGACY
    }
    fn size(&self) -> usize {
        0
    }
}

fuzz_target!(|data: &[u8]| {
    let Ok(cfg) = serde_json::from_slice::<FetcherConfig>(data) else {
        return;
    };
    let valid = cfg.validate().is_ok();
    let built = Fetcher::<Never, _, _>::new(
        cfg,
        InMemoryTransport::default(),
        InMemoryDisconnector::default(),
    );
    assert_eq!(valid, built.is_ok());
});
