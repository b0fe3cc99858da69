use std::fmt;

use serde::{Deserialize, Serialize};

/// 32-byte opaque item identifier; the unique key across all fetcher tables.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemHash(pub [u8; 32]);

impl ItemHash {
    /// Raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for ItemHash {
    fn from(raw: [u8; 32]) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ItemHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ItemHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemHash({}..)", &hex::encode(&self.0[..6]))
    }
}

/// Opaque remote peer handle as assigned by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Wraps a transport-level peer identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Peer identifier as given by the transport.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Item type tag carried by announcements (transaction envelope type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKind(pub u8);

/// Reserved item kinds matching the typed transaction envelopes.
pub const ITEM_KIND_LEGACY: ItemKind = ItemKind(0);
pub const ITEM_KIND_ACCESS_LIST: ItemKind = ItemKind(1);
pub const ITEM_KIND_DYNAMIC_FEE: ItemKind = ItemKind(2);
pub const ITEM_KIND_BLOB: ItemKind = ItemKind(3);
pub const ITEM_KIND_SET_CODE: ItemKind = ItemKind(4);

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kind-{}", self.0)
    }
}
