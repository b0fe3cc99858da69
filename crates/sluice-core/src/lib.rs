//! Core SLUICE primitives shared across crates.
//!
//! Includes item identifiers, peer handles, item kinds, hash helpers, and base errors.

pub mod error;
pub mod hash;
pub mod types;

pub use types::{
    ItemHash, ItemKind, PeerId, ITEM_KIND_ACCESS_LIST, ITEM_KIND_BLOB, ITEM_KIND_DYNAMIC_FEE,
    ITEM_KIND_LEGACY, ITEM_KIND_SET_CODE,
};
