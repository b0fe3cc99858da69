use crate::error::SluiceError;
use crate::types::ItemHash;

/// Computes BLAKE3 and returns the first-class 32-byte digest value.
pub fn blake3_32(input: &[u8]) -> [u8; 32] {
    *blake3::hash(input).as_bytes()
}

/// Derives the content identifier of an encoded item.
pub fn item_hash(encoded: &[u8]) -> ItemHash {
    ItemHash(blake3_32(encoded))
}

/// Parses a 64-char hex string into an [`ItemHash`].
pub fn parse_item_hash_hex(value: &str) -> Result<ItemHash, SluiceError> {
    let value = value.trim().trim_start_matches("0x");
    let bytes = hex::decode(value).map_err(|_| SluiceError::Decode("item hash is not hex"))?;
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SluiceError::InvalidInput("item hash must be 32 bytes"))?;
    Ok(ItemHash(raw))
}

#[cfg(test)]
mod tests {
    use super::{blake3_32, item_hash, parse_item_hash_hex};

    #[test]
    fn hash_is_deterministic() {
        let input = b"sluice";
        assert_eq!(blake3_32(input), blake3_32(input));
    }

    #[test]
    fn hash_changes_when_input_changes() {
        assert_ne!(item_hash(b"tx-a"), item_hash(b"tx-b"));
    }

    #[test]
    fn hex_parse_accepts_prefixed_and_bare_forms() {
        let hash = item_hash(b"tx");
        let bare = hash.to_string();
        assert_eq!(parse_item_hash_hex(&bare).expect("bare hex parses"), hash);
        assert_eq!(
            parse_item_hash_hex(&format!("0x{bare}")).expect("prefixed hex parses"),
            hash
        );
    }

    #[test]
    fn hex_parse_rejects_wrong_length() {
        assert!(parse_item_hash_hex("abcd").is_err());
        assert!(parse_item_hash_hex("zz").is_err());
    }
}
