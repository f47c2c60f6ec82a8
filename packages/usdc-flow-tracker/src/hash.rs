//! Hashing and hex helpers for CCTP identifiers
//!
//! The attestation service indexes messages by the keccak256 of the exact
//! message bytes emitted in `MessageSent`, so the lookup id must be computed
//! over the raw bytes with no re-encoding.

use tiny_keccak::{Hasher, Keccak};

use crate::error::DecodeError;

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Attestation lookup id for a CCTP message.
pub fn lookup_id(message: &[u8]) -> [u8; 32] {
    keccak256(message)
}

/// topic0 of a Solidity event, e.g. `"MessageSent(bytes)"`.
pub fn event_topic(signature: &str) -> [u8; 32] {
    keccak256(signature.as_bytes())
}

/// `0x`-prefixed lowercase hex.
pub fn to_hex_prefixed(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse hex with or without a `0x` prefix.
pub fn parse_hex(value: &str) -> Result<Vec<u8>, DecodeError> {
    let trimmed = value.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    hex::decode(stripped).map_err(|e| DecodeError::InvalidHex(format!("{value:?}: {e}")))
}

pub fn parse_bytes32(value: &str) -> Result<[u8; 32], DecodeError> {
    let bytes = parse_hex(value)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| DecodeError::InvalidHex(format!("expected 32 bytes, got {}", b.len())))
}

/// Left-pad a 20-byte EVM address to a bytes32 word.
pub fn address_to_bytes32(address: &[u8; 20]) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address);
    word
}

/// Take the address held in the last 20 bytes of a word.
pub fn bytes32_to_address(word: &[u8; 32]) -> [u8; 20] {
    let mut address = [0u8; 20];
    address.copy_from_slice(&word[12..]);
    address
}

/// Normalize a hex string for comparison (lowercase, `0x` prefix).
pub fn normalize_hex(value: &str) -> String {
    let trimmed = value.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", stripped.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256_empty() {
        assert_eq!(
            hex::encode(keccak256(&[])),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_lookup_id_is_keccak_of_raw_bytes() {
        let message = [0x01u8, 0x02, 0x03];
        assert_eq!(lookup_id(&message), keccak256(&message));
        assert_ne!(lookup_id(&message), lookup_id(&[0x01, 0x02]));
    }

    #[test]
    fn test_event_topic_transfer() {
        assert_eq!(
            to_hex_prefixed(&event_topic("Transfer(address,address,uint256)")),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn test_parse_hex_prefix_optional() {
        assert_eq!(parse_hex("0xabcd").unwrap(), vec![0xab, 0xcd]);
        assert_eq!(parse_hex("ABCD").unwrap(), vec![0xab, 0xcd]);
        assert!(parse_hex("0xzz").is_err());
    }

    #[test]
    fn test_parse_bytes32_length() {
        assert!(parse_bytes32(&format!("0x{}", "11".repeat(32))).is_ok());
        assert!(parse_bytes32("0x1122").is_err());
    }

    #[test]
    fn test_address_word_round_trip() {
        let address = [0x42u8; 20];
        let word = address_to_bytes32(&address);
        assert_eq!(&word[..12], &[0u8; 12]);
        assert_eq!(bytes32_to_address(&word), address);
    }

    #[test]
    fn test_normalize_hex() {
        assert_eq!(normalize_hex("0XABcd"), "0xabcd");
        assert_eq!(normalize_hex("abcd"), "0xabcd");
    }
}
