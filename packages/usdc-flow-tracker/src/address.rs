//! Address codecs for comparing CCTP `bytes32` recipients with user-facing
//! addresses (`0x` EVM hex or bech32 Cosmos accounts).

use bech32::{FromBase32, ToBase32, Variant};
use eyre::{eyre, Result};

/// Decode a bech32 address to raw bytes (20 or 32 bytes).
pub fn decode_bech32(addr: &str) -> Result<(Vec<u8>, String)> {
    let (hrp, data, _variant) =
        bech32::decode(addr).map_err(|e| eyre!("Invalid bech32 address: {}", e))?;

    let bytes = Vec::<u8>::from_base32(&data).map_err(|e| eyre!("Invalid base32 data: {}", e))?;

    if bytes.len() != 20 && bytes.len() != 32 {
        return Err(eyre!(
            "Invalid address length: expected 20 or 32 bytes, got {}",
            bytes.len()
        ));
    }

    Ok((bytes, hrp))
}

pub fn encode_bech32(bytes: &[u8], hrp: &str) -> Result<String> {
    bech32::encode(hrp, bytes.to_base32(), Variant::Bech32)
        .map_err(|e| eyre!("Failed to encode bech32: {}", e))
}

/// Left-pad any user-facing address into the `bytes32` form CCTP uses.
pub fn address_to_word(addr: &str) -> Result<[u8; 32]> {
    let trimmed = addr.trim();
    let raw = if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
        crate::hash::parse_hex(trimmed).map_err(|e| eyre!("Invalid EVM address: {}", e))?
    } else {
        decode_bech32(trimmed)?.0
    };

    if raw.len() > 32 {
        return Err(eyre!("Address longer than 32 bytes: {}", addr));
    }
    let mut word = [0u8; 32];
    word[32 - raw.len()..].copy_from_slice(&raw);
    Ok(word)
}

/// Whether a CCTP `mint_recipient` word designates `expected`.
pub fn recipient_matches(mint_recipient: &[u8; 32], expected: &str) -> Result<bool> {
    Ok(address_to_word(expected)? == *mint_recipient)
}

/// Addresses compare case-insensitively for hex and exactly for bech32
/// (bech32 is canonical lowercase).
pub fn same_address(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}
