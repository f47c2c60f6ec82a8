//! CCTP message codec
//!
//! ## Message layout (big-endian, 116-byte header)
//!
//! | bytes    | field              |
//! |----------|--------------------|
//! | 0..4     | version            |
//! | 4..8     | source_domain      |
//! | 8..12    | destination_domain |
//! | 12..20   | nonce              |
//! | 20..52   | sender             |
//! | 52..84   | recipient          |
//! | 84..116  | destination_caller |
//! | 116..    | message_body       |
//!
//! ## BurnMessage layout (132 bytes)
//!
//! | bytes    | field                                |
//! |----------|--------------------------------------|
//! | 0..4     | version                              |
//! | 4..36    | burn_token (address in last 20)      |
//! | 36..68   | mint_recipient                       |
//! | 68..100  | amount (uint256)                     |
//! | 100..132 | message_sender (address in last 20)  |

use alloy::primitives::U256;

use crate::error::DecodeError;
use crate::hash::{address_to_bytes32, bytes32_to_address};

pub const MESSAGE_HEADER_LEN: usize = 116;
pub const BURN_MESSAGE_LEN: usize = 132;
const WORD: usize = 32;

/// A decoded CCTP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: u32,
    pub source_domain: u32,
    pub destination_domain: u32,
    pub nonce: u64,
    pub sender: [u8; 32],
    pub recipient: [u8; 32],
    pub destination_caller: [u8; 32],
    pub message_body: Vec<u8>,
}

/// The body of a CCTP token burn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurnMessage {
    pub version: u32,
    pub burn_token: [u8; 20],
    pub mint_recipient: [u8; 32],
    pub amount: U256,
    pub message_sender: [u8; 20],
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(buf)
}

fn read_word(bytes: &[u8], at: usize) -> [u8; 32] {
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&bytes[at..at + WORD]);
    buf
}

/// Decode a CCTP message. Requires at least the 116-byte header.
pub fn decode_message(bytes: &[u8]) -> Result<Message, DecodeError> {
    if bytes.len() < MESSAGE_HEADER_LEN {
        return Err(DecodeError::TooShort {
            what: "message",
            expected: MESSAGE_HEADER_LEN,
            actual: bytes.len(),
        });
    }

    Ok(Message {
        version: read_u32(bytes, 0),
        source_domain: read_u32(bytes, 4),
        destination_domain: read_u32(bytes, 8),
        nonce: read_u64(bytes, 12),
        sender: read_word(bytes, 20),
        recipient: read_word(bytes, 52),
        destination_caller: read_word(bytes, 84),
        message_body: bytes[MESSAGE_HEADER_LEN..].to_vec(),
    })
}

/// Decode a burn message body. Only the first 132 bytes are read.
pub fn decode_burn_message(bytes: &[u8]) -> Result<BurnMessage, DecodeError> {
    if bytes.len() < BURN_MESSAGE_LEN {
        return Err(DecodeError::TooShort {
            what: "burn message",
            expected: BURN_MESSAGE_LEN,
            actual: bytes.len(),
        });
    }

    Ok(BurnMessage {
        version: read_u32(bytes, 0),
        burn_token: bytes32_to_address(&read_word(bytes, 4)),
        mint_recipient: read_word(bytes, 36),
        amount: U256::from_be_bytes(read_word(bytes, 68)),
        message_sender: bytes32_to_address(&read_word(bytes, 100)),
    })
}

/// Extract an ABI-encoded dynamic `bytes` value (offset word, length word, data).
///
/// This is the shape of `MessageSent(bytes)` log data.
pub fn extract_abi_bytes(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    extract_abi_bytes_at(data, 0)
}

/// Extract a dynamic `bytes` value whose offset sits in head word `head_index`.
pub fn extract_abi_bytes_at(data: &[u8], head_index: usize) -> Result<Vec<u8>, DecodeError> {
    let head_end = (head_index + 1) * WORD;
    if data.len() < head_end {
        return Err(DecodeError::TooShort {
            what: "ABI payload",
            expected: head_end,
            actual: data.len(),
        });
    }

    let offset = word_to_usize(&read_word(data, head_index * WORD)).ok_or(
        DecodeError::OffsetOutOfBounds {
            offset: usize::MAX,
            len: data.len(),
        },
    )?;
    let length_end = offset
        .checked_add(WORD)
        .filter(|end| *end <= data.len())
        .ok_or(DecodeError::OffsetOutOfBounds {
            offset,
            len: data.len(),
        })?;

    let length = word_to_usize(&read_word(data, offset)).ok_or(DecodeError::LengthOutOfBounds {
        offset,
        length: usize::MAX,
        len: data.len(),
    })?;
    if length == 0 {
        return Err(DecodeError::EmptyPayload);
    }

    let end = length_end
        .checked_add(length)
        .filter(|end| *end <= data.len())
        .ok_or(DecodeError::LengthOutOfBounds {
            offset,
            length,
            len: data.len(),
        })?;

    Ok(data[length_end..end].to_vec())
}

/// Decoded `MessageReceived(address caller, uint32 sourceDomain, uint64 nonce,
/// bytes32 sender, bytes messageBody)` data section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReceivedData {
    pub source_domain: u32,
    pub sender: [u8; 32],
    pub message_body: Vec<u8>,
}

pub fn decode_message_received(data: &[u8]) -> Result<MessageReceivedData, DecodeError> {
    if data.len() < 3 * WORD {
        return Err(DecodeError::TooShort {
            what: "MessageReceived data",
            expected: 3 * WORD,
            actual: data.len(),
        });
    }
    Ok(MessageReceivedData {
        source_domain: read_u32(data, WORD - 4),
        sender: read_word(data, WORD),
        message_body: extract_abi_bytes_at(data, 2)?,
    })
}

/// A uint256 word as u128, or None when it does not fit.
pub fn word_to_u128(word: &[u8]) -> Option<u128> {
    if word.len() != WORD || word[..16].iter().any(|b| *b != 0) {
        return None;
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&word[16..]);
    Some(u128::from_be_bytes(buf))
}

/// A uint256 word as usize, or None when it does not fit.
fn word_to_usize(word: &[u8; 32]) -> Option<usize> {
    if word[..24].iter().any(|b| *b != 0) {
        return None;
    }
    usize::try_from(read_u64(word, 24)).ok()
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MESSAGE_HEADER_LEN + self.message_body.len());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.source_domain.to_be_bytes());
        out.extend_from_slice(&self.destination_domain.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.sender);
        out.extend_from_slice(&self.recipient);
        out.extend_from_slice(&self.destination_caller);
        out.extend_from_slice(&self.message_body);
        out
    }

    /// Decode the body as a burn message.
    pub fn burn_message(&self) -> Result<BurnMessage, DecodeError> {
        decode_burn_message(&self.message_body)
    }
}

impl BurnMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BURN_MESSAGE_LEN);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&address_to_bytes32(&self.burn_token));
        out.extend_from_slice(&self.mint_recipient);
        out.extend_from_slice(&self.amount.to_be_bytes::<32>());
        out.extend_from_slice(&address_to_bytes32(&self.message_sender));
        out
    }

    /// Amount as u128, or None if it overflows.
    pub fn amount_u128(&self) -> Option<u128> {
        u128::try_from(self.amount).ok()
    }

    /// The EVM address held in the last 20 bytes of `mint_recipient`.
    pub fn mint_recipient_address(&self) -> [u8; 20] {
        bytes32_to_address(&self.mint_recipient)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_burn(amount: u128, recipient: [u8; 20]) -> BurnMessage {
        BurnMessage {
            version: 0,
            burn_token: [0xaa; 20],
            mint_recipient: address_to_bytes32(&recipient),
            amount: U256::from(amount),
            message_sender: [0xbb; 20],
        }
    }

    pub(crate) fn sample_message(nonce: u64, source: u32, dest: u32, body: Vec<u8>) -> Message {
        Message {
            version: 0,
            source_domain: source,
            destination_domain: dest,
            nonce,
            sender: [0x11; 32],
            recipient: [0x22; 32],
            destination_caller: [0u8; 32],
            message_body: body,
        }
    }

    /// ABI-encode `bytes` the way a `MessageSent(bytes)` log carries it.
    pub(crate) fn abi_encode_bytes(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&U256::from(32u64).to_be_bytes::<32>());
        out.extend_from_slice(&U256::from(payload.len()).to_be_bytes::<32>());
        out.extend_from_slice(payload);
        let pad = (WORD - payload.len() % WORD) % WORD;
        out.extend(std::iter::repeat(0u8).take(pad));
        out
    }

    /// ABI-encode the data section of `MessageReceived`.
    pub(crate) fn message_received_data(source_domain: u32, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&U256::from(source_domain).to_be_bytes::<32>());
        out.extend_from_slice(&[0x11; 32]);
        out.extend_from_slice(&U256::from(96u64).to_be_bytes::<32>());
        out.extend_from_slice(&U256::from(body.len()).to_be_bytes::<32>());
        out.extend_from_slice(body);
        let pad = (WORD - body.len() % WORD) % WORD;
        out.extend(std::iter::repeat(0u8).take(pad));
        out
    }

    #[test]
    fn test_message_field_round_trip() {
        let body = sample_burn(1_000_000, [0x33; 20]).encode();
        let message = sample_message(0x0102_0304_0506_0708, 0, 4, body.clone());
        let bytes = message.encode();
        assert_eq!(bytes.len(), MESSAGE_HEADER_LEN + BURN_MESSAGE_LEN);

        let decoded = decode_message(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.nonce, 0x0102_0304_0506_0708);
        assert_eq!(decoded.message_body, body);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn test_message_header_only() {
        let bytes = vec![0u8; MESSAGE_HEADER_LEN];
        let decoded = decode_message(&bytes).unwrap();
        assert!(decoded.message_body.is_empty());
    }

    #[test]
    fn test_short_inputs_fail_deterministically() {
        for len in [0, 1, 20, MESSAGE_HEADER_LEN - 1] {
            let err = decode_message(&vec![0u8; len]).unwrap_err();
            assert_eq!(
                err,
                DecodeError::TooShort {
                    what: "message",
                    expected: MESSAGE_HEADER_LEN,
                    actual: len
                }
            );
        }
        assert!(decode_burn_message(&[0u8; BURN_MESSAGE_LEN - 1]).is_err());
    }

    #[test]
    fn test_zero_burn_message() {
        let burn = decode_burn_message(&[0u8; BURN_MESSAGE_LEN]).unwrap();
        assert_eq!(burn.version, 0);
        assert_eq!(burn.burn_token, [0u8; 20]);
        assert_eq!(burn.mint_recipient, [0u8; 32]);
        assert_eq!(burn.amount, U256::ZERO);
        assert_eq!(burn.message_sender, [0u8; 20]);
        assert_eq!(burn.amount_u128(), Some(0));
    }

    #[test]
    fn test_burn_message_reads_only_first_132_bytes() {
        let mut bytes = sample_burn(42, [0x01; 20]).encode();
        bytes.extend_from_slice(&[0xff; 40]);
        let burn = decode_burn_message(&bytes).unwrap();
        assert_eq!(burn.amount_u128(), Some(42));
        assert_eq!(burn.mint_recipient_address(), [0x01; 20]);
    }

    #[test]
    fn test_amount_overflowing_u128() {
        let mut burn = sample_burn(0, [0u8; 20]);
        burn.amount = U256::MAX;
        assert_eq!(burn.amount_u128(), None);
    }

    #[test]
    fn test_extract_abi_bytes() {
        let payload = vec![7u8; 150];
        let data = abi_encode_bytes(&payload);
        assert_eq!(extract_abi_bytes(&data).unwrap(), payload);
    }

    #[test]
    fn test_decode_message_received() {
        let body = sample_burn(5, [0x09; 20]).encode();
        let data = message_received_data(4, &body);
        let decoded = decode_message_received(&data).unwrap();
        assert_eq!(decoded.source_domain, 4);
        assert_eq!(decoded.message_body, body);
        assert!(decode_message_received(&data[..64]).is_err());
    }

    #[test]
    fn test_word_to_u128() {
        let word = U256::from(1_000_000u64).to_be_bytes::<32>();
        assert_eq!(word_to_u128(&word), Some(1_000_000));
        assert_eq!(word_to_u128(&U256::MAX.to_be_bytes::<32>()), None);
        assert_eq!(word_to_u128(&[0u8; 31]), None);
    }

    #[test]
    fn test_extract_abi_bytes_zero_length() {
        let data = abi_encode_bytes(&[]);
        assert_eq!(extract_abi_bytes(&data), Err(DecodeError::EmptyPayload));
    }

    #[test]
    fn test_extract_abi_bytes_offset_past_buffer() {
        let mut data = abi_encode_bytes(&[1, 2, 3]);
        data[..32].copy_from_slice(&U256::from(4096u64).to_be_bytes::<32>());
        assert!(matches!(
            extract_abi_bytes(&data),
            Err(DecodeError::OffsetOutOfBounds { offset: 4096, .. })
        ));
    }

    #[test]
    fn test_extract_abi_bytes_length_overflow() {
        let mut data = abi_encode_bytes(&[1, 2, 3]);
        data[32..64].copy_from_slice(&U256::from(1000u64).to_be_bytes::<32>());
        assert!(matches!(
            extract_abi_bytes(&data),
            Err(DecodeError::LengthOutOfBounds { length: 1000, .. })
        ));

        data[32..64].copy_from_slice(&U256::MAX.to_be_bytes::<32>());
        assert!(extract_abi_bytes(&data).is_err());
    }
}
