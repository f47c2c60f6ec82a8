//! Accumulated flow metadata.
//!
//! Every poller returns a partial [`FlowMetadata`]; the orchestrator folds it
//! into the flow's bag with [`FlowMetadata::merge`] so later chains can use what
//! earlier chains discovered (nonce, packet sequence, message hash, ...).

use serde::{Deserialize, Serialize};

/// Append-only bag of facts about one flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_domain: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_domain: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarding_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ibc_channel: Option<String>,
    /// Amount in minor units, serialized as a decimal string.
    #[serde(with = "decimal_u128", skip_serializing_if = "Option::is_none")]
    pub amount: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denom: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burn_tx_hash: Option<String>,
    /// Hex-encoded CCTP message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_bytes: Option<String>,
    /// keccak256 of the message, used as the attestation lookup id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noble_tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_tx_hash: Option<String>,
    /// Block of the destination event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    /// First EVM block the destination scan starts from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_block: Option<u64>,
    /// First Noble height the Noble scans start from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noble_start_height: Option<u64>,
    /// First Namada height the Namada scans start from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namada_start_height: Option<u64>,
}

macro_rules! merge_fields {
    ($self:ident, $incoming:ident, $conflicts:ident, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $incoming.$field {
                if matches!(&$self.$field, Some(existing) if *existing != value) {
                    $conflicts.push(stringify!($field));
                } else if $self.$field.is_none() {
                    $self.$field = Some(value);
                }
            }
        )+
    };
}

impl FlowMetadata {
    /// Fold `incoming` into `self`.
    ///
    /// Absent incoming fields never clear present ones. When both sides hold
    /// different values the existing value is kept and the field name is
    /// returned so the caller can log the conflict.
    pub fn merge(&mut self, incoming: FlowMetadata) -> Vec<&'static str> {
        let mut conflicts = Vec::new();
        merge_fields!(
            self,
            incoming,
            conflicts,
            nonce,
            source_domain,
            destination_domain,
            packet_sequence,
            sender,
            recipient,
            forwarding_address,
            ibc_channel,
            amount,
            denom,
            source_tx_hash,
            burn_tx_hash,
            message_bytes,
            message_hash,
            attestation,
            noble_tx_hash,
            destination_tx_hash,
            block_number,
            start_block,
            noble_start_height,
            namada_start_height,
        );
        conflicts
    }
}

/// `Option<u128>` as a decimal string. Accepts JSON numbers on input for
/// amounts that fit in u64.
mod decimal_u128 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<u128>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => serializer.serialize_str(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u128>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Number(n)) => Ok(Some(n as u128)),
            Some(Raw::Text(s)) => s
                .trim()
                .parse::<u128>()
                .map(Some)
                .map_err(|e| de::Error::custom(format!("invalid amount {s:?}: {e}"))),
        }
    }
}
