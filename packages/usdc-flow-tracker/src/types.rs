//! Chain keys, flow types and status enums.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stage names recorded in chain status trails.
pub mod stages {
    pub const EVM_BURN_CONFIRMED: &str = "evm_burn_confirmed";
    pub const ATTESTATION_COMPLETE: &str = "attestation_complete";
    pub const NOBLE_MINT_CONFIRMED: &str = "noble_mint_confirmed";
    pub const NOBLE_FORWARDED: &str = "noble_forwarded";
    pub const NAMADA_RECEIVED: &str = "namada_received";
    pub const NAMADA_SENT: &str = "namada_sent";
    pub const NOBLE_RECEIVED: &str = "noble_received";
    pub const NOBLE_BURNED: &str = "noble_burned";
    pub const EVM_MINT_CONFIRMED: &str = "evm_mint_confirmed";
}

/// One of the three ledgers a flow crosses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainKey {
    Evm,
    Noble,
    Namada,
}

impl ChainKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKey::Evm => "evm",
            ChainKey::Noble => "noble",
            ChainKey::Namada => "namada",
        }
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a chain sits in a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowPosition {
    Source,
    Intermediate,
    Destination,
}

/// Direction of a transfer.
///
/// - Deposit: EVM burn, Noble mint + forward, Namada receive.
/// - Payment: Namada send, Noble receive + burn, EVM mint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    Deposit,
    Payment,
}

impl FlowType {
    /// Chains in the order they are polled.
    pub fn chain_order(&self) -> [ChainKey; 3] {
        match self {
            FlowType::Deposit => [ChainKey::Evm, ChainKey::Noble, ChainKey::Namada],
            FlowType::Payment => [ChainKey::Namada, ChainKey::Noble, ChainKey::Evm],
        }
    }

    pub fn position_of(&self, chain: ChainKey) -> FlowPosition {
        let order = self.chain_order();
        if order[0] == chain {
            FlowPosition::Source
        } else if order[1] == chain {
            FlowPosition::Intermediate
        } else {
            FlowPosition::Destination
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::Deposit => "deposit",
            FlowType::Payment => "payment",
        }
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flow-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowPollingStatus {
    Pending,
    Success,
    TxError,
    PollingError,
    PollingTimeout,
    UserActionRequired,
    Cancelled,
}

impl FlowPollingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowPollingStatus::Success | FlowPollingStatus::Cancelled)
    }

    /// States from which `resume` may restart polling.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            FlowPollingStatus::Cancelled
                | FlowPollingStatus::PollingError
                | FlowPollingStatus::PollingTimeout
                | FlowPollingStatus::UserActionRequired
        )
    }

    /// Non-success error states from which `retry` may restart polling.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlowPollingStatus::TxError
                | FlowPollingStatus::PollingError
                | FlowPollingStatus::PollingTimeout
                | FlowPollingStatus::UserActionRequired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowPollingStatus::Pending => "pending",
            FlowPollingStatus::Success => "success",
            FlowPollingStatus::TxError => "tx_error",
            FlowPollingStatus::PollingError => "polling_error",
            FlowPollingStatus::PollingTimeout => "polling_timeout",
            FlowPollingStatus::UserActionRequired => "user_action_required",
            FlowPollingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FlowPollingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-chain status. A cancelled flow leaves its chains at their last value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatusValue {
    Pending,
    Success,
    TxError,
    PollingError,
    PollingTimeout,
    UserActionRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Confirmed,
}

/// Who observed a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageSource {
    Poller,
    Client,
}

/// A named step of a flow, as observed on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStage {
    pub stage: String,
    pub status: StageStatus,
    pub source: StageSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl ChainStage {
    /// A stage confirmed by a poller just now.
    pub fn confirmed(stage: &str, tx_hash: Option<String>) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::Confirmed,
            source: StageSource::Poller,
            tx_hash,
            occurred_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_order_is_mirrored() {
        let deposit = FlowType::Deposit.chain_order();
        let mut payment = FlowType::Payment.chain_order();
        payment.reverse();
        assert_eq!(deposit, payment);
    }

    #[test]
    fn test_position_of() {
        assert_eq!(FlowType::Deposit.position_of(ChainKey::Evm), FlowPosition::Source);
        assert_eq!(
            FlowType::Payment.position_of(ChainKey::Evm),
            FlowPosition::Destination
        );
        assert_eq!(
            FlowType::Payment.position_of(ChainKey::Noble),
            FlowPosition::Intermediate
        );
    }

    #[test]
    fn test_status_transitions() {
        assert!(FlowPollingStatus::Cancelled.is_resumable());
        assert!(!FlowPollingStatus::Cancelled.is_retryable());
        assert!(FlowPollingStatus::TxError.is_retryable());
        assert!(!FlowPollingStatus::TxError.is_resumable());
        assert!(!FlowPollingStatus::Success.is_resumable());
        assert!(FlowPollingStatus::Success.is_terminal());
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&FlowPollingStatus::UserActionRequired).unwrap();
        assert_eq!(json, "\"user_action_required\"");
        let back: ChainStatusValue = serde_json::from_str("\"polling_timeout\"").unwrap();
        assert_eq!(back, ChainStatusValue::PollingTimeout);
    }
}
