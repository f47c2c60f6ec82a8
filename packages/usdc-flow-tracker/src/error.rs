//! Error taxonomy shared by pollers, the orchestrator and the stores.
//!
//! Poll failures are data, not Rust errors: a [`PollError`] is persisted inside
//! `ChainStatus` and rendered to API callers, so it carries the classification
//! fields a UI needs (`category`, `is_recoverable`, `recovery_action`).
//! Library failures that callers handle in code use `thiserror` enums.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::FlowPollingStatus;

/// Coarse origin of a failure, derived from its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Rpc,
    Unknown,
}

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    CheckConnection,
    CheckRpcStatus,
    ContactSupport,
    None,
}

/// Which non-success status a poll failure maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollErrorKind {
    TxError,
    PollingError,
    PollingTimeout,
    UserActionRequired,
}

impl PollErrorKind {
    pub fn flow_status(&self) -> FlowPollingStatus {
        match self {
            PollErrorKind::TxError => FlowPollingStatus::TxError,
            PollErrorKind::PollingError => FlowPollingStatus::PollingError,
            PollErrorKind::PollingTimeout => FlowPollingStatus::PollingTimeout,
            PollErrorKind::UserActionRequired => FlowPollingStatus::UserActionRequired,
        }
    }
}

/// Structured failure attached to a chain (and, when flow-fatal, to the flow).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollError {
    pub kind: PollErrorKind,
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub category: ErrorCategory,
    pub is_recoverable: bool,
    pub recovery_action: RecoveryAction,
}

pub const CANCELLED_MESSAGE: &str = "cancelled";

impl PollError {
    /// The chain rejected or reverted the transaction.
    pub fn tx_error(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: PollErrorKind::TxError,
            error_type: error_type.into(),
            message: message.into(),
            code: None,
            category: ErrorCategory::Unknown,
            is_recoverable: false,
            recovery_action: RecoveryAction::ContactSupport,
        }
    }

    /// A failure of the tracker itself (RPC, decoding, bookkeeping).
    /// Category and recovery action are derived from the message text.
    pub fn polling(error_type: impl Into<String>, message: impl fmt::Display) -> Self {
        let message = message.to_string();
        let (category, recovery_action) = classify_error(&message);
        Self {
            kind: PollErrorKind::PollingError,
            error_type: error_type.into(),
            message,
            code: None,
            category,
            is_recoverable: true,
            recovery_action,
        }
    }

    /// A binary payload could not be decoded. The decoder message is kept verbatim.
    pub fn decode(err: &DecodeError) -> Self {
        Self {
            kind: PollErrorKind::PollingError,
            error_type: "decode_error".to_string(),
            message: err.to_string(),
            code: None,
            category: ErrorCategory::Unknown,
            is_recoverable: false,
            recovery_action: RecoveryAction::ContactSupport,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: PollErrorKind::PollingTimeout,
            error_type: "polling_timeout".to_string(),
            message: message.into(),
            code: None,
            category: ErrorCategory::Unknown,
            is_recoverable: true,
            recovery_action: RecoveryAction::Retry,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: PollErrorKind::PollingError,
            error_type: "cancelled".to_string(),
            message: CANCELLED_MESSAGE.to_string(),
            code: None,
            category: ErrorCategory::Unknown,
            is_recoverable: true,
            recovery_action: RecoveryAction::Retry,
        }
    }

    /// Progress is blocked on an out-of-band action by the user.
    pub fn user_action(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: PollErrorKind::UserActionRequired,
            error_type: error_type.into(),
            message: message.into(),
            code: None,
            category: ErrorCategory::Unknown,
            is_recoverable: true,
            recovery_action: RecoveryAction::None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == PollErrorKind::PollingError && self.message == CANCELLED_MESSAGE
    }
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

/// Classify an error message into a category and a recovery hint.
///
/// Connection-level failures come first so that "rpc connection refused" is a
/// network problem rather than an RPC one.
pub fn classify_error(message: &str) -> (ErrorCategory, RecoveryAction) {
    let msg = message.to_lowercase();

    let network = [
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "connection closed",
        "dns",
        "error sending request",
        "network",
        "broken pipe",
    ];
    if network.iter().any(|p| msg.contains(p)) {
        return (ErrorCategory::Network, RecoveryAction::CheckConnection);
    }

    if msg.contains("rate limit") || msg.contains("429") || msg.contains("too many requests") {
        return (ErrorCategory::Rpc, RecoveryAction::Retry);
    }

    let rpc = [
        "rpc",
        "jsonrpc",
        "503",
        "502",
        "500",
        "internal error",
        "header not found",
        "block range",
        "query returned more than",
    ];
    if rpc.iter().any(|p| msg.contains(p)) {
        return (ErrorCategory::Rpc, RecoveryAction::CheckRpcStatus);
    }

    (ErrorCategory::Unknown, RecoveryAction::Retry)
}

// ============================================================================
// Library errors
// ============================================================================

/// Failure decoding a CCTP binary payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{what} too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("ABI offset {offset} is outside payload of {len} bytes")]
    OffsetOutOfBounds { offset: usize, len: usize },

    #[error("ABI bytes payload is empty")]
    EmptyPayload,

    #[error("ABI bytes length {length} at offset {offset} exceeds payload of {len} bytes")]
    LengthOutOfBounds {
        offset: usize,
        length: usize,
        len: usize,
    },

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid base64: {0}")]
    InvalidBase64(String),
}

/// Failure of an orchestrator operation (not of the polled flow itself).
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("flow {0} not found")]
    NotFound(String),

    #[error("cannot {operation} flow {tx_id} in status {status}")]
    InvalidTransition {
        tx_id: String,
        status: FlowPollingStatus,
        operation: &'static str,
    },

    #[error("flow {0} is already being polled")]
    AlreadyRunning(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure of the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to serialize polling state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_network_errors() {
        let (category, action) = classify_error("error sending request: connection refused");
        assert_eq!(category, ErrorCategory::Network);
        assert_eq!(action, RecoveryAction::CheckConnection);

        let (category, _) = classify_error("operation timed out");
        assert_eq!(category, ErrorCategory::Network);
    }

    #[test]
    fn test_classify_rpc_errors() {
        let (category, action) = classify_error("RPC error: -32000 header not found");
        assert_eq!(category, ErrorCategory::Rpc);
        assert_eq!(action, RecoveryAction::CheckRpcStatus);

        let (category, action) = classify_error("HTTP 429 Too Many Requests");
        assert_eq!(category, ErrorCategory::Rpc);
        assert_eq!(action, RecoveryAction::Retry);
    }

    #[test]
    fn test_classify_unknown() {
        let (category, action) = classify_error("something odd happened");
        assert_eq!(category, ErrorCategory::Unknown);
        assert_eq!(action, RecoveryAction::Retry);
    }

    #[test]
    fn test_decode_error_message_preserved() {
        let err = DecodeError::TooShort {
            what: "message",
            expected: 116,
            actual: 10,
        };
        let poll = PollError::decode(&err);
        assert_eq!(poll.kind, PollErrorKind::PollingError);
        assert_eq!(
            poll.message,
            "message too short: expected at least 116 bytes, got 10"
        );
        assert!(!poll.is_recoverable);
    }

    #[test]
    fn test_cancelled_error() {
        let err = PollError::cancelled();
        assert!(err.is_cancelled());
        assert!(!PollError::polling("rpc_error", "boom").is_cancelled());
    }

    #[test]
    fn test_poll_error_serializes_snake_case() {
        let err = PollError::user_action("forwarding_not_registered", "register it")
            .with_code("noble_forwarding");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "user_action_required");
        assert_eq!(json["recovery_action"], "none");
        assert_eq!(json["code"], "noble_forwarding");
    }
}
