//! USDC Flow Tracker
//!
//! Follows USDC as it moves between an EVM chain and Namada through Circle's
//! CCTP and Noble:
//!
//! - **deposit**: EVM burn, attestation, Noble mint and auto-forward, Namada IBC receipt
//! - **payment**: Namada IBC send, Noble receipt and burn, attestation, EVM mint
//!
//! The [`orchestrator`] polls one chain at a time in flow order and persists a
//! [`state::PollingState`] after every chain so that tracking survives restarts.

pub mod address;
pub mod attestation;
pub mod block_meta;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod hash;
pub mod metadata;
pub mod metrics;
pub mod orchestrator;
pub mod pollers;
pub mod retry;
pub mod rpc;
pub mod server;
pub mod state;
pub mod store;
pub mod types;

pub use error::{OrchestratorError, PollError, StoreError};
pub use metadata::FlowMetadata;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use state::{FlowSnapshot, PollingState, TrackRequest};
pub use types::{ChainKey, FlowPollingStatus, FlowType};
