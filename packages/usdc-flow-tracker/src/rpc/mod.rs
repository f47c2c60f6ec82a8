//! Chain RPC seams used by the pollers.

pub mod cosmos;
pub mod evm;

pub use cosmos::{CometRpc, CosmosRpc, CosmosTx, ForwardingAccount, HeightQuery, TxEvent};
pub use evm::{AlloyEvmRpc, EvmLog, EvmReceipt, EvmRpc, LogQuery};
