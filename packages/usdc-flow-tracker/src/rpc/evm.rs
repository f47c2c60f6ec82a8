//! EVM JSON-RPC access.
//!
//! Pollers see the chain through [`EvmRpc`]. The production implementation
//! wraps one alloy HTTP provider per configured URL and falls through them in
//! order, so a flaky primary endpoint does not stall tracking.

use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::Filter;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use tracing::warn;

use crate::block_meta::BlockSource;

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `eth_getLogs` parameters for one contract and one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub address: Address,
    pub topic0: B256,
    pub topic1: Option<B256>,
    pub topic2: Option<B256>,
    pub from_block: u64,
    pub to_block: u64,
}

/// A log, reduced to the fields pollers read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<u64>,
}

impl EvmLog {
    /// Whether this log satisfies the address, topic and range filters of `query`.
    pub fn matches(&self, query: &LogQuery) -> bool {
        let topic_ok = |i: usize, expected: Option<B256>| match expected {
            Some(t) => self.topics.get(i) == Some(&t),
            None => true,
        };
        let in_range = self
            .block_number
            .is_some_and(|b| b >= query.from_block && b <= query.to_block);

        self.address == query.address
            && topic_ok(0, Some(query.topic0))
            && topic_ok(1, query.topic1)
            && topic_ok(2, query.topic2)
            && in_range
    }
}

impl From<alloy::rpc::types::Log> for EvmLog {
    fn from(log: alloy::rpc::types::Log) -> Self {
        Self {
            address: log.address(),
            topics: log.topics().to_vec(),
            data: log.data().data.to_vec(),
            block_number: log.block_number,
            transaction_hash: log.transaction_hash,
            log_index: log.log_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmReceipt {
    pub transaction_hash: B256,
    pub success: bool,
    pub block_number: Option<u64>,
    pub logs: Vec<EvmLog>,
}

#[async_trait]
pub trait EvmRpc: BlockSource {
    async fn block_number(&self) -> Result<u64>;

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<EvmLog>>;

    /// None while the transaction is not mined.
    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<EvmReceipt>>;
}

// ============================================================================
// alloy-backed implementation
// ============================================================================

/// Block header fields read through raw JSON-RPC.
#[derive(Debug, Deserialize)]
struct BlockHeader {
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

pub struct AlloyEvmRpc {
    providers: Vec<RootProvider<Http<Client>>>,
    urls: Vec<String>,
    http: reqwest::Client,
}

impl AlloyEvmRpc {
    pub fn new(urls: &[String]) -> Result<Self> {
        if urls.is_empty() {
            return Err(eyre!("At least one EVM RPC URL is required"));
        }
        let providers = urls
            .iter()
            .map(|url| {
                let parsed = url
                    .parse()
                    .wrap_err_with(|| format!("Invalid RPC URL: {}", url))?;
                Ok(ProviderBuilder::new().on_http(parsed))
            })
            .collect::<Result<Vec<_>>>()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            providers,
            urls: urls.to_vec(),
            http,
        })
    }

    async fn block_timestamp_at(&self, url: &str, height: u64) -> Result<Option<i64>> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_getBlockByNumber",
            "params": [format!("0x{:x}", height), false],
            "id": 1
        });

        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await?
            .json::<RpcResponse<BlockHeader>>()
            .await?;

        if let Some(error) = response.error {
            return Err(eyre!("RPC error: {} - {}", error.code, error.message));
        }

        match response.result {
            Some(header) => {
                let ts = i64::from_str_radix(header.timestamp.trim_start_matches("0x"), 16)
                    .wrap_err("Invalid block timestamp")?;
                Ok(Some(ts))
            }
            None => Ok(None),
        }
    }
}

/// Try each provider in order and return the first success.
macro_rules! with_fallback {
    ($self:ident, $method:literal, |$provider:ident, $url:ident| $call:expr) => {{
        let mut last_error = String::new();
        for ($provider, $url) in $self.providers.iter().zip($self.urls.iter()) {
            match $call {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        rpc = %$url,
                        method = $method,
                        error = %e,
                        "EVM RPC call failed, trying next endpoint"
                    );
                    last_error = e.to_string();
                }
            }
        }
        Err(eyre!(
            "{} failed on all {} RPC endpoints: {}",
            $method,
            $self.urls.len(),
            last_error
        ))
    }};
}

#[async_trait]
impl BlockSource for AlloyEvmRpc {
    async fn block_timestamp(&self, height: u64) -> Result<Option<i64>> {
        with_fallback!(self, "eth_getBlockByNumber", |_provider, url| self
            .block_timestamp_at(url, height)
            .await)
    }
}

#[async_trait]
impl EvmRpc for AlloyEvmRpc {
    async fn block_number(&self) -> Result<u64> {
        with_fallback!(self, "eth_blockNumber", |provider, _url| provider
            .get_block_number()
            .await)
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<EvmLog>> {
        let mut filter = Filter::new()
            .address(query.address)
            .event_signature(query.topic0)
            .from_block(query.from_block)
            .to_block(query.to_block);
        if let Some(topic) = query.topic1 {
            filter = filter.topic1(topic);
        }
        if let Some(topic) = query.topic2 {
            filter = filter.topic2(topic);
        }

        with_fallback!(self, "eth_getLogs", |provider, _url| provider
            .get_logs(&filter)
            .await
            .map(|logs| logs.into_iter().map(EvmLog::from).collect()))
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<EvmReceipt>> {
        with_fallback!(self, "eth_getTransactionReceipt", |provider, _url| provider
            .get_transaction_receipt(tx_hash)
            .await
            .map(|receipt| {
                receipt.map(|r| EvmReceipt {
                    transaction_hash: r.transaction_hash,
                    success: r.status(),
                    block_number: r.block_number,
                    logs: r.inner.logs().iter().cloned().map(EvmLog::from).collect(),
                })
            }))
    }
}
