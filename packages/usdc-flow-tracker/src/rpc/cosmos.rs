//! CometBFT RPC and LCD access for Noble and Namada.
//!
//! Height and block time come from `tendermint-rpc`. Event queries go through
//! the JSON endpoints directly (`tx_search`, `block_results`) so attribute
//! values are read exactly as the node serves them.

use std::time::Duration;

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Deserializer};
use tendermint_rpc::{Client, HttpClient, Url};

use crate::block_meta::BlockSource;

/// An ABCI event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TxEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<EventAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventAttribute {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl TxEvent {
    pub fn new(kind: &str, attributes: &[(&str, &str)]) -> Self {
        Self {
            kind: kind.to_string(),
            attributes: attributes
                .iter()
                .map(|(k, v)| EventAttribute {
                    key: k.to_string(),
                    value: Some(v.to_string()),
                })
                .collect(),
        }
    }

    /// Attribute value with JSON string quoting removed.
    ///
    /// Typed (protobuf) events such as `circle.cctp.v1.MessageSent` store
    /// values as JSON, so `"\"42\""` and `"42"` both read as `42`.
    pub fn attr(&self, key: &str) -> Option<String> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .and_then(|a| a.value.as_deref())
            .map(unquote)
    }

    pub fn attr_u64(&self, key: &str) -> Option<u64> {
        self.attr(key).and_then(|v| v.parse().ok())
    }
}

fn unquote(value: &str) -> String {
    match serde_json::from_str::<String>(value) {
        Ok(inner) => inner,
        Err(_) => value.to_string(),
    }
}

/// Events emitted by one transaction. Block-level events (end/finalize block)
/// are returned as a pseudo-transaction without a hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosmosTx {
    pub hash: Option<String>,
    pub code: u32,
    pub events: Vec<TxEvent>,
}

impl CosmosTx {
    pub fn events_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a TxEvent> + 'a {
        self.events.iter().filter(move |e| e.kind == kind)
    }
}

/// How to read one height's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeightQuery {
    /// `tx_search` for `tx.height=H`: per-tx events with hashes.
    TxSearch,
    /// `block_results`: per-tx results plus block-level events.
    BlockResults,
}

/// Noble forwarding account for `(channel, recipient)`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ForwardingAccount {
    pub address: String,
    #[serde(default)]
    pub exists: bool,
}

#[async_trait]
pub trait CosmosRpc: BlockSource {
    async fn latest_height(&self) -> Result<u64>;

    async fn events_at(&self, height: u64, query: HeightQuery) -> Result<Vec<CosmosTx>>;

    /// Noble-only LCD query.
    async fn forwarding_account(&self, channel: &str, recipient: &str)
        -> Result<ForwardingAccount>;
}

// ============================================================================
// JSON response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TxSearchResult {
    #[serde(default)]
    txs: Vec<TxSearchEntry>,
}

#[derive(Debug, Deserialize)]
struct TxSearchEntry {
    hash: String,
    tx_result: TxResult,
}

#[derive(Debug, Default, Deserialize)]
struct TxResult {
    #[serde(default)]
    code: u32,
    #[serde(default, deserialize_with = "null_as_empty")]
    events: Vec<TxEvent>,
}

#[derive(Debug, Deserialize)]
struct BlockResultsResult {
    #[serde(default, deserialize_with = "null_as_empty")]
    txs_results: Vec<TxResult>,
    #[serde(default, deserialize_with = "null_as_empty")]
    begin_block_events: Vec<TxEvent>,
    #[serde(default, deserialize_with = "null_as_empty")]
    end_block_events: Vec<TxEvent>,
    #[serde(default, deserialize_with = "null_as_empty")]
    finalize_block_events: Vec<TxEvent>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================================================
// CometBFT client
// ============================================================================

pub struct CometRpc {
    name: &'static str,
    rpc_client: HttpClient,
    rpc_url: String,
    lcd_url: Option<String>,
    http: reqwest::Client,
}

impl CometRpc {
    pub fn new(name: &'static str, rpc_url: &str, lcd_url: Option<String>) -> Result<Self> {
        let url: Url = rpc_url.parse().wrap_err("Failed to parse RPC URL")?;
        let rpc_client = HttpClient::new(url).wrap_err("Failed to create RPC client")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            name,
            rpc_client,
            rpc_url: rpc_url.trim_end_matches('/').to_string(),
            lcd_url: lcd_url.map(|u| u.trim_end_matches('/').to_string()),
            http,
        })
    }

    async fn json_rpc<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/{}", self.rpc_url, path);
        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .wrap_err_with(|| format!("{} {} request failed", self.name, path))?
            .json::<JsonRpcResponse<T>>()
            .await
            .wrap_err_with(|| format!("Failed to parse {} {} response", self.name, path))?;

        if let Some(error) = response.error {
            return Err(eyre!(
                "RPC error: {} - {} {}",
                error.code,
                error.message,
                error.data.unwrap_or_default()
            ));
        }
        response
            .result
            .ok_or_else(|| eyre!("{} {} returned no result", self.name, path))
    }

    async fn tx_search(&self, height: u64) -> Result<Vec<CosmosTx>> {
        let result: TxSearchResult = self
            .json_rpc(
                "tx_search",
                &[
                    ("query", format!("\"tx.height={}\"", height)),
                    ("prove", "false".to_string()),
                    ("page", "1".to_string()),
                    ("per_page", "100".to_string()),
                    ("order_by", "\"asc\"".to_string()),
                ],
            )
            .await?;

        Ok(result
            .txs
            .into_iter()
            .map(|tx| CosmosTx {
                hash: Some(tx.hash),
                code: tx.tx_result.code,
                events: tx.tx_result.events,
            })
            .collect())
    }

    async fn block_results(&self, height: u64) -> Result<Vec<CosmosTx>> {
        let result: BlockResultsResult = self
            .json_rpc("block_results", &[("height", height.to_string())])
            .await?;

        let mut txs: Vec<CosmosTx> = result
            .txs_results
            .into_iter()
            .map(|tx| CosmosTx {
                hash: None,
                code: tx.code,
                events: tx.events,
            })
            .collect();

        let block_events: Vec<TxEvent> = result
            .begin_block_events
            .into_iter()
            .chain(result.end_block_events)
            .chain(result.finalize_block_events)
            .collect();
        if !block_events.is_empty() {
            txs.push(CosmosTx {
                hash: None,
                code: 0,
                events: block_events,
            });
        }
        Ok(txs)
    }
}

#[async_trait]
impl BlockSource for CometRpc {
    async fn block_timestamp(&self, height: u64) -> Result<Option<i64>> {
        let height = tendermint::block::Height::try_from(height)
            .map_err(|e| eyre!("Invalid height {}: {}", height, e))?;
        let block = self
            .rpc_client
            .block(height)
            .await
            .wrap_err_with(|| format!("Failed to get {} block", self.name))?;
        Ok(Some(block.block.header.time.unix_timestamp()))
    }
}

#[async_trait]
impl CosmosRpc for CometRpc {
    async fn latest_height(&self) -> Result<u64> {
        let status = self
            .rpc_client
            .status()
            .await
            .wrap_err_with(|| format!("Failed to get {} status", self.name))?;
        Ok(status.sync_info.latest_block_height.value())
    }

    async fn events_at(&self, height: u64, query: HeightQuery) -> Result<Vec<CosmosTx>> {
        match query {
            HeightQuery::TxSearch => self.tx_search(height).await,
            HeightQuery::BlockResults => self.block_results(height).await,
        }
    }

    async fn forwarding_account(
        &self,
        channel: &str,
        recipient: &str,
    ) -> Result<ForwardingAccount> {
        let lcd = self
            .lcd_url
            .as_ref()
            .ok_or_else(|| eyre!("{} LCD URL not configured", self.name))?;
        let url = format!(
            "{}/noble/forwarding/v1/address/{}/{}/",
            lcd, channel, recipient
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .wrap_err("Failed to query forwarding address")?;
        if !response.status().is_success() {
            return Err(eyre!(
                "Forwarding query returned HTTP {}",
                response.status().as_u16()
            ));
        }
        response
            .json::<ForwardingAccount>()
            .await
            .wrap_err("Failed to parse forwarding address response")
    }
}
