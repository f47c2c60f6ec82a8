//! Tracker configuration

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};

use crate::orchestrator::OrchestratorConfig;
use crate::pollers::evm::DEFAULT_LOG_CHUNK_SIZE;
use crate::pollers::noble::DEFAULT_MAX_HEIGHTS_PER_PASS;
use crate::pollers::{EvmPollerConfig, NamadaPollerConfig, NoblePollerConfig};
use crate::retry::RetryConfig;
use crate::rpc::evm::parse_rpc_urls;

/// CCTP domain of Noble.
pub const DEFAULT_NOBLE_DOMAIN: u32 = 4;

/// Wraps a secret so it never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Redacted<T>(T);

impl<T> Redacted<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Tracker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// EVM RPC URLs, tried in order
    pub evm_rpc_urls: Vec<String>,
    pub evm_message_transmitter: Address,
    pub evm_token_messenger: Address,
    pub evm_usdc_address: Address,
    /// CCTP domain of the EVM chain
    pub evm_domain: u32,
    /// Blocks per `eth_getLogs` call
    pub evm_log_chunk_size: u64,
    /// How far back a mint scan starts when the caller gives no start block
    pub evm_lookback_blocks: u64,

    pub noble_rpc_url: String,
    /// Needed for forwarding account lookups
    pub noble_lcd_url: Option<String>,
    pub noble_domain: u32,
    /// IBC channel on Noble towards Namada
    pub noble_to_namada_channel: String,
    /// IBC channel on Namada towards Noble
    pub namada_to_noble_channel: String,
    pub noble_lookback_heights: u64,

    pub namada_rpc_url: String,
    pub namada_lookback_heights: u64,

    /// Heights fetched per pass before sleeping, on both Cosmos chains
    pub cosmos_max_heights_per_pass: u64,

    pub attestation_api_url: String,
    pub attestation_timeout_secs: u64,
    pub attestation_interval_ms: u64,

    /// Default interval between polls, in milliseconds
    pub poll_interval_ms: u64,
    /// Default deadline of a whole flow
    pub flow_timeout_secs: u64,

    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    /// Postgres URL. The in-memory store is used when unset.
    pub database_url: Option<Redacted<String>>,
    pub database_max_connections: u32,

    pub api_bind_address: String,
    pub api_port: u16,
}

impl Config {
    /// Load configuration from environment
    pub fn load() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded .env from {:?}", path);
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from explicit key/value pairs.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let evm_rpc_urls = parse_rpc_urls(&vars.required("EVM_RPC_URL")?);
        if evm_rpc_urls.is_empty() {
            return Err(eyre!("EVM_RPC_URL cannot be empty"));
        }

        let database_url = vars
            .optional("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .map(Redacted::new);

        Ok(Self {
            evm_rpc_urls,
            evm_message_transmitter: vars.required_parsed("EVM_MESSAGE_TRANSMITTER")?,
            evm_token_messenger: vars.required_parsed("EVM_TOKEN_MESSENGER")?,
            evm_usdc_address: vars.required_parsed("EVM_USDC_ADDRESS")?,
            evm_domain: vars.parsed_or("EVM_DOMAIN", 0)?,
            evm_log_chunk_size: vars.parsed_or("EVM_LOG_CHUNK_SIZE", DEFAULT_LOG_CHUNK_SIZE)?,
            evm_lookback_blocks: vars.parsed_or("EVM_LOOKBACK_BLOCKS", 10_000)?,

            noble_rpc_url: vars.required("NOBLE_RPC_URL")?,
            noble_lcd_url: vars.optional("NOBLE_LCD_URL"),
            noble_domain: vars.parsed_or("NOBLE_DOMAIN", DEFAULT_NOBLE_DOMAIN)?,
            noble_to_namada_channel: vars.required("NOBLE_TO_NAMADA_CHANNEL")?,
            namada_to_noble_channel: vars.required("NAMADA_TO_NOBLE_CHANNEL")?,
            noble_lookback_heights: vars.parsed_or("NOBLE_LOOKBACK_HEIGHTS", 1_000)?,

            namada_rpc_url: vars.required("NAMADA_RPC_URL")?,
            namada_lookback_heights: vars.parsed_or("NAMADA_LOOKBACK_HEIGHTS", 1_000)?,

            cosmos_max_heights_per_pass: vars
                .parsed_or("COSMOS_MAX_HEIGHTS_PER_PASS", DEFAULT_MAX_HEIGHTS_PER_PASS)?,

            attestation_api_url: vars.required("ATTESTATION_API_URL")?,
            attestation_timeout_secs: vars.parsed_or("ATTESTATION_TIMEOUT_SECS", 1_800)?,
            attestation_interval_ms: vars.parsed_or("ATTESTATION_INTERVAL_MS", 5_000)?,

            poll_interval_ms: vars.parsed_or("POLL_INTERVAL_MS", 5_000)?,
            flow_timeout_secs: vars.parsed_or("FLOW_TIMEOUT_SECS", 3_600)?,

            retry_max_attempts: vars.parsed_or("RETRY_MAX_ATTEMPTS", 3)?,
            retry_initial_delay_ms: vars.parsed_or("RETRY_INITIAL_DELAY_MS", 500)?,
            retry_max_delay_ms: vars.parsed_or("RETRY_MAX_DELAY_MS", 10_000)?,

            database_url,
            database_max_connections: vars.parsed_or("DATABASE_MAX_CONNECTIONS", 5)?,

            api_bind_address: vars
                .optional("API_BIND_ADDRESS")
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            api_port: vars.parsed_or("API_PORT", 9100)?,
        })
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_bind_address, self.api_port)
            .parse()
            .wrap_err("API_BIND_ADDRESS and API_PORT must form a socket address")
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts.max(1),
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            flow_timeout: Duration::from_secs(self.flow_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn evm_poller(&self) -> EvmPollerConfig {
        EvmPollerConfig {
            message_transmitter: self.evm_message_transmitter,
            token_messenger: self.evm_token_messenger,
            usdc: self.evm_usdc_address,
            domain: self.evm_domain,
            noble_domain: self.noble_domain,
            log_chunk_size: self.evm_log_chunk_size,
            lookback_blocks: self.evm_lookback_blocks,
        }
    }

    pub fn noble_poller(&self) -> NoblePollerConfig {
        NoblePollerConfig {
            noble_domain: self.noble_domain,
            evm_domain: self.evm_domain,
            noble_to_namada_channel: self.noble_to_namada_channel.clone(),
            namada_to_noble_channel: self.namada_to_noble_channel.clone(),
            lookback_heights: self.noble_lookback_heights,
            max_heights_per_pass: self.cosmos_max_heights_per_pass,
        }
    }

    pub fn namada_poller(&self) -> NamadaPollerConfig {
        NamadaPollerConfig {
            noble_to_namada_channel: self.noble_to_namada_channel.clone(),
            namada_to_noble_channel: self.namada_to_noble_channel.clone(),
            lookback_heights: self.namada_lookback_heights,
            max_heights_per_pass: self.cosmos_max_heights_per_pass,
        }
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.optional(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| eyre!("{} environment variable is required", key))
    }

    fn required_parsed<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.required(key)?;
        raw.parse()
            .map_err(|e| eyre!("{} has an invalid value {:?}: {}", key, raw, e))
    }

    fn parsed_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.optional(key).filter(|v| !v.is_empty()) {
            Some(raw) => raw
                .parse()
                .map_err(|e| eyre!("{} has an invalid value {:?}: {}", key, raw, e)),
            None => Ok(default),
        }
    }
}
