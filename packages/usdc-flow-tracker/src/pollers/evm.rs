//! EVM poller
//!
//! - Deposit source: wait for the burn receipt, decode `MessageSent` from the
//!   message transmitter, verify it against the flow, then wait for the
//!   attestation.
//! - Payment destination: scan `eth_getLogs` in fixed-size chunks for the mint,
//!   preferring the nonce-indexed `MessageReceived` and falling back to a USDC
//!   `Transfer` from the zero address.

use std::sync::Arc;

use alloy::primitives::{Address, B256};
use tracing::{debug, info, warn};

use crate::address::{address_to_word, recipient_matches};
use crate::codec::{
    decode_burn_message, decode_message, decode_message_received, extract_abi_bytes, word_to_u128,
};
use crate::error::PollError;
use crate::hash::{event_topic, lookup_id, parse_bytes32, to_hex_prefixed};
use crate::pollers::{PollContext, PollParams, PollResult, PollerDeps, Progress};
use crate::rpc::{EvmLog, EvmRpc, LogQuery};
use crate::types::{stages, ChainKey, FlowPosition};

pub const MESSAGE_SENT_SIGNATURE: &str = "MessageSent(bytes)";
pub const MESSAGE_RECEIVED_SIGNATURE: &str = "MessageReceived(address,uint32,uint64,bytes32,bytes)";
pub const DEPOSIT_FOR_BURN_SIGNATURE: &str =
    "DepositForBurn(uint64,address,uint256,address,bytes32,uint32,bytes32,bytes32)";
pub const TRANSFER_SIGNATURE: &str = "Transfer(address,address,uint256)";

pub const DEFAULT_LOG_CHUNK_SIZE: u64 = 2_000;

#[derive(Debug, Clone)]
pub struct EvmPollerConfig {
    pub message_transmitter: Address,
    pub token_messenger: Address,
    pub usdc: Address,
    /// CCTP domain of this EVM chain.
    pub domain: u32,
    pub noble_domain: u32,
    pub log_chunk_size: u64,
    /// How far behind head to start a mint scan when no start block is known.
    pub lookback_blocks: u64,
}

pub struct EvmPoller {
    rpc: Arc<dyn EvmRpc>,
    deps: Arc<PollerDeps>,
    config: EvmPollerConfig,
}

/// Where a mint was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MintHit {
    tx_hash: Option<B256>,
    block_number: Option<u64>,
}

fn topic(signature: &str) -> B256 {
    B256::from(event_topic(signature))
}

/// A `uint64` indexed topic.
fn nonce_topic(nonce: u64) -> B256 {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&nonce.to_be_bytes());
    B256::from(word)
}

impl EvmPoller {
    pub fn new(rpc: Arc<dyn EvmRpc>, deps: Arc<PollerDeps>, config: EvmPollerConfig) -> Self {
        Self { rpc, deps, config }
    }

    pub async fn poll(&self, params: PollParams) -> PollResult {
        let mut progress = Progress::default();
        let outcome = match params.flow_type.position_of(ChainKey::Evm) {
            FlowPosition::Source => self.poll_burn(&params, &mut progress).await,
            FlowPosition::Destination => self.poll_mint(&params, &mut progress).await,
            FlowPosition::Intermediate => Err(PollError::polling(
                "unsupported_position",
                "EVM is never an intermediate chain",
            )),
        };
        if let Err(e) = &outcome {
            warn!(flow_id = %params.flow_id, chain = "evm", error = %e, "EVM poll ended without success");
        }
        progress.finish(outcome)
    }

    // ========================================================================
    // Deposit source: burn + attestation
    // ========================================================================

    async fn poll_burn(&self, params: &PollParams, progress: &mut Progress) -> Result<(), PollError> {
        let ctx = PollContext::new(params, &self.deps.retry);

        if params.stage_done(stages::EVM_BURN_CONFIRMED) {
            if let Some(hash) = params.metadata.message_hash.clone() {
                progress.found = true;
                return ctx.await_attestation(&self.deps, &hash, progress).await;
            }
        }

        let tx_hash_str = params
            .chain_params
            .tx_hash
            .clone()
            .or_else(|| params.metadata.source_tx_hash.clone())
            .unwrap_or_else(|| params.flow_id.clone());
        let tx_hash = B256::from(parse_bytes32(&tx_hash_str).map_err(|e| PollError::decode(&e))?);
        let tx_hex = to_hex_prefixed(tx_hash.as_slice());

        let receipt = loop {
            ctx.check()?;
            let receipt = ctx
                .call("eth_getTransactionReceipt", || self.rpc.transaction_receipt(tx_hash))
                .await?;
            match receipt {
                Some(receipt) => break receipt,
                None => {
                    debug!(flow_id = %params.flow_id, tx_hash = %tx_hex, "Burn not mined yet");
                    ctx.pause().await?;
                }
            }
        };

        progress.found = true;
        progress.metadata.source_tx_hash = Some(tx_hex.clone());
        if !receipt.success {
            return Err(PollError::tx_error(
                "transaction_reverted",
                format!("burn transaction {} reverted", tx_hex),
            ));
        }

        let message_sent = topic(MESSAGE_SENT_SIGNATURE);
        let Some(log) = receipt
            .logs
            .iter()
            .find(|l| l.address == self.config.message_transmitter && l.topics.first() == Some(&message_sent))
        else {
            if let Some(nonce) = self.deposit_for_burn_nonce(&receipt.logs) {
                progress.metadata.nonce = Some(nonce);
            }
            return Err(PollError::polling(
                "message_extraction_failed",
                format!("message extraction failed: no MessageSent log in {}", tx_hex),
            ));
        };

        let raw = extract_abi_bytes(&log.data).map_err(|e| PollError::decode(&e))?;
        let message = decode_message(&raw).map_err(|e| PollError::decode(&e))?;
        let burn = message.burn_message().map_err(|e| PollError::decode(&e))?;

        let expected_domain = params
            .metadata
            .destination_domain
            .unwrap_or(self.config.noble_domain);
        if message.destination_domain != expected_domain {
            return Err(PollError::tx_error(
                "destination_domain_mismatch",
                format!(
                    "message targets domain {}, expected {}",
                    message.destination_domain, expected_domain
                ),
            ));
        }
        let amount = burn.amount_u128();
        if let Some(expected) = params.metadata.amount {
            if amount != Some(expected) {
                return Err(PollError::tx_error(
                    "amount_mismatch",
                    format!("burned {} but expected {}", burn.amount, expected),
                ));
            }
        }
        if let Some(forwarding) = params.metadata.forwarding_address.as_deref() {
            let matches = recipient_matches(&burn.mint_recipient, forwarding)
                .map_err(|e| PollError::polling("invalid_address", e))?;
            if !matches {
                return Err(PollError::tx_error(
                    "recipient_mismatch",
                    format!("mint recipient does not match {}", forwarding),
                ));
            }
        }

        let message_hash = to_hex_prefixed(&lookup_id(&raw));
        let meta = &mut progress.metadata;
        meta.nonce = Some(message.nonce);
        meta.source_domain = Some(message.source_domain);
        meta.destination_domain = Some(message.destination_domain);
        meta.amount = amount;
        meta.message_bytes = Some(to_hex_prefixed(&raw));
        meta.message_hash = Some(message_hash.clone());
        meta.burn_tx_hash = Some(tx_hex.clone());

        let block = self
            .deps
            .blocks
            .resolve(
                self.rpc.as_ref(),
                receipt.block_number.into(),
                Some(tx_hex.clone()),
                &params.cancel,
            )
            .await;
        progress.details.extend(block.into_details());
        progress.stage(stages::EVM_BURN_CONFIRMED, Some(tx_hex.clone()));
        info!(
            flow_id = %params.flow_id,
            tx_hash = %tx_hex,
            nonce = message.nonce,
            message_hash = %message_hash,
            "Burn confirmed"
        );

        ctx.await_attestation(&self.deps, &message_hash, progress).await
    }

    /// Nonce from a `DepositForBurn` log (topic1) emitted by the token messenger.
    fn deposit_for_burn_nonce(&self, logs: &[EvmLog]) -> Option<u64> {
        let deposit = topic(DEPOSIT_FOR_BURN_SIGNATURE);
        logs.iter()
            .find(|l| l.address == self.config.token_messenger && l.topics.first() == Some(&deposit))
            .and_then(|l| l.topics.get(1))
            .and_then(|t| word_to_u128(t.as_slice()))
            .and_then(|n| u64::try_from(n).ok())
    }

    // ========================================================================
    // Payment destination: chunked mint scan
    // ========================================================================

    async fn poll_mint(&self, params: &PollParams, progress: &mut Progress) -> Result<(), PollError> {
        let ctx = PollContext::new(params, &self.deps.retry);
        let metadata = &params.metadata;

        if metadata.nonce.is_none() && (metadata.recipient.is_none() || metadata.amount.is_none()) {
            return Err(PollError::polling(
                "missing_metadata",
                "mint scan needs a nonce, or a recipient and an amount",
            ));
        }

        let mut from = match params.chain_params.start_block.or(metadata.start_block) {
            Some(block) => block,
            None => {
                let head = ctx.call("eth_blockNumber", || self.rpc.block_number()).await?;
                head.saturating_sub(self.config.lookback_blocks)
            }
        };
        let chunk = self.config.log_chunk_size.max(1);

        loop {
            ctx.check()?;
            let head = ctx.call("eth_blockNumber", || self.rpc.block_number()).await?;

            while from <= head {
                ctx.check()?;
                let to = head.min(from.saturating_add(chunk - 1));
                if let Some(hit) = self.scan_chunk(&ctx, params, from, to).await? {
                    return self.record_mint(params, progress, hit).await;
                }
                from = to + 1;
            }

            debug!(flow_id = %params.flow_id, next_block = from, head, "Mint scan caught up");
            ctx.pause().await?;
        }
    }

    async fn scan_chunk(
        &self,
        ctx: &PollContext<'_>,
        params: &PollParams,
        from: u64,
        to: u64,
    ) -> Result<Option<MintHit>, PollError> {
        let metadata = &params.metadata;

        let query = match metadata.nonce {
            Some(nonce) => LogQuery {
                address: self.config.message_transmitter,
                topic0: topic(MESSAGE_RECEIVED_SIGNATURE),
                topic1: None,
                topic2: Some(nonce_topic(nonce)),
                from_block: from,
                to_block: to,
            },
            None => {
                let recipient = metadata.recipient.as_deref().unwrap_or_default();
                let word = address_to_word(recipient)
                    .map_err(|e| PollError::polling("invalid_address", e))?;
                LogQuery {
                    address: self.config.usdc,
                    topic0: topic(TRANSFER_SIGNATURE),
                    topic1: Some(B256::ZERO),
                    topic2: Some(B256::from(word)),
                    from_block: from,
                    to_block: to,
                }
            }
        };

        let mut logs = ctx.call("eth_getLogs", || self.rpc.get_logs(&query)).await?;
        logs.retain(|l| l.matches(&query));
        logs.sort_by_key(|l| (l.block_number, l.log_index));

        for log in &logs {
            let hit = if metadata.nonce.is_some() {
                self.check_message_received(params, log)?
            } else {
                self.check_transfer(params, log)
            };
            if hit {
                return Ok(Some(MintHit {
                    tx_hash: log.transaction_hash,
                    block_number: log.block_number,
                }));
            }
        }
        Ok(None)
    }

    /// A nonce-matching `MessageReceived` from the expected domain must carry
    /// a burn for the expected recipient and amount.
    fn check_message_received(&self, params: &PollParams, log: &EvmLog) -> Result<bool, PollError> {
        let metadata = &params.metadata;
        let data = decode_message_received(&log.data).map_err(|e| PollError::decode(&e))?;

        let expected_domain = metadata.source_domain.unwrap_or(self.config.noble_domain);
        if data.source_domain != expected_domain {
            return Ok(false);
        }

        let burn = decode_burn_message(&data.message_body)
            .map_err(|e| PollError::decode(&e))?;
        if let Some(expected) = metadata.amount {
            if burn.amount_u128() != Some(expected) {
                return Err(PollError::tx_error(
                    "amount_mismatch",
                    format!("minted {} but expected {}", burn.amount, expected),
                ));
            }
        }
        if let Some(recipient) = metadata.recipient.as_deref() {
            let matches = recipient_matches(&burn.mint_recipient, recipient)
                .map_err(|e| PollError::polling("invalid_address", e))?;
            if !matches {
                return Err(PollError::tx_error(
                    "recipient_mismatch",
                    format!("mint recipient does not match {}", recipient),
                ));
            }
        }
        Ok(true)
    }

    /// A mint-like `Transfer` must move exactly the expected amount.
    fn check_transfer(&self, params: &PollParams, log: &EvmLog) -> bool {
        params.metadata.amount.is_some() && word_to_u128(&log.data) == params.metadata.amount
    }

    async fn record_mint(
        &self,
        params: &PollParams,
        progress: &mut Progress,
        hit: MintHit,
    ) -> Result<(), PollError> {
        let tx_hex = hit.tx_hash.map(|h| to_hex_prefixed(h.as_slice()));
        progress.found = true;
        progress.metadata.destination_tx_hash = tx_hex.clone();
        progress.metadata.block_number = hit.block_number;

        let block = self
            .deps
            .blocks
            .resolve(
                self.rpc.as_ref(),
                hit.block_number.into(),
                tx_hex.clone(),
                &params.cancel,
            )
            .await;
        progress.details.extend(block.into_details());
        progress.stage(stages::EVM_MINT_CONFIRMED, tx_hex.clone());
        info!(
            flow_id = %params.flow_id,
            tx_hash = tx_hex.as_deref().unwrap_or("unknown"),
            block = hit.block_number,
            "Mint confirmed"
        );
        Ok(())
    }
}
