//! Noble poller
//!
//! Deposit (intermediate): CCTP mint into the forwarding account, forwarding
//! registration over LCD, then the IBC transfer on to Namada.
//!
//! Payment (intermediate): IBC receipt from Namada, then the CCTP burn towards
//! the EVM chain and its attestation.

use std::sync::Arc;

use base64::Engine;
use tracing::{debug, info, warn};

use crate::address::{recipient_matches, same_address};
use crate::codec::{decode_message, Message};
use crate::error::{DecodeError, PollError};
use crate::hash::{lookup_id, to_hex_prefixed};
use crate::metadata::FlowMetadata;
use crate::pollers::ibc::{find_packet, RECV_PACKET, SEND_PACKET, USDC_DENOM};
use crate::pollers::scan::HeightScanner;
use crate::pollers::{PollContext, PollParams, PollResult, PollerDeps, Progress};
use crate::rpc::{CosmosRpc, CosmosTx, HeightQuery};
use crate::types::{stages, ChainKey, FlowPosition, FlowType};

pub const MESSAGE_RECEIVED_EVENT: &str = "circle.cctp.v1.MessageReceived";
pub const MESSAGE_SENT_EVENT: &str = "circle.cctp.v1.MessageSent";
pub const COIN_RECEIVED_EVENT: &str = "coin_received";

pub const DEFAULT_MAX_HEIGHTS_PER_PASS: u64 = 50;

#[derive(Debug, Clone)]
pub struct NoblePollerConfig {
    pub noble_domain: u32,
    pub evm_domain: u32,
    /// Channel on Noble towards Namada.
    pub noble_to_namada_channel: String,
    /// Channel on Namada towards Noble.
    pub namada_to_noble_channel: String,
    pub lookback_heights: u64,
    pub max_heights_per_pass: u64,
}

pub struct NoblePoller {
    rpc: Arc<dyn CosmosRpc>,
    deps: Arc<PollerDeps>,
    config: NoblePollerConfig,
}

/// A CCTP burn found in a `MessageSent` event.
struct BurnHit {
    raw: Vec<u8>,
    message: Message,
    tx_hash: Option<String>,
}

impl NoblePoller {
    pub fn new(rpc: Arc<dyn CosmosRpc>, deps: Arc<PollerDeps>, config: NoblePollerConfig) -> Self {
        Self { rpc, deps, config }
    }

    pub async fn poll(&self, params: PollParams) -> PollResult {
        let mut progress = Progress::default();
        let outcome = match params.flow_type.position_of(ChainKey::Noble) {
            FlowPosition::Intermediate => match params.flow_type {
                FlowType::Deposit => self.poll_deposit(&params, &mut progress).await,
                FlowType::Payment => self.poll_payment(&params, &mut progress).await,
            },
            position => Err(PollError::polling(
                "unsupported_position",
                format!("Noble cannot be the {:?} chain", position),
            )),
        };
        if let Err(e) = &outcome {
            warn!(flow_id = %params.flow_id, chain = "noble", error = %e, "Noble poll ended without success");
        }
        progress.finish(outcome)
    }

    fn scanner(&self) -> HeightScanner<'_> {
        HeightScanner {
            rpc: self.rpc.as_ref(),
            query: HeightQuery::TxSearch,
            max_heights_per_pass: self.config.max_heights_per_pass,
        }
    }

    async fn start_height(&self, ctx: &PollContext<'_>, params: &PollParams) -> Result<u64, PollError> {
        match params.chain_params.start_block.or(params.metadata.noble_start_height) {
            Some(height) => Ok(height),
            None => self.scanner().default_start(ctx, self.config.lookback_heights).await,
        }
    }

    async fn record_block(
        &self,
        params: &PollParams,
        progress: &mut Progress,
        height: u64,
        tx_hash: Option<String>,
    ) {
        let block = self
            .deps
            .blocks
            .resolve(self.rpc.as_ref(), Some(height).into(), tx_hash, &params.cancel)
            .await;
        progress.details.extend(block.into_details());
    }

    // ========================================================================
    // Deposit: mint -> forwarding registration -> IBC forward
    // ========================================================================

    async fn poll_deposit(&self, params: &PollParams, progress: &mut Progress) -> Result<(), PollError> {
        let ctx = PollContext::new(params, &self.deps.retry);
        let metadata = &params.metadata;
        let Some(recipient) = metadata.recipient.as_deref() else {
            return Err(PollError::polling(
                "missing_metadata",
                "deposit tracking on Noble needs the Namada recipient",
            ));
        };

        let mut next_height = self.start_height(&ctx, params).await?;
        let channel = self.config.noble_to_namada_channel.as_str();
        let mut forwarding = metadata.forwarding_address.clone();

        if !params.stage_done(stages::NOBLE_MINT_CONFIRMED) {
            if metadata.nonce.is_none() && forwarding.is_none() {
                let account = ctx
                    .call("forwarding_account", || self.rpc.forwarding_account(channel, recipient))
                    .await?;
                forwarding = Some(account.address);
            }

            let expected_source = metadata.source_domain.unwrap_or(self.config.evm_domain);
            let (hash, height) = self
                .scanner()
                .find(&ctx, next_height, |_, txs| {
                    Ok(find_mint(txs, metadata, expected_source, forwarding.as_deref()))
                })
                .await?;

            progress.found = true;
            progress.metadata.noble_tx_hash = hash.clone();
            progress.detail("mint_height", height);
            self.record_block(params, progress, height, hash.clone()).await;
            progress.stage(stages::NOBLE_MINT_CONFIRMED, hash.clone());
            info!(flow_id = %params.flow_id, height, tx_hash = ?hash, "Noble mint confirmed");
            next_height = height;
        }

        if params.stage_done(stages::NOBLE_FORWARDED) {
            return Ok(());
        }

        ctx.check()?;
        let account = ctx
            .call("forwarding_account", || self.rpc.forwarding_account(channel, recipient))
            .await?;
        if let Some(expected) = forwarding.as_deref() {
            if !same_address(expected, &account.address) {
                return Err(PollError::tx_error(
                    "forwarding_address_mismatch",
                    format!(
                        "forwarding account for {} is {}, expected {}",
                        recipient, account.address, expected
                    ),
                ));
            }
        }
        progress.metadata.forwarding_address = Some(account.address.clone());
        if !account.exists {
            return Err(PollError::user_action(
                "forwarding_not_registered",
                format!(
                    "forwarding account {} for {} on {} is not registered",
                    account.address, recipient, channel
                ),
            ));
        }

        let ((sequence, hash), height) = self
            .scanner()
            .find(&ctx, next_height, |_, txs| {
                Ok(find_packet(txs, SEND_PACKET, |p| {
                    p.on_channels(channel, None)
                        && p.transfers(Some(&account.address), Some(recipient), metadata.amount)
                }))
            })
            .await?;

        progress.found = true;
        progress.metadata.packet_sequence = Some(sequence);
        progress.metadata.ibc_channel = Some(channel.to_string());
        progress.metadata.denom = Some(USDC_DENOM.to_string());
        progress.detail("forward_height", height);
        self.record_block(params, progress, height, hash.clone()).await;
        progress.stage(stages::NOBLE_FORWARDED, hash);
        info!(flow_id = %params.flow_id, height, sequence, "Noble forward to Namada sent");
        Ok(())
    }

    // ========================================================================
    // Payment: IBC receive -> CCTP burn -> attestation
    // ========================================================================

    async fn poll_payment(&self, params: &PollParams, progress: &mut Progress) -> Result<(), PollError> {
        let ctx = PollContext::new(params, &self.deps.retry);
        let metadata = &params.metadata;

        if params.stage_done(stages::NOBLE_BURNED) {
            if let Some(hash) = metadata.message_hash.clone() {
                progress.found = true;
                return ctx.await_attestation(&self.deps, &hash, progress).await;
            }
        }

        let Some(evm_recipient) = metadata.recipient.as_deref() else {
            return Err(PollError::polling(
                "missing_metadata",
                "payment tracking on Noble needs the EVM recipient",
            ));
        };
        let mut next_height = self.start_height(&ctx, params).await?;

        if !params.stage_done(stages::NOBLE_RECEIVED) {
            let Some(sequence) = metadata.packet_sequence else {
                return Err(PollError::polling(
                    "missing_metadata",
                    "payment tracking on Noble needs the IBC packet sequence",
                ));
            };
            let src = self.config.namada_to_noble_channel.as_str();
            let dst = self.config.noble_to_namada_channel.as_str();
            let ((_, hash), height) = self
                .scanner()
                .find(&ctx, next_height, |_, txs| {
                    Ok(find_packet(txs, RECV_PACKET, |p| {
                        p.sequence == sequence && p.on_channels(src, Some(dst))
                    }))
                })
                .await?;

            progress.found = true;
            progress.detail("receive_height", height);
            progress.stage(stages::NOBLE_RECEIVED, hash);
            info!(flow_id = %params.flow_id, height, sequence, "Noble received IBC transfer");
            next_height = height;
        }

        let (hit, height) = self
            .scanner()
            .find(&ctx, next_height, |_, txs| self.find_burn(txs, metadata, evm_recipient))
            .await?;

        let message_hash = to_hex_prefixed(&lookup_id(&hit.raw));
        progress.found = true;
        let meta = &mut progress.metadata;
        meta.nonce = Some(hit.message.nonce);
        meta.source_domain = Some(hit.message.source_domain);
        meta.destination_domain = Some(hit.message.destination_domain);
        meta.message_bytes = Some(to_hex_prefixed(&hit.raw));
        meta.message_hash = Some(message_hash.clone());
        meta.noble_tx_hash = hit.tx_hash.clone();
        meta.burn_tx_hash = hit.tx_hash.clone();
        progress.detail("burn_height", height);
        self.record_block(params, progress, height, hit.tx_hash.clone()).await;
        progress.stage(stages::NOBLE_BURNED, hit.tx_hash);
        info!(
            flow_id = %params.flow_id,
            height,
            nonce = hit.message.nonce,
            message_hash = %message_hash,
            "Noble burn confirmed"
        );

        ctx.await_attestation(&self.deps, &message_hash, progress).await
    }

    /// First `MessageSent` burning the expected amount for `evm_recipient`.
    ///
    /// Burns for other users share the block, so non-matching messages are
    /// skipped rather than reported. Undecodable payloads are fatal.
    fn find_burn(
        &self,
        txs: &[CosmosTx],
        metadata: &FlowMetadata,
        evm_recipient: &str,
    ) -> Result<Option<BurnHit>, PollError> {
        for tx in txs.iter().filter(|t| t.code == 0) {
            for event in tx.events_of(MESSAGE_SENT_EVENT) {
                let Some(encoded) = event.attr("message") else {
                    continue;
                };
                let raw = decode_base64(&encoded).map_err(|e| PollError::decode(&e))?;
                let message = decode_message(&raw).map_err(|e| PollError::decode(&e))?;
                if message.source_domain != self.config.noble_domain
                    || message.destination_domain != metadata.destination_domain.unwrap_or(self.config.evm_domain)
                {
                    continue;
                }
                let burn = message.burn_message().map_err(|e| PollError::decode(&e))?;
                if metadata.amount.is_some() && burn.amount_u128() != metadata.amount {
                    continue;
                }
                let recipient_ok = recipient_matches(&burn.mint_recipient, evm_recipient)
                    .map_err(|e| PollError::polling("invalid_address", e))?;
                if !recipient_ok {
                    continue;
                }
                debug!(nonce = message.nonce, "Matched Noble MessageSent");
                return Ok(Some(BurnHit {
                    raw,
                    message,
                    tx_hash: tx.hash.clone(),
                }));
            }
        }
        Ok(None)
    }
}

/// Typed events carry `bytes` fields as base64.
fn decode_base64(value: &str) -> Result<Vec<u8>, DecodeError> {
    base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))
}

/// The tx holding the CCTP mint for this flow: by nonce and source domain, or
/// without a nonce by the exact USDC amount credited to the forwarding account.
fn find_mint(
    txs: &[CosmosTx],
    metadata: &FlowMetadata,
    expected_source: u32,
    forwarding: Option<&str>,
) -> Option<Option<String>> {
    let expected_coin = metadata.amount.map(|a| format!("{}{}", a, USDC_DENOM));
    txs.iter()
        .filter(|t| t.code == 0)
        .find(|tx| match metadata.nonce {
            Some(nonce) => tx.events_of(MESSAGE_RECEIVED_EVENT).any(|e| {
                e.attr_u64("nonce") == Some(nonce) && e.attr_u64("source_domain") == Some(u64::from(expected_source))
            }),
            None => match (forwarding, expected_coin.as_deref()) {
                (Some(address), Some(coin)) => tx.events_of(COIN_RECEIVED_EVENT).any(|e| {
                    e.attr("receiver").is_some_and(|r| same_address(&r, address))
                        && e.attr("amount").is_some_and(|a| a.split(',').any(|c| c.trim() == coin))
                }),
                _ => false,
            },
        })
        .map(|tx| tx.hash.clone())
}
