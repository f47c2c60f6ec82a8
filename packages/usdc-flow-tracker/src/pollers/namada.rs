//! Namada poller
//!
//! Namada reports transaction outcomes and IBC events through `block_results`
//! rather than `tx_search`, so every height is read whole.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::PollError;
use crate::hash::{normalize_hex, parse_bytes32};
use crate::pollers::ibc::{find_packet, PacketEvent, RECV_PACKET, SEND_PACKET, WRITE_ACKNOWLEDGEMENT};
use crate::pollers::scan::HeightScanner;
use crate::pollers::{PollContext, PollParams, PollResult, PollerDeps, Progress};
use crate::rpc::{CosmosRpc, CosmosTx, HeightQuery};
use crate::types::{stages, ChainKey, FlowPosition};

pub const TX_APPLIED_EVENT: &str = "tx/applied";

#[derive(Debug, Clone)]
pub struct NamadaPollerConfig {
    /// Channel on Noble towards Namada.
    pub noble_to_namada_channel: String,
    /// Channel on Namada towards Noble.
    pub namada_to_noble_channel: String,
    pub lookback_heights: u64,
    pub max_heights_per_pass: u64,
}

pub struct NamadaPoller {
    rpc: Arc<dyn CosmosRpc>,
    deps: Arc<PollerDeps>,
    config: NamadaPollerConfig,
}

/// Outcome of a `tx/applied` event.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AppliedTx {
    code: u64,
}

impl NamadaPoller {
    pub fn new(rpc: Arc<dyn CosmosRpc>, deps: Arc<PollerDeps>, config: NamadaPollerConfig) -> Self {
        Self { rpc, deps, config }
    }

    pub async fn poll(&self, params: PollParams) -> PollResult {
        let mut progress = Progress::default();
        let outcome = match params.flow_type.position_of(ChainKey::Namada) {
            FlowPosition::Destination => self.poll_receive(&params, &mut progress).await,
            FlowPosition::Source => self.poll_send(&params, &mut progress).await,
            FlowPosition::Intermediate => Err(PollError::polling(
                "unsupported_position",
                "Namada is never an intermediate chain",
            )),
        };
        if let Err(e) = &outcome {
            warn!(flow_id = %params.flow_id, chain = "namada", error = %e, "Namada poll ended without success");
        }
        progress.finish(outcome)
    }

    fn scanner(&self) -> HeightScanner<'_> {
        HeightScanner {
            rpc: self.rpc.as_ref(),
            query: HeightQuery::BlockResults,
            max_heights_per_pass: self.config.max_heights_per_pass,
        }
    }

    async fn start_height(&self, ctx: &PollContext<'_>, params: &PollParams) -> Result<u64, PollError> {
        match params.chain_params.start_block.or(params.metadata.namada_start_height) {
            Some(height) => Ok(height),
            None => self.scanner().default_start(ctx, self.config.lookback_heights).await,
        }
    }

    async fn record_block(&self, params: &PollParams, progress: &mut Progress, height: u64, tx_hash: Option<String>) {
        let block = self
            .deps
            .blocks
            .resolve(self.rpc.as_ref(), Some(height).into(), tx_hash, &params.cancel)
            .await;
        progress.details.extend(block.into_details());
    }

    // ========================================================================
    // Deposit destination: IBC receipt
    // ========================================================================

    async fn poll_receive(&self, params: &PollParams, progress: &mut Progress) -> Result<(), PollError> {
        let ctx = PollContext::new(params, &self.deps.retry);
        let Some(sequence) = params.metadata.packet_sequence else {
            return Err(PollError::polling(
                "missing_metadata",
                "deposit tracking on Namada needs the IBC packet sequence",
            ));
        };
        let src = self.config.noble_to_namada_channel.as_str();
        let dst = self.config.namada_to_noble_channel.as_str();
        let start = self.start_height(&ctx, params).await?;

        let ((), height) = self
            .scanner()
            .find(&ctx, start, |_, txs| match_receipt(txs, sequence, src, dst))
            .await?;

        progress.found = true;
        progress.metadata.ibc_channel = Some(src.to_string());
        progress.detail("receive_height", height);
        self.record_block(params, progress, height, None).await;
        progress.stage(stages::NAMADA_RECEIVED, None);
        info!(flow_id = %params.flow_id, height, sequence, "Namada received IBC transfer");
        Ok(())
    }

    // ========================================================================
    // Payment source: applied tx + IBC send
    // ========================================================================

    async fn poll_send(&self, params: &PollParams, progress: &mut Progress) -> Result<(), PollError> {
        let ctx = PollContext::new(params, &self.deps.retry);
        let metadata = &params.metadata;

        let tx_hash = params
            .chain_params
            .tx_hash
            .clone()
            .or_else(|| metadata.source_tx_hash.clone())
            .unwrap_or_else(|| params.flow_id.clone());
        parse_bytes32(&tx_hash).map_err(|e| PollError::decode(&e))?;
        let wanted = normalize_hex(&tx_hash);
        let start = self.start_height(&ctx, params).await?;

        let (applied, height) = self
            .scanner()
            .find(&ctx, start, |_, txs| find_applied(txs, &wanted))
            .await?;

        progress.found = true;
        progress.metadata.source_tx_hash = Some(tx_hash.clone());
        progress.detail("tx_height", height);
        if applied.code != 0 {
            return Err(PollError::tx_error(
                "transaction_failed",
                format!("Namada transaction {} failed with code {}", tx_hash, applied.code),
            )
            .with_code(applied.code.to_string()));
        }

        // The IBC send is part of the applied tx, so it lands in the same block.
        ctx.check()?;
        let txs = ctx
            .call("events_at", || self.rpc.events_at(height, HeightQuery::BlockResults))
            .await?;
        let channel = self.config.namada_to_noble_channel.as_str();
        let Some((sequence, _)) = find_packet(&txs, SEND_PACKET, |p| {
            p.on_channels(channel, None) && p.transfers(metadata.sender.as_deref(), None, metadata.amount)
        }) else {
            return Err(PollError::polling(
                "packet_not_found",
                format!("no send_packet on {} at height {} for {}", channel, height, tx_hash),
            ));
        };

        progress.metadata.packet_sequence = Some(sequence);
        progress.metadata.ibc_channel = Some(channel.to_string());
        self.record_block(params, progress, height, Some(tx_hash.clone())).await;
        progress.stage(stages::NAMADA_SENT, Some(tx_hash));
        info!(flow_id = %params.flow_id, height, sequence, "Namada IBC send confirmed");
        Ok(())
    }
}

/// `Some(())` when the packet was received; a failed acknowledgement is a tx error.
fn match_receipt(txs: &[CosmosTx], sequence: u64, src: &str, dst: &str) -> Result<Option<()>, PollError> {
    let ours = |p: &PacketEvent| p.sequence == sequence && p.on_channels(src, Some(dst));

    for tx in txs.iter().filter(|t| t.code == 0) {
        let ack = tx
            .events_of(WRITE_ACKNOWLEDGEMENT)
            .filter_map(PacketEvent::parse)
            .find(|p| ours(p));
        if let Some(ack) = ack {
            if let Some(error) = ack.ack_error() {
                return Err(PollError::tx_error(
                    "ibc_ack_error",
                    format!("packet {} was rejected: {}", sequence, error),
                ));
            }
            return Ok(Some(()));
        }
        if tx.events_of(RECV_PACKET).filter_map(PacketEvent::parse).any(|p| ours(&p)) {
            return Ok(Some(()));
        }
    }
    Ok(None)
}

/// A matching event without a parseable `code` is an error, not a success.
fn find_applied(txs: &[CosmosTx], wanted: &str) -> Result<Option<AppliedTx>, PollError> {
    txs.iter()
        .flat_map(|tx| tx.events_of(TX_APPLIED_EVENT))
        .find(|e| e.attr("hash").is_some_and(|h| normalize_hex(&h) == wanted))
        .map(|e| match e.attr_u64("code") {
            Some(code) => Ok(AppliedTx { code }),
            None => Err(PollError::polling(
                "malformed_tx_applied",
                format!("tx/applied for {} has no readable code", wanted),
            )),
        })
        .transpose()
}
