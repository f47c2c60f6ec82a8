//! ICS-20 packet events as emitted by ibc-go on Noble and Namada.

use serde::Deserialize;

use crate::address::same_address;
use crate::rpc::{CosmosTx, TxEvent};

pub(crate) const SEND_PACKET: &str = "send_packet";
pub(crate) const RECV_PACKET: &str = "recv_packet";
pub(crate) const WRITE_ACKNOWLEDGEMENT: &str = "write_acknowledgement";

/// Base denomination of USDC on Cosmos chains.
pub const USDC_DENOM: &str = "uusdc";

/// `FungibleTokenPacketData` carried in `packet_data`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct TransferData {
    pub amount: String,
    pub denom: String,
    pub receiver: String,
    pub sender: String,
    #[serde(default)]
    pub memo: String,
}

impl TransferData {
    pub fn amount_u128(&self) -> Option<u128> {
        self.amount.parse().ok()
    }

    /// Plain or IBC-traced USDC (`transfer/channel-N/uusdc`).
    pub fn is_usdc(&self) -> bool {
        self.denom == USDC_DENOM || self.denom.ends_with(&format!("/{}", USDC_DENOM))
    }
}

/// Packet fields shared by `send_packet`, `recv_packet` and `write_acknowledgement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PacketEvent {
    pub sequence: u64,
    pub src_channel: Option<String>,
    pub dst_channel: Option<String>,
    pub data: Option<TransferData>,
    pub ack: Option<String>,
}

impl PacketEvent {
    /// None when the event carries no parseable sequence.
    pub fn parse(event: &TxEvent) -> Option<Self> {
        let sequence = event.attr_u64("packet_sequence")?;
        Some(Self {
            sequence,
            src_channel: event.attr("packet_src_channel"),
            dst_channel: event.attr("packet_dst_channel"),
            data: event
                .attr("packet_data")
                .and_then(|raw| serde_json::from_str(&raw).ok()),
            ack: event.attr("packet_ack"),
        })
    }

    /// Absent channel attributes do not disqualify a packet.
    pub fn on_channels(&self, src: &str, dst: Option<&str>) -> bool {
        let src_ok = self.src_channel.as_deref().map_or(true, |c| c == src);
        let dst_ok = match (dst, self.dst_channel.as_deref()) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => true,
        };
        src_ok && dst_ok
    }

    /// Whether the packet moves USDC from `sender` to `receiver`, with
    /// exactly `amount` when one is expected.
    pub fn transfers(&self, sender: Option<&str>, receiver: Option<&str>, amount: Option<u128>) -> bool {
        let Some(data) = &self.data else {
            return false;
        };
        data.is_usdc()
            && sender.map_or(true, |s| same_address(s, &data.sender))
            && receiver.map_or(true, |r| same_address(r, &data.receiver))
            && amount.map_or(true, |a| data.amount_u128() == Some(a))
    }

    /// The error string of a failed acknowledgement.
    ///
    /// ibc-go writes `{"result":"AQ=="}` on success and `{"error":"..."}` on
    /// failure.
    pub fn ack_error(&self) -> Option<String> {
        let ack = self.ack.as_deref()?;
        let value: serde_json::Value = serde_json::from_str(ack).ok()?;
        value
            .get("error")
            .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
    }
}

/// Sequence and tx hash of the first packet event of `kind` accepted by `accept`.
pub(crate) fn find_packet<F>(txs: &[CosmosTx], kind: &str, accept: F) -> Option<(u64, Option<String>)>
where
    F: Fn(&PacketEvent) -> bool,
{
    txs.iter().filter(|t| t.code == 0).find_map(|tx| {
        tx.events_of(kind)
            .filter_map(PacketEvent::parse)
            .find(|p| accept(p))
            .map(|p| (p.sequence, tx.hash.clone()))
    })
}
