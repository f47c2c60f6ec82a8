//! Persisted polling state for one tracked transaction.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PollError, PollErrorKind};
use crate::metadata::FlowMetadata;
use crate::types::{ChainKey, ChainStage, ChainStatusValue, FlowPollingStatus, FlowType};

/// Status of one chain within a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStatus {
    pub status: ChainStatusValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PollError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_stages: Vec<String>,
    #[serde(default)]
    pub stages: Vec<ChainStage>,
    #[serde(default)]
    pub retry_count: u32,
    /// Chain-local details (block height, timestamp, event tx hash).
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Default for ChainStatus {
    fn default() -> Self {
        Self::pending()
    }
}

impl ChainStatus {
    pub fn pending() -> Self {
        Self {
            status: ChainStatusValue::Pending,
            error: None,
            error_at: None,
            timeout_at: None,
            completed_at: None,
            completed_stages: Vec::new(),
            stages: Vec::new(),
            retry_count: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ChainStatusValue::Success
    }

    /// Append stages not already recorded.
    pub fn add_stages(&mut self, stages: Vec<ChainStage>) {
        for stage in stages {
            if !self.completed_stages.contains(&stage.stage) {
                self.completed_stages.push(stage.stage.clone());
                self.stages.push(stage);
            }
        }
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.status = ChainStatusValue::Success;
        self.completed_at = Some(now);
        self.error = None;
        self.error_at = None;
        self.timeout_at = None;
    }

    pub fn record_failure(&mut self, error: PollError, now: DateTime<Utc>) {
        self.status = match error.kind {
            PollErrorKind::TxError => ChainStatusValue::TxError,
            PollErrorKind::PollingError => ChainStatusValue::PollingError,
            PollErrorKind::PollingTimeout => {
                self.timeout_at = Some(now);
                ChainStatusValue::PollingTimeout
            }
            PollErrorKind::UserActionRequired => ChainStatusValue::UserActionRequired,
        };
        self.error = Some(error);
        self.error_at = Some(now);
    }

    /// Back to pending without touching stages or details.
    pub fn clear_error(&mut self) {
        self.status = ChainStatusValue::Pending;
        self.error = None;
        self.error_at = None;
        self.timeout_at = None;
    }

    /// Clear failure fields ahead of a retry.
    pub fn reset_error(&mut self) {
        self.clear_error();
        self.retry_count += 1;
    }
}

/// Caller-supplied overrides for polling one chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainPollParams {
    /// Transaction to inspect on this chain (source chains only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// First block or height to scan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_block: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
}

/// Request to begin tracking a submitted transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRequest {
    pub tx_id: String,
    pub flow_type: FlowType,
    #[serde(default)]
    pub metadata: FlowMetadata,
    #[serde(default)]
    pub chain_params: BTreeMap<ChainKey, ChainPollParams>,
    /// Overrides the configured flow timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Everything needed to resume polling a flow after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingState {
    pub tx_id: String,
    pub flow_type: FlowType,
    pub flow_status: FlowPollingStatus,
    pub chain_status: BTreeMap<ChainKey, ChainStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_completed_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_chain: Option<ChainKey>,
    pub metadata: FlowMetadata,
    #[serde(default)]
    pub chain_params: BTreeMap<ChainKey, ChainPollParams>,
    pub deadline: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PollError>,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl PollingState {
    pub fn new(request: TrackRequest, deadline: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let chain_status = request
            .flow_type
            .chain_order()
            .into_iter()
            .map(|chain| (chain, ChainStatus::pending()))
            .collect();

        Self {
            tx_id: request.tx_id,
            flow_type: request.flow_type,
            flow_status: FlowPollingStatus::Pending,
            chain_status,
            latest_completed_stage: None,
            current_chain: None,
            metadata: request.metadata,
            chain_params: request.chain_params,
            deadline,
            error: None,
            started_at: now,
            last_updated_at: now,
            last_active_at: now,
        }
    }

    /// First chain in flow order that has not succeeded.
    pub fn next_chain(&self) -> Option<ChainKey> {
        self.flow_type
            .chain_order()
            .into_iter()
            .find(|chain| !self.chain(*chain).is_some_and(ChainStatus::is_success))
    }

    pub fn chain(&self, chain: ChainKey) -> Option<&ChainStatus> {
        self.chain_status.get(&chain)
    }

    pub fn chain_mut(&mut self, chain: ChainKey) -> &mut ChainStatus {
        self.chain_status.entry(chain).or_default()
    }

    /// The first chain holding an error, in flow order.
    pub fn failed_chain(&self) -> Option<ChainKey> {
        self.flow_type
            .chain_order()
            .into_iter()
            .find(|chain| self.chain(*chain).is_some_and(|c| c.error.is_some()))
    }

    pub fn all_chains_succeeded(&self) -> bool {
        self.next_chain().is_none()
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_updated_at = now;
        self.last_active_at = now;
    }

    /// Stages from every chain ordered by when they happened.
    pub fn stage_trail(&self) -> Vec<(ChainKey, ChainStage)> {
        let mut trail: Vec<(ChainKey, ChainStage)> = self
            .flow_type
            .chain_order()
            .into_iter()
            .filter_map(|chain| self.chain(chain).map(|status| (chain, status)))
            .flat_map(|(chain, status)| status.stages.iter().map(move |s| (chain, s.clone())))
            .collect();
        trail.sort_by_key(|(_, stage)| stage.occurred_at);
        trail
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            tx_id: self.tx_id.clone(),
            flow_type: self.flow_type,
            flow_status: self.flow_status,
            current_chain: self.current_chain,
            latest_completed_stage: self.latest_completed_stage.clone(),
            chain_status: self.chain_status.clone(),
            stages: self
                .stage_trail()
                .into_iter()
                .map(|(chain, stage)| TrailEntry { chain, stage })
                .collect(),
            metadata: self.metadata.clone(),
            error: self.error.clone(),
            deadline: self.deadline,
        }
    }
}

/// Read-only view handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub tx_id: String,
    pub flow_type: FlowType,
    pub flow_status: FlowPollingStatus,
    pub current_chain: Option<ChainKey>,
    pub latest_completed_stage: Option<String>,
    pub chain_status: BTreeMap<ChainKey, ChainStatus>,
    pub stages: Vec<TrailEntry>,
    pub metadata: FlowMetadata,
    pub error: Option<PollError>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailEntry {
    pub chain: ChainKey,
    #[serde(flatten)]
    pub stage: ChainStage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::stages;
    use chrono::Duration;

    fn request() -> TrackRequest {
        TrackRequest {
            tx_id: "0xdeadbeef".to_string(),
            flow_type: FlowType::Deposit,
            metadata: FlowMetadata {
                amount: Some(340_282_366_920_938_463_463_374_607_431_768_211_455),
                recipient: Some("tnam1qxyz".to_string()),
                ..Default::default()
            },
            chain_params: BTreeMap::new(),
            timeout_secs: None,
        }
    }

    #[test]
    fn test_new_state_has_pending_chains_in_order() {
        let now = Utc::now();
        let state = PollingState::new(request(), now + Duration::minutes(30), now);
        assert_eq!(state.chain_status.len(), 3);
        assert_eq!(state.next_chain(), Some(ChainKey::Evm));
        assert_eq!(state.flow_status, FlowPollingStatus::Pending);
    }

    #[test]
    fn test_polling_state_json_round_trip() {
        let now = Utc::now();
        let mut state = PollingState::new(request(), now + Duration::minutes(30), now);
        let evm = state.chain_mut(ChainKey::Evm);
        evm.add_stages(vec![ChainStage::confirmed(
            stages::EVM_BURN_CONFIRMED,
            Some("0x01".to_string()),
        )]);
        evm.record_success(now);
        evm.metadata
            .insert("block_height".to_string(), serde_json::json!(1000));
        state.chain_mut(ChainKey::Noble).record_failure(
            PollError::user_action("forwarding_not_registered", "register"),
            now,
        );

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"340282366920938463463374607431768211455\""));
        let back: PollingState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.next_chain(), Some(ChainKey::Noble));
        assert_eq!(back.failed_chain(), Some(ChainKey::Noble));
    }

    #[test]
    fn test_add_stages_is_idempotent() {
        let mut status = ChainStatus::pending();
        status.add_stages(vec![ChainStage::confirmed(stages::NOBLE_MINT_CONFIRMED, None)]);
        status.add_stages(vec![
            ChainStage::confirmed(stages::NOBLE_MINT_CONFIRMED, None),
            ChainStage::confirmed(stages::NOBLE_FORWARDED, None),
        ]);
        assert_eq!(
            status.completed_stages,
            vec![stages::NOBLE_MINT_CONFIRMED, stages::NOBLE_FORWARDED]
        );
        assert_eq!(status.stages.len(), 2);
    }

    #[test]
    fn test_reset_error_increments_retry_count() {
        let mut status = ChainStatus::pending();
        status.record_failure(PollError::timeout("deadline reached"), Utc::now());
        assert_eq!(status.status, ChainStatusValue::PollingTimeout);
        assert!(status.timeout_at.is_some());
        status.reset_error();
        assert_eq!(status.status, ChainStatusValue::Pending);
        assert!(status.error.is_none());
        assert_eq!(status.retry_count, 1);
    }

    #[test]
    fn test_stage_trail_sorted_by_time() {
        let now = Utc::now();
        let mut state = PollingState::new(request(), now + Duration::minutes(30), now);
        let mut late = ChainStage::confirmed(stages::NAMADA_RECEIVED, None);
        late.occurred_at = now + Duration::seconds(20);
        let mut early = ChainStage::confirmed(stages::EVM_BURN_CONFIRMED, None);
        early.occurred_at = now;
        state.chain_mut(ChainKey::Namada).add_stages(vec![late]);
        state.chain_mut(ChainKey::Evm).add_stages(vec![early]);

        let trail = state.stage_trail();
        assert_eq!(trail[0].0, ChainKey::Evm);
        assert_eq!(trail[1].1.stage, stages::NAMADA_RECEIVED);
    }
}
