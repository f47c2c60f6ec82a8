//! Chain pollers.
//!
//! One poller per chain. Each handles whichever flow position its chain holds
//! for the flow type being tracked:
//!
//! | chain  | deposit                        | payment                          |
//! |--------|--------------------------------|----------------------------------|
//! | EVM    | burn receipt + attestation     | chunked mint scan                |
//! | Noble  | mint, forwarding, IBC forward  | IBC receive, burn, attestation   |
//! | Namada | IBC receipt                    | IBC send                         |
//!
//! A poll call always ends in exactly one [`PollResult`]. RPC errors are
//! retried through [`crate::retry`]; the deadline and the cancellation token
//! are checked at the top of every iteration.

pub mod evm;
mod ibc;
pub mod namada;
pub mod noble;
mod scan;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::attestation::{AttestationClient, AttestationOutcomeStatus, AttestationPollConfig};
use crate::block_meta::BlockMetadataResolver;
use crate::error::PollError;
use crate::metadata::FlowMetadata;
use crate::retry::{retry, sleep_or_cancel, RetryConfig, RetryError};
use crate::state::ChainPollParams;
use crate::types::{ChainKey, ChainStage, FlowType};

pub use evm::{EvmPoller, EvmPollerConfig};
pub use ibc::USDC_DENOM;
pub use namada::{NamadaPoller, NamadaPollerConfig};
pub use noble::{NoblePoller, NoblePollerConfig};

/// Input to one poll call.
#[derive(Debug, Clone)]
pub struct PollParams {
    pub flow_id: String,
    pub chain: ChainKey,
    pub flow_type: FlowType,
    pub metadata: FlowMetadata,
    pub chain_params: ChainPollParams,
    /// Stages this chain already confirmed in an earlier attempt.
    pub completed_stages: Vec<String>,
    pub timeout: Duration,
    pub interval: Duration,
    pub cancel: CancellationToken,
}

impl PollParams {
    pub fn stage_done(&self, stage: &str) -> bool {
        self.completed_stages.iter().any(|s| s == stage)
    }
}

/// Terminal outcome of one poll call.
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub success: bool,
    /// Whether the awaited event was observed at all.
    pub found: bool,
    pub metadata: FlowMetadata,
    pub stages: Vec<ChainStage>,
    /// Chain-local details merged into `ChainStatus::metadata`.
    pub details: BTreeMap<String, serde_json::Value>,
    pub error: Option<PollError>,
}

/// What a poller accumulated so far. Kept on failure so that stages already
/// confirmed are not lost.
#[derive(Debug, Default)]
pub(crate) struct Progress {
    pub found: bool,
    pub metadata: FlowMetadata,
    pub stages: Vec<ChainStage>,
    pub details: BTreeMap<String, serde_json::Value>,
}

impl Progress {
    pub fn stage(&mut self, stage: &str, tx_hash: Option<String>) {
        self.stages.push(ChainStage::confirmed(stage, tx_hash));
    }

    pub fn detail(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.details.insert(key.to_string(), value.into());
    }

    pub fn finish(self, outcome: Result<(), PollError>) -> PollResult {
        match outcome {
            Ok(()) => PollResult {
                success: true,
                found: true,
                metadata: self.metadata,
                stages: self.stages,
                details: self.details,
                error: None,
            },
            Err(error) => PollResult {
                success: false,
                found: self.found,
                metadata: self.metadata,
                stages: self.stages,
                details: self.details,
                error: Some(error),
            },
        }
    }
}

// ============================================================================
// Shared polling context
// ============================================================================

/// Services every poller uses.
pub struct PollerDeps {
    pub attestation: Arc<AttestationClient>,
    pub blocks: Arc<BlockMetadataResolver>,
    pub retry: RetryConfig,
    pub attestation_timeout: Duration,
    pub attestation_interval: Duration,
}

/// Deadline, cancellation and retry plumbing for one poll call.
pub(crate) struct PollContext<'a> {
    pub flow_id: &'a str,
    pub chain: ChainKey,
    pub cancel: &'a CancellationToken,
    pub deadline: Instant,
    pub interval: Duration,
    pub retry: &'a RetryConfig,
}

impl<'a> PollContext<'a> {
    pub fn new(params: &'a PollParams, retry: &'a RetryConfig) -> Self {
        Self {
            flow_id: &params.flow_id,
            chain: params.chain,
            cancel: &params.cancel,
            deadline: Instant::now() + params.timeout,
            interval: params.interval,
            retry,
        }
    }

    /// Cancellation first, then the deadline.
    pub fn check(&self) -> Result<(), PollError> {
        if self.cancel.is_cancelled() {
            return Err(PollError::cancelled());
        }
        if Instant::now() >= self.deadline {
            return Err(PollError::timeout(format!(
                "{} polling deadline reached",
                self.chain
            )));
        }
        Ok(())
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Run an RPC call through the retry executor.
    pub async fn call<T, F, Fut>(&self, what: &str, operation: F) -> Result<T, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = eyre::Result<T>>,
    {
        retry(self.retry, self.cancel, what, operation)
            .await
            .map_err(|e| match e {
                RetryError::Cancelled => PollError::cancelled(),
                RetryError::Exhausted { last_error, .. } => {
                    PollError::polling("rpc_error", format!("{}: {}", what, last_error))
                }
            })
    }

    /// Sleep one interval (bounded by the deadline) unless cancelled.
    pub async fn pause(&self) -> Result<(), PollError> {
        let pause = self.interval.min(self.remaining());
        if sleep_or_cancel(pause, self.cancel).await {
            Ok(())
        } else {
            Err(PollError::cancelled())
        }
    }

    /// Poll the attestation service for `message_hash` and record the result.
    pub async fn await_attestation(
        &self,
        deps: &PollerDeps,
        message_hash: &str,
        progress: &mut Progress,
    ) -> Result<(), PollError> {
        self.check()?;
        let config = AttestationPollConfig {
            timeout: deps.attestation_timeout.min(self.remaining()),
            poll_interval: deps.attestation_interval,
        };
        let outcome = deps
            .attestation
            .poll_attestation(message_hash, &config, self.cancel)
            .await;
        progress.detail("attestation_requests", outcome.requests);

        match outcome.status {
            AttestationOutcomeStatus::Complete => {
                progress.metadata.attestation = outcome.attestation;
                progress.stage(crate::types::stages::ATTESTATION_COMPLETE, None);
                Ok(())
            }
            AttestationOutcomeStatus::Cancelled => Err(PollError::cancelled()),
            AttestationOutcomeStatus::Timeout => Err(PollError::timeout(
                outcome
                    .message
                    .unwrap_or_else(|| "attestation timed out".to_string()),
            )),
            AttestationOutcomeStatus::Error => Err(PollError::polling(
                "attestation_failed",
                outcome
                    .message
                    .unwrap_or_else(|| "attestation failed".to_string()),
            )),
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Closed set of chain pollers.
pub enum ChainPoller {
    Evm(EvmPoller),
    Noble(NoblePoller),
    Namada(NamadaPoller),
}

impl ChainPoller {
    pub fn chain(&self) -> ChainKey {
        match self {
            ChainPoller::Evm(_) => ChainKey::Evm,
            ChainPoller::Noble(_) => ChainKey::Noble,
            ChainPoller::Namada(_) => ChainKey::Namada,
        }
    }

    pub async fn poll(&self, params: PollParams) -> PollResult {
        match self {
            ChainPoller::Evm(p) => p.poll(params).await,
            ChainPoller::Noble(p) => p.poll(params).await,
            ChainPoller::Namada(p) => p.poll(params).await,
        }
    }
}

/// How the orchestrator reaches pollers.
#[async_trait]
pub trait PollDispatch: Send + Sync {
    async fn poll(&self, params: PollParams) -> PollResult;
}

/// The three production pollers.
pub struct ChainPollers {
    pollers: Vec<ChainPoller>,
}

impl ChainPollers {
    pub fn new(evm: EvmPoller, noble: NoblePoller, namada: NamadaPoller) -> Self {
        Self {
            pollers: vec![
                ChainPoller::Evm(evm),
                ChainPoller::Noble(noble),
                ChainPoller::Namada(namada),
            ],
        }
    }
}

#[async_trait]
impl PollDispatch for ChainPollers {
    async fn poll(&self, params: PollParams) -> PollResult {
        match self.pollers.iter().find(|p| p.chain() == params.chain) {
            Some(poller) => poller.poll(params).await,
            None => Progress::default().finish(Err(PollError::polling(
                "unsupported_chain",
                format!("no poller for chain {}", params.chain),
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::attestation::tests::ScriptedApi;
    use crate::cache::BoundedTtlCache;

    pub(crate) use super::scan::tests::FakeCosmos;

    pub(crate) fn deps(api: ScriptedApi) -> PollerDeps {
        PollerDeps {
            attestation: Arc::new(AttestationClient::new(Arc::new(api))),
            blocks: Arc::new(BlockMetadataResolver::new(BoundedTtlCache::new(
                64,
                Duration::from_secs(60),
            ))),
            retry: RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
            },
            attestation_timeout: Duration::from_secs(120),
            attestation_interval: Duration::from_secs(2),
        }
    }

    pub(crate) fn params(chain: ChainKey, flow_type: FlowType, metadata: FlowMetadata) -> PollParams {
        PollParams {
            flow_id: "flow-1".to_string(),
            chain,
            flow_type,
            metadata,
            chain_params: ChainPollParams::default(),
            completed_stages: Vec::new(),
            timeout: Duration::from_secs(300),
            interval: Duration::from_secs(5),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_progress_keeps_stages_on_failure() {
        let mut progress = Progress::default();
        progress.found = true;
        progress.stage(crate::types::stages::NOBLE_MINT_CONFIRMED, None);
        let result = progress.finish(Err(PollError::user_action("x", "y")));
        assert!(!result.success);
        assert!(result.found);
        assert_eq!(result.stages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_reports_timeout_then_cancel_precedence() {
        let mut p = params(ChainKey::Evm, FlowType::Payment, FlowMetadata::default());
        p.timeout = Duration::from_secs(1);
        let retry = RetryConfig::default();
        let ctx = PollContext::new(&p, &retry);
        assert!(ctx.check().is_ok());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            ctx.check().unwrap_err().kind,
            crate::error::PollErrorKind::PollingTimeout
        );
        p.cancel.cancel();
        assert!(ctx.check().unwrap_err().is_cancelled());
    }
}
