//! Polling orchestrator
//!
//! Drives one flow at a time per transaction: picks the first chain in flow
//! order that has not succeeded, polls it, folds the result into the
//! [`PollingState`] and persists after every chain.
//!
//! Each running flow holds a child of the daemon's shutdown token. Cancelling
//! a flow marks it `cancelled`; shutting the daemon down leaves it `pending`
//! so that [`Orchestrator::resume_all`] picks it up on the next start.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{OrchestratorError, PollError};
use crate::metrics::Metrics;
use crate::pollers::{PollDispatch, PollParams, PollResult};
use crate::state::{FlowSnapshot, PollingState, TrackRequest};
use crate::store::StateStore;
use crate::types::{ChainKey, FlowPollingStatus};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Deadline for a whole flow, unless the request overrides it.
    pub flow_timeout: Duration,
    /// Poll interval unless a chain overrides it.
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            flow_timeout: Duration::from_secs(3_600),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Tokens of a flow that is currently being driven.
#[derive(Clone)]
struct InFlight {
    cancel: CancellationToken,
    /// Cancelled once the driver has persisted its final state.
    done: CancellationToken,
}

pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    pollers: Arc<dyn PollDispatch>,
    config: OrchestratorConfig,
    metrics: Option<Arc<Metrics>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        pollers: Arc<dyn PollDispatch>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            pollers,
            config,
            metrics: None,
            in_flight: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn load(&self, tx_id: &str) -> Result<PollingState, OrchestratorError> {
        self.store
            .load(tx_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(tx_id.to_string()))
    }

    pub async fn is_running(&self, tx_id: &str) -> bool {
        self.in_flight.lock().await.contains_key(tx_id)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Register a flow. An existing record is returned unchanged.
    pub async fn start(&self, request: TrackRequest) -> Result<FlowSnapshot, OrchestratorError> {
        if let Some(existing) = self.store.load(&request.tx_id).await? {
            debug!(tx_id = %request.tx_id, "Flow already registered");
            return Ok(existing.snapshot());
        }

        let now = Utc::now();
        let timeout = request
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.flow_timeout);
        let deadline = now + to_chrono(timeout);
        let state = PollingState::new(request, deadline, now);
        self.store.save(&state).await?;

        if let Some(metrics) = &self.metrics {
            metrics.flows_started_total.inc();
        }
        info!(
            tx_id = %state.tx_id,
            flow_type = %state.flow_type,
            deadline = %state.deadline,
            "Flow registered"
        );
        Ok(state.snapshot())
    }

    /// Poll the remaining chains of a pending flow until it leaves `pending`.
    ///
    /// Flows in any other status are returned as they are.
    pub async fn start_or_resume(&self, tx_id: &str) -> Result<FlowSnapshot, OrchestratorError> {
        // Registration and the status check happen under one lock so a
        // concurrent cancel or delete is seen before polling starts.
        let (mut state, handle) = {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.contains_key(tx_id) {
                return Err(OrchestratorError::AlreadyRunning(tx_id.to_string()));
            }
            let state = self.load(tx_id).await?;
            if state.flow_status != FlowPollingStatus::Pending {
                return Ok(state.snapshot());
            }
            let handle = InFlight {
                cancel: self.shutdown.child_token(),
                done: CancellationToken::new(),
            };
            in_flight.insert(tx_id.to_string(), handle.clone());
            (state, handle)
        };
        if let Some(metrics) = &self.metrics {
            metrics.flows_in_flight.inc();
        }

        let outcome = self.drive(&mut state, &handle.cancel).await;

        self.in_flight.lock().await.remove(tx_id);
        handle.done.cancel();
        if let Some(metrics) = &self.metrics {
            metrics.flows_in_flight.dec();
        }

        outcome?;
        Ok(state.snapshot())
    }

    /// Stop a flow. Metadata and stages are kept.
    pub async fn cancel(&self, tx_id: &str) -> Result<FlowSnapshot, OrchestratorError> {
        let in_flight = self.in_flight.lock().await;
        let running = in_flight.get(tx_id).cloned();
        if let Some(handle) = running {
            drop(in_flight);
            handle.cancel.cancel();
            handle.done.cancelled().await;
            return self.mark_cancelled(tx_id).await;
        }
        let result = self.mark_cancelled(tx_id).await;
        drop(in_flight);
        result
    }

    async fn mark_cancelled(&self, tx_id: &str) -> Result<FlowSnapshot, OrchestratorError> {
        let mut state = self.load(tx_id).await?;
        match state.flow_status {
            FlowPollingStatus::Cancelled => Ok(state.snapshot()),
            FlowPollingStatus::Success => Err(OrchestratorError::InvalidTransition {
                tx_id: tx_id.to_string(),
                status: state.flow_status,
                operation: "cancel",
            }),
            _ => {
                let now = Utc::now();
                state.flow_status = FlowPollingStatus::Cancelled;
                state.touch(now);
                self.store.save(&state).await?;
                self.record_finished(FlowPollingStatus::Cancelled);
                info!(tx_id, "Flow cancelled");
                Ok(state.snapshot())
            }
        }
    }

    /// Make a stopped flow pending again without touching succeeded chains.
    ///
    /// An expired deadline is moved out by the flow timeout.
    pub async fn prepare_resume(&self, tx_id: &str) -> Result<FlowSnapshot, OrchestratorError> {
        let mut state = self.load(tx_id).await?;
        if !state.flow_status.is_resumable() {
            return Err(OrchestratorError::InvalidTransition {
                tx_id: tx_id.to_string(),
                status: state.flow_status,
                operation: "resume",
            });
        }
        if self.is_running(tx_id).await {
            return Err(OrchestratorError::AlreadyRunning(tx_id.to_string()));
        }

        for status in state.chain_status.values_mut() {
            if !status.is_success() {
                status.clear_error();
            }
        }
        let now = Utc::now();
        state.flow_status = FlowPollingStatus::Pending;
        state.error = None;
        if state.deadline <= now {
            state.deadline = now + self.flow_timeout();
        }
        state.touch(now);
        self.store.save(&state).await?;
        info!(tx_id, deadline = %state.deadline, "Flow resumed");
        Ok(state.snapshot())
    }

    pub async fn resume(&self, tx_id: &str) -> Result<FlowSnapshot, OrchestratorError> {
        self.prepare_resume(tx_id).await?;
        self.start_or_resume(tx_id).await
    }

    /// Reset the failed chain and make the flow pending again. Nothing is
    /// re-submitted on chain.
    pub async fn prepare_retry(&self, tx_id: &str) -> Result<FlowSnapshot, OrchestratorError> {
        let mut state = self.load(tx_id).await?;
        if !state.flow_status.is_retryable() {
            return Err(OrchestratorError::InvalidTransition {
                tx_id: tx_id.to_string(),
                status: state.flow_status,
                operation: "retry",
            });
        }
        if self.is_running(tx_id).await {
            return Err(OrchestratorError::AlreadyRunning(tx_id.to_string()));
        }

        if let Some(chain) = state.failed_chain() {
            let status = state.chain_mut(chain);
            status.reset_error();
            info!(tx_id, chain = %chain, retry_count = status.retry_count, "Retrying chain");
        }
        let now = Utc::now();
        state.flow_status = FlowPollingStatus::Pending;
        state.error = None;
        state.deadline = state.deadline.max(now + self.flow_timeout());
        state.touch(now);
        self.store.save(&state).await?;
        Ok(state.snapshot())
    }

    pub async fn retry(&self, tx_id: &str) -> Result<FlowSnapshot, OrchestratorError> {
        self.prepare_retry(tx_id).await?;
        self.start_or_resume(tx_id).await
    }

    pub async fn snapshot(&self, tx_id: &str) -> Result<FlowSnapshot, OrchestratorError> {
        Ok(self.load(tx_id).await?.snapshot())
    }

    /// Stop polling and delete the record. Returns whether one existed.
    pub async fn forget(&self, tx_id: &str) -> Result<bool, OrchestratorError> {
        let in_flight = self.in_flight.lock().await;
        let running = in_flight.get(tx_id).cloned();
        let deleted = if let Some(handle) = running {
            drop(in_flight);
            handle.cancel.cancel();
            handle.done.cancelled().await;
            self.store.delete(tx_id).await?
        } else {
            let deleted = self.store.delete(tx_id).await?;
            drop(in_flight);
            deleted
        };
        if deleted {
            info!(tx_id, "Flow deleted");
        }
        Ok(deleted)
    }

    /// Drive a flow on its own task.
    pub fn spawn(self: &Arc<Self>, tx_id: String) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            match orchestrator.start_or_resume(&tx_id).await {
                Ok(snapshot) => {
                    debug!(tx_id = %tx_id, status = %snapshot.flow_status, "Flow task finished");
                }
                Err(OrchestratorError::AlreadyRunning(_)) => {
                    debug!(tx_id = %tx_id, "Flow already has a task");
                }
                Err(e) => {
                    error!(tx_id = %tx_id, error = %e, "Flow task failed");
                }
            }
        })
    }

    /// Spawn a task for every persisted `pending` flow.
    pub async fn resume_all(self: &Arc<Self>) -> Result<usize, OrchestratorError> {
        let pending = self.store.list_by_status(FlowPollingStatus::Pending).await?;
        let count = pending.len();
        for state in pending {
            self.spawn(state.tx_id);
        }
        info!(count, "Resumed pending flows");
        Ok(count)
    }

    /// Stop every running flow, leaving them `pending`, and wait for their
    /// final saves.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let running: Vec<InFlight> = self.in_flight.lock().await.values().cloned().collect();
        join_all(running.iter().map(|handle| handle.done.cancelled())).await;
        info!("Orchestrator stopped");
    }

    // ========================================================================
    // Driving
    // ========================================================================

    fn flow_timeout(&self) -> chrono::Duration {
        to_chrono(self.config.flow_timeout)
    }

    fn record_finished(&self, status: FlowPollingStatus) {
        if let Some(metrics) = &self.metrics {
            metrics.record_finished(status);
        }
    }

    async fn drive(&self, state: &mut PollingState, cancel: &CancellationToken) -> Result<(), OrchestratorError> {
        loop {
            let Some(chain) = state.next_chain() else {
                let now = Utc::now();
                state.flow_status = FlowPollingStatus::Success;
                state.current_chain = None;
                state.error = None;
                state.touch(now);
                self.store.save(state).await?;
                self.record_finished(FlowPollingStatus::Success);
                info!(tx_id = %state.tx_id, "Flow complete");
                return Ok(());
            };

            let now = Utc::now();
            state.current_chain = Some(chain);
            state.touch(now);
            self.store.save(state).await?;

            let params = self.poll_params(state, chain, cancel, now);
            debug!(
                tx_id = %state.tx_id,
                chain = %chain,
                timeout_secs = params.timeout.as_secs(),
                "Polling chain"
            );
            let result = self.pollers.poll(params).await;
            self.apply(state, chain, result);
            self.store.save(state).await?;

            if state.flow_status != FlowPollingStatus::Pending {
                self.record_finished(state.flow_status);
                return Ok(());
            }
            if cancel.is_cancelled() {
                debug!(tx_id = %state.tx_id, "Flow left pending for the next start");
                return Ok(());
            }
        }
    }

    fn poll_params(
        &self,
        state: &PollingState,
        chain: ChainKey,
        cancel: &CancellationToken,
        now: chrono::DateTime<Utc>,
    ) -> PollParams {
        let chain_params = state.chain_params.get(&chain).cloned().unwrap_or_default();
        let remaining = (state.deadline - now).to_std().unwrap_or(Duration::ZERO);
        let timeout = chain_params
            .timeout_ms
            .map(|ms| Duration::from_millis(ms).min(remaining))
            .unwrap_or(remaining);
        let interval = chain_params
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.poll_interval);

        PollParams {
            flow_id: state.tx_id.clone(),
            chain,
            flow_type: state.flow_type,
            metadata: state.metadata.clone(),
            completed_stages: state
                .chain(chain)
                .map(|c| c.completed_stages.clone())
                .unwrap_or_default(),
            chain_params,
            timeout,
            interval,
            cancel: cancel.clone(),
        }
    }

    /// Fold one poll result into the state.
    fn apply(&self, state: &mut PollingState, chain: ChainKey, result: PollResult) {
        let now = Utc::now();
        let tx_id = state.tx_id.clone();
        let conflicts = state.metadata.merge(result.metadata);
        if !conflicts.is_empty() {
            warn!(
                tx_id = %tx_id,
                chain = %chain,
                fields = ?conflicts,
                "Poller reported metadata that disagrees with earlier chains; keeping existing values"
            );
        }

        let status = state.chain_mut(chain);
        status.add_stages(result.stages);
        status.metadata.extend(result.details);

        let outcome = if result.success {
            status.record_success(now);
            info!(tx_id = %tx_id, chain = %chain, "Chain complete");
            "success"
        } else {
            let error = result
                .error
                .unwrap_or_else(|| PollError::polling("unknown", "poller failed without an error"));
            if error.is_cancelled() {
                if self.shutdown.is_cancelled() {
                    info!(tx_id = %tx_id, chain = %chain, "Polling interrupted by shutdown");
                } else {
                    state.flow_status = FlowPollingStatus::Cancelled;
                    info!(tx_id = %tx_id, chain = %chain, "Flow cancelled");
                }
                "cancelled"
            } else {
                warn!(
                    tx_id = %tx_id,
                    chain = %chain,
                    error_type = %error.error_type,
                    error = %error.message,
                    "Chain failed"
                );
                status.record_failure(error.clone(), now);
                state.flow_status = error.kind.flow_status();
                state.error = Some(error);
                state.flow_status.as_str()
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_poll(chain, outcome);
        }

        state.latest_completed_stage = state
            .stage_trail()
            .last()
            .map(|(_, stage)| stage.stage.clone());
        state.touch(now);
    }
}

/// Out-of-range durations are clamped to a century.
fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(5_200))
}
