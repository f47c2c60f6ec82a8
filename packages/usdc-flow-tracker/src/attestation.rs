//! Attestation API polling.
//!
//! The attestation service co-signs a CCTP message some time after its burn
//! is final. `GET {base}/0x{lookup_id}` answers 404 until the message is
//! indexed, then `pending_confirmations`, then `complete` with the signature.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationStatus {
    Pending,
    PendingConfirmations,
    Complete,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AttestationResponse {
    pub status: AttestationStatus,
    #[serde(default)]
    pub attestation: Option<String>,
}

impl AttestationResponse {
    /// The signature, if the response carries a usable one.
    pub fn signature(&self) -> Option<&str> {
        self.attestation
            .as_deref()
            .filter(|a| !a.is_empty() && !a.eq_ignore_ascii_case("pending"))
    }
}

/// One lookup against the attestation service. `Ok(None)` means 404.
#[async_trait]
pub trait AttestationApi: Send + Sync {
    async fn fetch(&self, lookup_id: &str) -> Result<Option<AttestationResponse>>;
}

/// Attestation API over HTTP.
pub struct IrisAttestationApi {
    base_url: String,
    client: reqwest::Client,
}

impl IrisAttestationApi {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .wrap_err("Failed to build attestation HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl AttestationApi for IrisAttestationApi {
    async fn fetch(&self, lookup_id: &str) -> Result<Option<AttestationResponse>> {
        let url = format!("{}/{}", self.base_url, lookup_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .wrap_err("Attestation request failed")?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(eyre!("Attestation API returned HTTP {}", status.as_u16()));
        }

        let body = response
            .json::<AttestationResponse>()
            .await
            .wrap_err("Failed to parse attestation response")?;
        Ok(Some(body))
    }
}

#[derive(Debug, Clone)]
pub struct AttestationPollConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationOutcomeStatus {
    Complete,
    Timeout,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationOutcome {
    pub status: AttestationOutcomeStatus,
    pub attestation: Option<String>,
    pub message: Option<String>,
    /// HTTP requests issued, including misses.
    pub requests: u32,
}

impl AttestationOutcome {
    fn new(status: AttestationOutcomeStatus, requests: u32) -> Self {
        Self {
            status,
            attestation: None,
            message: None,
            requests,
        }
    }
}

pub struct AttestationClient {
    api: Arc<dyn AttestationApi>,
    metrics: Option<Arc<Metrics>>,
}

impl AttestationClient {
    pub fn new(api: Arc<dyn AttestationApi>) -> Self {
        Self { api, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Poll until the attestation is complete, the timeout passes, or `cancel` fires.
    ///
    /// Misses (404, pending, HTTP errors) keep polling. Timeout and
    /// cancellation are outcomes, not errors.
    pub async fn poll_attestation(
        &self,
        lookup_id: &str,
        config: &AttestationPollConfig,
        cancel: &CancellationToken,
    ) -> AttestationOutcome {
        let deadline = Instant::now() + config.timeout;
        let mut requests = 0u32;

        loop {
            if cancel.is_cancelled() {
                return AttestationOutcome::new(AttestationOutcomeStatus::Cancelled, requests);
            }
            if Instant::now() >= deadline {
                let mut outcome = AttestationOutcome::new(AttestationOutcomeStatus::Timeout, requests);
                outcome.message = Some(format!(
                    "attestation not complete after {}s",
                    config.timeout.as_secs()
                ));
                return outcome;
            }

            requests += 1;
            if let Some(metrics) = &self.metrics {
                metrics.attestation_requests_total.inc();
            }

            // An in-flight request runs to completion; cancellation is seen after it.
            let response = self.api.fetch(lookup_id).await;
            if cancel.is_cancelled() {
                return AttestationOutcome::new(AttestationOutcomeStatus::Cancelled, requests);
            }

            match response {
                Ok(Some(body)) => match (body.status, body.signature()) {
                    (AttestationStatus::Complete, Some(signature)) => {
                        info!(lookup_id, requests, "Attestation complete");
                        let mut outcome =
                            AttestationOutcome::new(AttestationOutcomeStatus::Complete, requests);
                        outcome.attestation = Some(signature.to_string());
                        return outcome;
                    }
                    (AttestationStatus::Failed, _) => {
                        warn!(lookup_id, "Attestation service reported failure");
                        let mut outcome =
                            AttestationOutcome::new(AttestationOutcomeStatus::Error, requests);
                        outcome.message = Some("attestation failed".to_string());
                        return outcome;
                    }
                    (status, _) => {
                        debug!(lookup_id, ?status, "Attestation not ready");
                    }
                },
                Ok(None) => {
                    debug!(lookup_id, "Attestation not found yet");
                }
                Err(e) => {
                    warn!(lookup_id, error = %e, "Attestation request failed");
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let pause = config.poll_interval.min(remaining);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return AttestationOutcome::new(AttestationOutcomeStatus::Cancelled, requests);
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}
