//! Prometheus metrics for the tracker
//!
//! Exposed on `/metrics` by [`crate::server`].

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::types::{ChainKey, FlowPollingStatus};

pub struct Metrics {
    pub flows_started_total: IntCounter,
    /// Flows that left `pending`, by resulting status.
    pub flows_finished_total: IntCounterVec,
    /// Poll calls per chain and outcome.
    pub chain_polls_total: IntCounterVec,
    pub attestation_requests_total: IntCounter,
    pub flows_in_flight: IntGauge,
    pub registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let flows_started_total = IntCounter::new(
            "usdc_tracker_flows_started_total",
            "Total number of flows registered for tracking",
        )
        .expect("constant metric name is valid");

        let flows_finished_total = IntCounterVec::new(
            Opts::new(
                "usdc_tracker_flows_finished_total",
                "Total number of flows that stopped polling, by status",
            ),
            &["status"],
        )
        .expect("constant metric name is valid");

        let chain_polls_total = IntCounterVec::new(
            Opts::new(
                "usdc_tracker_chain_polls_total",
                "Total number of chain poll calls, by chain and outcome",
            ),
            &["chain", "status"],
        )
        .expect("constant metric name is valid");

        let attestation_requests_total = IntCounter::new(
            "usdc_tracker_attestation_requests_total",
            "Total number of attestation API requests",
        )
        .expect("constant metric name is valid");

        let flows_in_flight = IntGauge::new(
            "usdc_tracker_flows_in_flight",
            "Flows currently being polled",
        )
        .expect("constant metric name is valid");

        // Names are unique constants and registration runs once per Metrics
        registry
            .register(Box::new(flows_started_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(flows_finished_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(chain_polls_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(attestation_requests_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(flows_in_flight.clone()))
            .expect("metric registration must not be called twice");

        Self {
            flows_started_total,
            flows_finished_total,
            chain_polls_total,
            attestation_requests_total,
            flows_in_flight,
            registry,
        }
    }

    pub fn record_poll(&self, chain: ChainKey, status: &str) {
        self.chain_polls_total
            .with_label_values(&[chain.as_str(), status])
            .inc();
    }

    pub fn record_finished(&self, status: FlowPollingStatus) {
        self.flows_finished_total
            .with_label_values(&[status.as_str()])
            .inc();
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_labels() {
        let metrics = Metrics::new();
        metrics.flows_started_total.inc();
        metrics.record_poll(ChainKey::Noble, "success");
        metrics.record_finished(FlowPollingStatus::UserActionRequired);

        let text = metrics.render().unwrap();
        assert!(text.contains("usdc_tracker_flows_started_total 1"));
        assert!(text.contains(r#"usdc_tracker_chain_polls_total{chain="noble",status="success"} 1"#));
        assert!(text.contains(r#"status="user_action_required""#));
    }

    #[test]
    fn test_two_instances_do_not_collide() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.flows_in_flight.inc();
        assert_eq!(b.flows_in_flight.get(), 0);
    }
}
