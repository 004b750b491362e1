//! # Prometheus Metrics
//!
//! Operational metrics for the authority, scraped at `/metrics` on the
//! metrics port. Everything lives in a dedicated registry with the
//! `harvest` prefix.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::core::Collector;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Metric handles. Cloning shares the underlying series.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Transactions the authority accepted for the first time.
    pub submissions_accepted_total: IntCounter,
    /// Transactions the authority rejected for the first time.
    pub submissions_rejected_total: IntCounter,
    /// Submissions answered from the stored outcome of an earlier one.
    pub duplicate_replays_total: IntCounter,
    pub sessions_opened_total: IntCounter,
    pub wallets_provisioned: IntGauge,
    /// Time to decide one exchange batch.
    pub submit_latency_seconds: Histogram,
}

fn register<C: Collector + Clone + 'static>(
    registry: &Registry,
    collector: C,
) -> Result<C, prometheus::Error> {
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

impl NodeMetrics {
    /// Create and register all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("harvest".into()), None)?;

        let submissions_accepted_total = register(
            &registry,
            IntCounter::new("submissions_accepted_total", "Transactions accepted")?,
        )?;
        let submissions_rejected_total = register(
            &registry,
            IntCounter::new("submissions_rejected_total", "Transactions rejected")?,
        )?;
        let duplicate_replays_total = register(
            &registry,
            IntCounter::new(
                "duplicate_replays_total",
                "Resubmissions answered with a stored outcome",
            )?,
        )?;
        let sessions_opened_total = register(
            &registry,
            IntCounter::new("sessions_opened_total", "Device sync sessions opened")?,
        )?;
        let wallets_provisioned = register(
            &registry,
            IntGauge::new("wallets_provisioned", "Wallets in the authority store")?,
        )?;
        let submit_latency_seconds = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new("submit_latency_seconds", "Time to decide an exchange batch")
                    .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            )?,
        )?;

        Ok(Self {
            registry,
            submissions_accepted_total,
            submissions_rejected_total,
            duplicate_replays_total,
            sessions_opened_total,
            wallets_provisioned,
            submit_latency_seconds,
        })
    }

    /// Encode all metrics in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// `GET /metrics`.
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
