use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

#[derive(Clone)]
pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Fails if one is already set.
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;

        describe_counter!("strategy_items_claimed_total", "Items claimed from the source stream");
        describe_counter!("strategy_items_processed_total", "Items classified and run through the emitter");
        describe_counter!("strategy_classify_failures_total", "Items whose classification failed");
        describe_counter!("strategy_signals_emitted_total", "Buy/sell signals emitted, by decision");
        describe_counter!("strategy_sink_failures_total", "Failed signal deliveries, by sink");
        describe_counter!("strategy_claim_failures_total", "Failed stream claims");
        describe_counter!("strategy_ack_failures_total", "Failed acknowledgments");
        describe_gauge!("strategy_backoff_delay_ms", "Current claim backoff delay");
        describe_histogram!("strategy_item_duration_ms", "Per-item processing time");

        Ok(Self { handle })
    }

    /// Router exposing `/metrics` in the Prometheus exposition format.
    pub fn router<S>(&self) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
