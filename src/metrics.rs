//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics recorder
/// Returns a handle that can be used to render the current snapshot
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    tracing::info!("Prometheus metrics recorder installed");

    Ok(handle)
}

/// Record an engine callback or internal request queued on the bridge
pub fn record_bridged_event(kind: &'static str) {
    metrics::counter!("engine_bridge_events_total", "kind" => kind).increment(1);
}

/// Record a download start command forwarded to the engine
pub fn record_download_started(identifier: &str) {
    metrics::counter!("engine_bridge_downloads_started_total",
        "model" => identifier.to_string()
    )
    .increment(1);
}

/// Record a generation run
pub fn record_run_started(identifier: &str) {
    metrics::counter!("engine_bridge_runs_total",
        "model" => identifier.to_string()
    )
    .increment(1);
}

/// Record a run that stopped early
pub fn record_run_cancelled(identifier: &str) {
    metrics::counter!("engine_bridge_runs_cancelled_total",
        "model" => identifier.to_string()
    )
    .increment(1);
}

/// Update catalog size gauge
pub fn update_catalog_size(count: usize) {
    metrics::gauge!("engine_bridge_catalog_models").set(count as f64);
}
