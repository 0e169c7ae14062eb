//! Prometheus scrape endpoint for the sync service's counters.

use std::net::SocketAddr;

use anyhow::Context;
use axum::{extract::State, routing::get, Router};
use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::MetricsConfig;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder once per process and serve it on
/// `cfg.path` until `shutdown` fires.
pub fn init(cfg: &MetricsConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr = cfg
        .bind_addr
        .parse()
        .with_context(|| format!("invalid metrics bind address {}", cfg.bind_addr))?;
    if !cfg.path.starts_with('/') {
        anyhow::bail!("metrics path must start with '/', got {}", cfg.path);
    }

    let handle = PROM_HANDLE
        .get_or_try_init(|| PrometheusBuilder::new().install_recorder())
        .context("failed to install Prometheus metrics recorder")?
        .clone();
    describe();

    let app = router(handle, &cfg.path);
    let path = cfg.path.clone();
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(%addr, path = %path, "metrics listening");
                let served = axum::serve(listener, app.into_make_service())
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await;
                if let Err(e) = served {
                    tracing::error!(error = %e, "metrics server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, %addr, "failed to bind metrics listener");
            }
        }
    });
    Ok(())
}

pub fn router(handle: PrometheusHandle, path: &str) -> Router {
    Router::new().route(path, get(render)).with_state(handle)
}

async fn render(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

/// Help text for every series the service records.
pub fn describe() {
    describe_counter!("readings_fetched_total", "Raw readings received from the vendor");
    describe_counter!(
        "readings_quarantined_total",
        "Readings dropped before reconciliation, by reason"
    );
    describe_counter!(
        "reconcile_anomalies_total",
        "Negative deltas clamped or skipped during reconciliation"
    );
    describe_counter!(
        "statistic_points_written_total",
        "Statistic points committed to QuestDB"
    );
    describe_counter!("questdb_sink_errors_total", "QuestDB writes or reads that gave up");
    describe_counter!("poll_cycles_total", "Finished poll cycles, by outcome");
    describe_counter!(
        "poll_ticks_skipped_total",
        "Ticks skipped because the meter was still busy"
    );
    describe_counter!("backfill_requests_total", "History re-imports, by outcome");
    describe_counter!("vendor_fetch_errors_total", "Failed vendor requests, by kind");
    describe_histogram!(
        "vendor_fetch_latency_seconds",
        Unit::Seconds,
        "Latency of one vendor reading request"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn serves_described_series_on_the_configured_path() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            describe();
            metrics::counter!("poll_cycles_total", "outcome" => "ok").increment(2);
        });

        let app = router(handle, "/stats/prometheus");
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/stats/prometheus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("# HELP poll_cycles_total Finished poll cycles, by outcome"));
        assert!(text.contains(r#"poll_cycles_total{outcome="ok"} 2"#));

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
