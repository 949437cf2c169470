//! Prometheus metrics for the collector.
//!
//! Exposes:
//! - `tgspyder_pipeline_duration_seconds` (histogram per mode)
//! - `tgspyder_pipeline_total` (counter with outcome)
//! - `tgspyder_pipeline_inflight` (gauge)
//! - `tgspyder_api_calls_total` (counter with status)
//! - `tgspyder_rows_written_total`, `tgspyder_duplicates_dropped_total`,
//!   `tgspyder_malformed_items_total` (counters per mode)
//! - `tgspyder_flood_wait_seconds_total` (counter)
//! - process metrics via `process` collector

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use prometheus::process_collector::ProcessCollector;
use prometheus::{
    default_registry, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge_vec, Encoder, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec,
    TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

static PROCESS_COLLECTOR: Lazy<()> = Lazy::new(|| {
    if let Err(err) = default_registry().register(Box::new(ProcessCollector::for_self())) {
        warn!("Failed to register process collector: {}", err);
    }
});

static PIPELINE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    // Exponential buckets from 1s up to ~4.5 hours.
    let buckets =
        prometheus::exponential_buckets(1.0, 2.0, 15).expect("failed to create histogram buckets");
    register_histogram_vec!(
        "tgspyder_pipeline_duration_seconds",
        "Collection pipeline duration in seconds",
        &["mode"],
        buckets
    )
    .expect("failed to register pipeline duration histogram")
});

static PIPELINE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tgspyder_pipeline_total",
        "Finished collection pipelines by outcome",
        &["mode", "outcome"]
    )
    .expect("failed to register pipeline counter")
});

static PIPELINE_INFLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "tgspyder_pipeline_inflight",
        "Number of running collection pipelines",
        &["mode"]
    )
    .expect("failed to register inflight gauge")
});

static API_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tgspyder_api_calls_total",
        "Page fetches by result",
        &["mode", "status"]
    )
    .expect("failed to register api call counter")
});

static ROWS_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tgspyder_rows_written_total",
        "Rows handed to the output sink",
        &["mode"]
    )
    .expect("failed to register rows counter")
});

static DUPLICATES_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tgspyder_duplicates_dropped_total",
        "Items dropped as already seen",
        &["mode"]
    )
    .expect("failed to register duplicates counter")
});

static MALFORMED_ITEMS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tgspyder_malformed_items_total",
        "Items skipped because they could not be transformed",
        &["mode"]
    )
    .expect("failed to register malformed counter")
});

static FLOOD_WAIT_SECONDS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tgspyder_flood_wait_seconds_total",
        "Seconds of server-requested cooldown"
    )
    .expect("failed to register flood wait counter")
});

/// Ensure collectors are registered.
fn init_collectors() {
    Lazy::force(&PROCESS_COLLECTOR);
    Lazy::force(&PIPELINE_DURATION);
    Lazy::force(&PIPELINE_TOTAL);
    Lazy::force(&PIPELINE_INFLIGHT);
    Lazy::force(&API_CALLS);
    Lazy::force(&ROWS_WRITTEN);
    Lazy::force(&DUPLICATES_DROPPED);
    Lazy::force(&MALFORMED_ITEMS);
    Lazy::force(&FLOOD_WAIT_SECONDS);
}

/// Increment inflight gauge for a pipeline.
pub fn record_pipeline_start(mode: &'static str) {
    init_collectors();
    PIPELINE_INFLIGHT.with_label_values(&[mode]).inc();
}

/// Record pipeline completion with duration and outcome label.
pub fn record_pipeline_result(mode: &'static str, duration: Duration, outcome: &str) {
    init_collectors();
    PIPELINE_INFLIGHT.with_label_values(&[mode]).dec();
    PIPELINE_DURATION
        .with_label_values(&[mode])
        .observe(duration.as_secs_f64());
    PIPELINE_TOTAL.with_label_values(&[mode, outcome]).inc();
}

/// Count one page fetch; `status` is `ok`, `flood_wait`, `transient` or `error`.
pub fn record_api_call(mode: &'static str, status: &'static str) {
    API_CALLS.with_label_values(&[mode, status]).inc();
}

pub fn record_rows(mode: &'static str, rows: u64) {
    ROWS_WRITTEN.with_label_values(&[mode]).inc_by(rows);
}

pub fn record_duplicates(mode: &'static str, count: u64) {
    DUPLICATES_DROPPED.with_label_values(&[mode]).inc_by(count);
}

pub fn record_malformed(mode: &'static str) {
    MALFORMED_ITEMS.with_label_values(&[mode]).inc();
}

pub fn record_flood_wait(wait: Duration) {
    FLOOD_WAIT_SECONDS.inc_by(wait.as_secs());
}

fn plain_response(status: StatusCode, body: Full<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

async fn metrics_response() -> Result<Response<Full<Bytes>>, Infallible> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", err);
        return Ok(plain_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            Full::from("encode error"),
        ));
    }

    let mut response = plain_response(StatusCode::OK, Full::from(buffer));
    if let Ok(value) = hyper::header::HeaderValue::from_str(encoder.format_type()) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    Ok(response)
}

async fn handle_request(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    match req.uri().path() {
        "/metrics" => metrics_response().await,
        _ => Ok(plain_response(StatusCode::NOT_FOUND, Full::new(Bytes::new()))),
    }
}

async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Prometheus metrics endpoint started");

    loop {
        let (stream, peer) = listener.accept().await?;
        let service = service_fn(handle_request);
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                warn!(?peer, "Metrics connection error: {}", err);
            }
        });
    }
}

/// Spawn the metrics HTTP endpoint on the given address.
pub fn spawn_metrics_server(addr: SocketAddr) {
    init_collectors();
    tokio::spawn(async move {
        if let Err(err) = serve(addr).await {
            error!(%addr, "Metrics server failed: {}", err);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn records_pipeline_lifecycle() {
        let mode = "test_pipeline_lifecycle";

        record_pipeline_start(mode);
        assert_eq!(PIPELINE_INFLIGHT.with_label_values(&[mode]).get(), 1);

        record_pipeline_result(mode, Duration::from_secs(3), "done");

        assert_eq!(PIPELINE_INFLIGHT.with_label_values(&[mode]).get(), 0);
        assert_eq!(PIPELINE_TOTAL.with_label_values(&[mode, "done"]).get(), 1);
        assert_eq!(
            PIPELINE_DURATION
                .with_label_values(&[mode])
                .get_sample_count(),
            1
        );
    }

    #[test]
    fn counters_accumulate_per_mode() {
        init_collectors();
        let mode = "test_counters_per_mode";
        record_rows(mode, 50);
        record_rows(mode, 20);
        record_duplicates(mode, 3);
        record_malformed(mode);
        record_api_call(mode, "ok");
        record_api_call(mode, "flood_wait");

        assert_eq!(ROWS_WRITTEN.with_label_values(&[mode]).get(), 70);
        assert_eq!(DUPLICATES_DROPPED.with_label_values(&[mode]).get(), 3);
        assert_eq!(MALFORMED_ITEMS.with_label_values(&[mode]).get(), 1);
        assert_eq!(API_CALLS.with_label_values(&[mode, "ok"]).get(), 1);
        assert_eq!(API_CALLS.with_label_values(&[mode, "flood_wait"]).get(), 1);
    }

    #[test]
    fn flood_wait_seconds_only_grow() {
        init_collectors();
        let before = FLOOD_WAIT_SECONDS.get();
        record_flood_wait(Duration::from_secs(30));
        assert!(FLOOD_WAIT_SECONDS.get() >= before + 30);
    }

    #[tokio::test]
    async fn metrics_response_contains_registered_metrics() {
        let mode = "test_metrics_response";
        record_pipeline_start(mode);
        record_pipeline_result(mode, Duration::from_millis(10), "failed");

        let response = metrics_response().await.expect("metrics response");
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(hyper::header::CONTENT_TYPE)
            .expect("content type");
        assert!(content_type.to_str().unwrap().contains("text/"));

        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect metrics body")
            .to_bytes();
        let text = String::from_utf8(body_bytes.to_vec()).expect("utf-8 metrics body");
        assert!(text.contains("tgspyder_pipeline_total"));
        assert!(text.contains("tgspyder_pipeline_duration_seconds"));
        assert!(text.contains(mode));
    }
}
