use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Histogram bucket boundaries for response body size (bytes).
const SIZE_BUCKETS: &[f64] = &[
    100.0, 500.0, 1000.0, 5000.0, 10000.0, 50000.0, 100000.0, 500000.0, 1000000.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    ///
    /// Must be called **once** at startup before any `counter!` / `gauge!` /
    /// `histogram!` calls.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full("proxy_response_size_bytes".to_string()),
                SIZE_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // request path
        describe_counter!(
            "proxy_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed on the proxy surface"
        );
        describe_histogram!(
            "proxy_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_gauge!(
            "proxy_http_requests_in_flight",
            Unit::Count,
            "Number of requests currently being processed"
        );

        // upstream
        describe_histogram!(
            "proxy_upstream_startup_duration_seconds",
            Unit::Seconds,
            "Time to receive upstream response headers"
        );
        describe_counter!(
            "proxy_upstream_outcomes_total",
            Unit::Count,
            "Upstream fetch outcomes (started/redirect/failure/timeout/error)"
        );

        // pipes / frames
        describe_gauge!(
            "proxy_pipes_active",
            Unit::Count,
            "Number of upstream pipes currently streaming into the store"
        );
        describe_counter!(
            "proxy_frames_written_total",
            Unit::Count,
            "Total frames appended to the store, by type"
        );
        describe_histogram!(
            "proxy_response_size_bytes",
            Unit::Bytes,
            "Total bytes piped per upstream response"
        );
        describe_counter!(
            "proxy_pipe_terminal_total",
            Unit::Count,
            "Pipe terminations, by outcome (complete/abort/error)"
        );

        // store
        describe_counter!(
            "proxy_store_requests_total",
            Unit::Count,
            "Requests issued to the stream store, by operation and result"
        );

        // registry
        describe_gauge!(
            "proxy_registry_connections",
            Unit::Count,
            "Number of in-flight upstream connections tracked in the registry"
        );

        // auth
        describe_counter!(
            "proxy_auth_rejections_total",
            Unit::Count,
            "Requests rejected during capability/secret verification, by reason"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
