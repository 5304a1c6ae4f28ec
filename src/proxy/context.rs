use crate::error::ProxyError;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::StatusCode;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use std::net::IpAddr;
use std::time::Instant;

/// The body error type every response body shares. Unlike `hyper::Error`
/// (no public constructor), this can actually be built from a mid-stream
/// `reqwest::Error` when a store read is forwarded chunk-by-chunk.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Forward a store read's body to the client chunk-by-chunk rather than
/// buffering it, so a long-poll/SSE live read (`&live=...`) streams bytes as
/// the store produces them and large non-live reads never sit wholly in
/// memory (§5: "the proxy is a transparent forwarder for GET").
pub fn streaming_body<S>(stream: S) -> BoxBody
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let frames = stream.map(|chunk| chunk.map(Frame::data).map_err(|e| Box::new(e) as BoxError));
    StreamBody::new(frames).boxed()
}

/// Per-request context that flows through the router. Carries request
/// metadata and is the single exit point for error responses so that every
/// error path records the same metrics.
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub action: String,
    pub client_ip: IpAddr,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl RequestContext {
    pub fn new(method: String, path: String, action: String, client_ip: IpAddr) -> Self {
        Self {
            method,
            path,
            action,
            client_ip,
            start: Instant::now(),
            upstream_start: None,
        }
    }

    /// Build a JSON error response and record metrics in one place.
    pub fn error_response(&self, err: &ProxyError) -> hyper::Response<BoxBody> {
        let (status, code) = err.response_parts();
        self.finalize_metrics(status.as_u16());
        metrics::counter!(
            "proxy_auth_rejections_total",
            "code" => code,
        )
        .increment(1);

        with_cors(
            hyper::Response::builder()
                .status(status)
                .header("content-type", "application/json"),
        )
        .body(full_body(err.body_json()))
        .unwrap()
    }

    pub fn finalize_metrics(&self, status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status);

        metrics::counter!(
            "proxy_http_requests_total",
            "action" => self.action.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "proxy_http_request_duration_seconds",
            "action" => self.action.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "proxy_upstream_startup_duration_seconds",
                "action" => self.action.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }
    }
}

/// Attach the CORS headers every response carries, success or error.
pub fn with_cors(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("access-control-allow-origin", "*")
        .header(
            "access-control-expose-headers",
            "Location, Upstream-Content-Type, Stream-Next-Offset, Stream-Closed, Stream-Id, Stream-Response-Id, Upstream-Status",
        )
}

pub fn not_found() -> hyper::Response<BoxBody> {
    with_cors(hyper::Response::builder().status(StatusCode::NOT_FOUND))
        .header("content-type", "application/json")
        .body(full_body(r#"{"error":{"code":"NOT_FOUND","message":"not found"}}"#))
        .unwrap()
}
