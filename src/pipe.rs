//! Upstream pipe: fetch an upstream HTTP response and stream it into the
//! store as framed, batched writes, with startup/inactivity timeouts and
//! cooperative cancellation.

use crate::allowlist::filter_response_headers;
use crate::frame::Frame;
use crate::store::StoreClient;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub struct PipeConfig {
    pub batch_size_bytes: usize,
    pub batch_time: Duration,
    pub inactivity_timeout: Duration,
    pub startup_timeout: Duration,
    pub max_response_bytes: u64,
}

pub struct UpstreamRequest {
    pub url: String,
    pub method: reqwest::Method,
    pub headers: http::HeaderMap,
    pub body: Option<Bytes>,
}

/// Outcome of attempting to start the upstream fetch — determines whether a
/// stream is created at all (§4.D steps 2-3).
pub enum StartOutcome {
    /// 2xx — a stream should be created and the pipe driven in the background.
    Started {
        status: u16,
        content_type: Option<String>,
        headers: Vec<(String, String)>,
    },
    Redirect,
    UpstreamFailure {
        status: u16,
        body: Bytes,
    },
    Timeout,
    TransportError(String),
}

/// Issue the upstream request and inspect only its headers/status — the
/// caller decides whether to create a stream before any bytes are piped.
pub async fn start_upstream(
    client: &reqwest::Client,
    req: UpstreamRequest,
    startup_timeout: Duration,
) -> (StartOutcome, Option<reqwest::Response>) {
    let mut builder = client.request(req.method, &req.url).headers(req.headers);
    if let Some(body) = req.body {
        builder = builder.body(body);
    }

    let result = tokio::time::timeout(startup_timeout, builder.send()).await;
    let resp = match result {
        Err(_) => {
            metrics::counter!("proxy_upstream_outcomes_total", "outcome" => "timeout").increment(1);
            return (StartOutcome::Timeout, None);
        }
        Ok(Err(e)) => {
            metrics::counter!("proxy_upstream_outcomes_total", "outcome" => "error").increment(1);
            return (StartOutcome::TransportError(e.to_string()), None);
        }
        Ok(Ok(resp)) => resp,
    };

    let status = resp.status();
    if status.is_redirection() {
        metrics::counter!("proxy_upstream_outcomes_total", "outcome" => "redirect").increment(1);
        return (StartOutcome::Redirect, None);
    }
    if !status.is_success() {
        metrics::counter!("proxy_upstream_outcomes_total", "outcome" => "failure").increment(1);
        let body = resp.bytes().await.unwrap_or_default();
        let truncated = if body.len() > 64 * 1024 {
            body.slice(0..64 * 1024)
        } else {
            body
        };
        return (
            StartOutcome::UpstreamFailure {
                status: status.as_u16(),
                body: truncated,
            },
            None,
        );
    }

    metrics::counter!("proxy_upstream_outcomes_total", "outcome" => "started").increment(1);
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let headers = filter_response_headers(resp.headers());

    (
        StartOutcome::Started {
            status: status.as_u16(),
            content_type,
            headers,
        },
        Some(resp),
    )
}

/// Drive an already-started 2xx upstream response into the store as framed,
/// batched writes. Runs until the upstream body ends, errors, is cancelled,
/// or goes inactive/oversized. Writes exactly one terminal frame.
pub async fn run_pipe(
    store: &StoreClient,
    stream_id: &str,
    response_id: u32,
    status: u16,
    headers: Vec<(String, String)>,
    resp: reqwest::Response,
    cancel: CancellationToken,
    terminal_written: Arc<std::sync::atomic::AtomicBool>,
    config: &PipeConfig,
) {
    let start_frame = Frame::start(response_id, status, &headers);
    if let Err(e) = store.append(stream_id, start_frame.encode()).await {
        tracing::warn!("pipe: failed to write start frame, stream={}, error={}", stream_id, e);
        mark_terminal(&terminal_written);
        return;
    }
    metrics::counter!("proxy_frames_written_total", "type" => "start").increment(1);

    let mut stream = resp.bytes_stream();
    let mut buf = BytesMut::new();
    let mut batch_start = Instant::now();
    let mut total_bytes: u64 = 0;
    let mut inactivity = Box::pin(tokio::time::sleep(config.inactivity_timeout));

    let terminal = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                flush(store, stream_id, response_id, &mut buf).await;
                break Frame::abort(response_id);
            }
            _ = &mut inactivity => {
                flush(store, stream_id, response_id, &mut buf).await;
                break Frame::error(response_id, "INACTIVITY_TIMEOUT", "no upstream bytes received within the inactivity window");
            }
            chunk = stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        total_bytes += bytes.len() as u64;
                        buf.extend_from_slice(&bytes);
                        inactivity.as_mut().reset(tokio::time::Instant::now() + config.inactivity_timeout);

                        if total_bytes > config.max_response_bytes {
                            flush(store, stream_id, response_id, &mut buf).await;
                            break Frame::error(response_id, "RESPONSE_TOO_LARGE", "upstream response exceeded the configured size cap");
                        }

                        if buf.len() >= config.batch_size_bytes || batch_start.elapsed() >= config.batch_time {
                            flush(store, stream_id, response_id, &mut buf).await;
                            batch_start = Instant::now();
                        }
                    }
                    Some(Err(e)) => {
                        flush(store, stream_id, response_id, &mut buf).await;
                        break Frame::error(response_id, "UPSTREAM_ERROR", &e.to_string());
                    }
                    None => {
                        flush(store, stream_id, response_id, &mut buf).await;
                        break Frame::complete(response_id);
                    }
                }
            }
        }
    };

    mark_terminal(&terminal_written);
    let terminal_kind = match &terminal.frame_type {
        crate::frame::FrameType::Complete => "complete",
        crate::frame::FrameType::Abort => "abort",
        _ => "error",
    };
    metrics::counter!("proxy_pipe_terminal_total", "outcome" => terminal_kind).increment(1);
    metrics::counter!("proxy_frames_written_total", "type" => terminal_kind).increment(1);
    metrics::histogram!("proxy_response_size_bytes").record(total_bytes as f64);
    if let Err(e) = store.append(stream_id, terminal.encode()).await {
        tracing::warn!(
            "pipe: failed to write terminal frame, stream={}, response_id={}, error={}",
            stream_id,
            response_id,
            e
        );
    }
}

fn mark_terminal(flag: &std::sync::atomic::AtomicBool) {
    flag.store(true, Ordering::Release);
}

async fn flush(store: &StoreClient, stream_id: &str, response_id: u32, buf: &mut BytesMut) {
    if buf.is_empty() {
        return;
    }
    let payload = buf.split().freeze();
    let frame = Frame::data(response_id, payload);
    if let Err(e) = store.append(stream_id, frame.encode()).await {
        tracing::warn!(
            "pipe: failed to flush data frame, stream={}, response_id={}, error={}",
            stream_id,
            response_id,
            e
        );
        return;
    }
    metrics::counter!("proxy_frames_written_total", "type" => "data").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_config_defaults_are_sane() {
        let cfg = PipeConfig {
            batch_size_bytes: 4096,
            batch_time: Duration::from_millis(50),
            inactivity_timeout: Duration::from_secs(600),
            startup_timeout: Duration::from_secs(60),
            max_response_bytes: 100 * 1024 * 1024,
        };
        assert_eq!(cfg.batch_size_bytes, 4096);
        assert_eq!(cfg.batch_time, Duration::from_millis(50));
    }
}
