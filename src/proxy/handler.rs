//! The router: dispatches the fixed `/v1/proxy*` surface (§4.E/§6.1) to the
//! create / connect / renew / read / abort / head / delete operations.
//!
//! Every response carries CORS headers (`with_cors`); every error response
//! is the uniform `{"error":{"code","message"}}` JSON shape built by
//! `ProxyError::response_parts`/`body_json` via `RequestContext::error_response`.

use crate::allowlist::filter_outbound_headers;
use crate::capability::{self, SecretOutcome, VerifyOutcome};
use crate::error::ProxyError;
use crate::frame;
use crate::pipe::{self, PipeConfig, StartOutcome, UpstreamRequest};
use crate::proxy::context::{empty_body, full_body, not_found, streaming_body, with_cors, BoxBody, RequestContext};
use crate::registry::Connection;
use crate::server::ProxyState;
use crate::store::StoreClient;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Proxy-internal request headers that must never be forwarded upstream.
const CONTROL_HEADERS: &[&str] = &[
    "upstream-url",
    "upstream-method",
    "use-stream-url",
    "stream-signed-url-ttl",
];

pub async fn handle_request(
    req: Request<Incoming>,
    state: ProxyState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let uri_path = req.uri().path().to_string();
    let query = parse_query(req.uri().query().unwrap_or(""));

    if method == Method::OPTIONS {
        return Ok(preflight_response());
    }
    if method == Method::GET && uri_path == "/health" {
        return Ok(health_response());
    }

    let mut ctx = RequestContext::new(
        method.as_str().to_string(),
        uri_path.clone(),
        "unrouted".to_string(),
        peer_addr.ip(),
    );

    let Some(rest) = uri_path.strip_prefix("/v1/proxy") else {
        return Ok(not_found());
    };

    let outcome = route(req, &state, &mut ctx, &method, rest, &query).await;
    Ok(match outcome {
        Ok(resp) => {
            ctx.finalize_metrics(resp.status().as_u16());
            resp
        }
        Err(e) => ctx.error_response(&e),
    })
}

async fn route(
    req: Request<Incoming>,
    state: &ProxyState,
    ctx: &mut RequestContext,
    method: &Method,
    rest: &str,
    query: &HashMap<String, String>,
) -> Result<Response<BoxBody>, ProxyError> {
    if rest.is_empty() || rest == "/" {
        if *method != Method::POST {
            return Err(ProxyError::InvalidAction(method.to_string()));
        }
        ctx.action = "create".to_string();
        return create(req, state, ctx).await;
    }
    if rest == "/renew" {
        if *method != Method::POST {
            return Err(ProxyError::InvalidAction(method.to_string()));
        }
        ctx.action = "renew".to_string();
        return renew(req, state, ctx).await;
    }

    let id_part = &rest[1..];
    if id_part.is_empty() || id_part.contains('/') {
        return Err(ProxyError::InvalidAction("unrouted path".to_string()));
    }
    let stream_id = percent_decode(id_part);

    match *method {
        Method::POST if query.get("action").map(String::as_str) == Some("connect") => {
            ctx.action = "connect".to_string();
            connect(stream_id, req, state, ctx).await
        }
        Method::GET => {
            ctx.action = "read".to_string();
            read(stream_id, query, state).await
        }
        Method::PATCH if query.get("action").map(String::as_str) == Some("abort") => {
            ctx.action = "abort".to_string();
            abort(stream_id, query, state).await
        }
        Method::HEAD => {
            ctx.action = "head".to_string();
            head(stream_id, req.headers(), query, state).await
        }
        Method::DELETE => {
            ctx.action = "delete".to_string();
            delete(stream_id, req.headers(), query, state).await
        }
        _ => Err(ProxyError::InvalidAction(format!("{} {}", method, rest))),
    }
}

// ---------------------------------------------------------------------
// create
// ---------------------------------------------------------------------

async fn create(
    req: Request<Incoming>,
    state: &ProxyState,
    ctx: &mut RequestContext,
) -> Result<Response<BoxBody>, ProxyError> {
    let (parts, body) = req.into_parts();
    let headers = parts.headers;
    let query = parse_query(parts.uri.query().unwrap_or(""));
    let cfg = state.config.load();

    require_secret(&headers, &query, &cfg.secret)?;

    let upstream_url = header_str(&headers, "upstream-url")
        .ok_or(ProxyError::MissingUpstreamUrl)?
        .to_string();
    if !state.allowlist.allows(&upstream_url) {
        return Err(ProxyError::UpstreamNotAllowed(upstream_url));
    }
    let upstream_method = parse_upstream_method(
        header_str(&headers, "upstream-method").ok_or(ProxyError::MissingUpstreamMethod)?,
    )?;

    // Stream reuse: validate before spending an upstream round-trip.
    let reuse_stream_id = match header_str(&headers, "use-stream-url") {
        Some(raw) => Some(validate_use_stream_url(raw, &cfg.secret, state).await?),
        None => None,
    };

    let outbound_headers = outbound_request_headers(&headers);
    let body_bytes = body
        .collect()
        .await
        .map_err(|e| ProxyError::Internal(e.to_string()))?
        .to_bytes();
    let body_opt = if body_bytes.is_empty() { None } else { Some(body_bytes) };

    ctx.upstream_start = Some(std::time::Instant::now());
    let (outcome, resp) = pipe::start_upstream(
        &state.upstream_client,
        UpstreamRequest {
            url: upstream_url,
            method: upstream_method,
            headers: outbound_headers,
            body: body_opt,
        },
        Duration::from_millis(cfg.startup_timeout_ms),
    )
    .await;

    let (status, content_type, response_headers) = match outcome {
        StartOutcome::Timeout => return Err(ProxyError::UpstreamTimeout),
        StartOutcome::TransportError(e) => return Err(ProxyError::UpstreamError(e)),
        StartOutcome::Redirect => return Err(ProxyError::RedirectNotAllowed),
        StartOutcome::UpstreamFailure { status, body } => {
            return Ok(upstream_failure_response(status, body))
        }
        StartOutcome::Started {
            status,
            content_type,
            headers,
        } => (status, content_type, headers),
    };
    let resp = resp.expect("StartOutcome::Started always carries a response");

    let (stream_id, created) = match reuse_stream_id {
        Some(id) => (id, false),
        None => {
            let id = Uuid::now_v7().to_string();
            state
                .store
                .create(&id, cfg.stream_ttl_seconds, content_type.as_deref())
                .await
                .map_err(|e| {
                    state.registry.forget(&id);
                    e
                })?;
            (id, true)
        }
    };

    let response_id = if created {
        state.registry.allocate_response_id(&stream_id, || async { None }).await
    } else {
        let store = state.store.clone();
        let bootstrap_id = stream_id.clone();
        state
            .registry
            .allocate_response_id(&stream_id, || async move {
                bootstrap_max_response_id(&store, &bootstrap_id).await
            })
            .await
    };

    if let Some(ct) = &content_type {
        state.registry.set_content_type(&stream_id, ct.clone());
    }

    let (connection_id, connection) = state.registry.register(&stream_id, response_id);
    spawn_pipe(
        state,
        stream_id.clone(),
        response_id,
        status,
        response_headers,
        resp,
        connection_id,
        connection,
    );

    let origin = request_origin(&headers);
    let ttl = url_ttl_override(&headers, cfg.url_ttl_seconds);
    let signed_url = capability::mint_signed_url(&origin, &cfg.secret, &stream_id, now_unix() + ttl as i64);

    let mut builder = with_cors(Response::builder()
        .status(if created { StatusCode::CREATED } else { StatusCode::OK })
        .header("location", signed_url.as_str())
        .header("stream-id", stream_id.as_str())
        .header("stream-response-id", response_id.to_string()));
    if let Some(ct) = content_type {
        builder = builder.header("upstream-content-type", ct);
    }
    Ok(builder.body(empty_body()).unwrap())
}

/// Parse and HMAC-verify a `Use-Stream-URL` value (ignoring expiry), then
/// HEAD the referenced stream. Returns the stream id on success.
async fn validate_use_stream_url(
    raw: &str,
    secret: &str,
    state: &ProxyState,
) -> Result<String, ProxyError> {
    let (stream_id, expires, signature) =
        parse_stream_url(raw).ok_or(ProxyError::MalformedStreamUrl)?;
    match capability::verify_signed_url(secret, &stream_id, &expires, &signature, now_unix(), false) {
        VerifyOutcome::Invalid => return Err(ProxyError::MalformedStreamUrl),
        VerifyOutcome::Ok | VerifyOutcome::Expired => {}
    }
    let meta = state.store.head(&stream_id).await?;
    if meta.closed {
        return Err(ProxyError::StreamClosed);
    }
    Ok(stream_id)
}

// ---------------------------------------------------------------------
// connect
// ---------------------------------------------------------------------

async fn connect(
    stream_id: String,
    req: Request<Incoming>,
    state: &ProxyState,
    ctx: &mut RequestContext,
) -> Result<Response<BoxBody>, ProxyError> {
    let headers = req.headers().clone();
    let query = parse_query(req.uri().query().unwrap_or(""));
    let cfg = state.config.load();

    require_secret(&headers, &query, &cfg.secret)?;

    if let Some(upstream_url) = header_str(&headers, "upstream-url") {
        let upstream_url = upstream_url.to_string();
        if !state.allowlist.allows(&upstream_url) {
            return Err(ProxyError::UpstreamNotAllowed(upstream_url));
        }
        let outbound_headers = outbound_request_headers(&headers);
        ctx.upstream_start = Some(std::time::Instant::now());
        let (outcome, _resp) = pipe::start_upstream(
            &state.upstream_client,
            UpstreamRequest {
                url: upstream_url,
                method: reqwest::Method::GET,
                headers: outbound_headers,
                body: None,
            },
            Duration::from_millis(cfg.startup_timeout_ms),
        )
        .await;
        match outcome {
            StartOutcome::Started { .. } => {}
            StartOutcome::Timeout => return Err(ProxyError::UpstreamTimeout),
            StartOutcome::TransportError(e) => return Err(ProxyError::UpstreamError(e)),
            StartOutcome::Redirect => return Err(ProxyError::RedirectNotAllowed),
            StartOutcome::UpstreamFailure { status, body } => {
                return Ok(upstream_failure_response(status, body))
            }
        }
    }

    let existed = match state.store.head(&stream_id).await {
        Ok(_) => true,
        Err(ProxyError::StreamNotFound) => false,
        Err(e) => return Err(e),
    };
    if !existed {
        state.store.create(&stream_id, cfg.stream_ttl_seconds, None).await?;
    }

    let origin = request_origin(&headers);
    let ttl = url_ttl_override(&headers, cfg.url_ttl_seconds);
    let signed_url = capability::mint_signed_url(&origin, &cfg.secret, &stream_id, now_unix() + ttl as i64);

    Ok(with_cors(Response::builder()
        .status(if existed { StatusCode::OK } else { StatusCode::CREATED })
        .header("location", signed_url.as_str()))
        .body(empty_body())
        .unwrap())
}

// ---------------------------------------------------------------------
// renew
// ---------------------------------------------------------------------

async fn renew(
    req: Request<Incoming>,
    state: &ProxyState,
    ctx: &mut RequestContext,
) -> Result<Response<BoxBody>, ProxyError> {
    let headers = req.headers().clone();
    let query = parse_query(req.uri().query().unwrap_or(""));
    let cfg = state.config.load();

    require_secret(&headers, &query, &cfg.secret)?;

    let use_stream_url =
        header_str(&headers, "use-stream-url").ok_or(ProxyError::MalformedStreamUrl)?;
    let (stream_id, expires, signature) =
        parse_stream_url(use_stream_url).ok_or(ProxyError::MalformedStreamUrl)?;
    match capability::verify_signed_url(&cfg.secret, &stream_id, &expires, &signature, now_unix(), false) {
        VerifyOutcome::Invalid => return Err(ProxyError::MalformedStreamUrl),
        VerifyOutcome::Ok | VerifyOutcome::Expired => {}
    }

    let upstream_url = header_str(&headers, "upstream-url")
        .ok_or(ProxyError::MissingUpstreamUrl)?
        .to_string();
    if !state.allowlist.allows(&upstream_url) {
        return Err(ProxyError::UpstreamNotAllowed(upstream_url));
    }

    let outbound_headers = outbound_request_headers(&headers);
    ctx.upstream_start = Some(std::time::Instant::now());
    let (outcome, _resp) = pipe::start_upstream(
        &state.upstream_client,
        UpstreamRequest {
            url: upstream_url,
            method: reqwest::Method::GET,
            headers: outbound_headers,
            body: None,
        },
        Duration::from_millis(cfg.startup_timeout_ms),
    )
    .await;
    match outcome {
        StartOutcome::Started { .. } => {}
        StartOutcome::Timeout => return Err(ProxyError::UpstreamTimeout),
        StartOutcome::TransportError(e) => return Err(ProxyError::UpstreamError(e)),
        StartOutcome::Redirect | StartOutcome::UpstreamFailure { .. } => {
            return Err(ProxyError::RenewalRejected)
        }
    }

    let origin = request_origin(&headers);
    let ttl = url_ttl_override(&headers, cfg.url_ttl_seconds);
    let signed_url = capability::mint_signed_url(&origin, &cfg.secret, &stream_id, now_unix() + ttl as i64);

    Ok(with_cors(Response::builder().status(StatusCode::OK).header("location", signed_url.as_str()))
        .body(empty_body())
        .unwrap())
}

// ---------------------------------------------------------------------
// read / abort / head / delete
// ---------------------------------------------------------------------

async fn read(
    stream_id: String,
    query: &HashMap<String, String>,
    state: &ProxyState,
) -> Result<Response<BoxBody>, ProxyError> {
    let cfg = state.config.load();
    require_read_capability(&cfg.secret, &stream_id, query)?;

    let offset = query.get("offset").map(String::as_str).unwrap_or("-1");
    let live = query.get("live").map(String::as_str);
    let (body_stream, meta) = state.store.read(&stream_id, offset, live).await?;

    let mut builder = with_cors(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/octet-stream")
        .header("stream-next-offset", meta.next_offset)
        .header("stream-closed", meta.closed.to_string()));
    if let Some(ct) = state.registry.content_type(&stream_id) {
        builder = builder.header("upstream-content-type", ct);
    }
    Ok(builder.body(streaming_body(body_stream)).unwrap())
}

async fn abort(
    stream_id: String,
    query: &HashMap<String, String>,
    state: &ProxyState,
) -> Result<Response<BoxBody>, ProxyError> {
    let cfg = state.config.load();
    require_read_capability(&cfg.secret, &stream_id, query)?;

    let outcome = state.registry.abort_stream(&stream_id);
    let status_str = match outcome {
        crate::registry::AbortOutcome::Aborted => "aborted",
        crate::registry::AbortOutcome::AlreadyAborted => "already_aborted",
        crate::registry::AbortOutcome::AlreadyCompleted => "already_completed",
    };
    Ok(with_cors(Response::builder().status(StatusCode::OK).header("content-type", "application/json"))
        .body(full_body(format!(r#"{{"status":"{}"}}"#, status_str)))
        .unwrap())
}

async fn head(
    stream_id: String,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    state: &ProxyState,
) -> Result<Response<BoxBody>, ProxyError> {
    let cfg = state.config.load();
    require_secret(headers, query, &cfg.secret)?;

    let meta = state.store.head(&stream_id).await?;
    let mut builder = with_cors(Response::builder()
        .status(StatusCode::OK)
        .header("stream-next-offset", meta.next_offset)
        .header("stream-closed", meta.closed.to_string()));
    if let Some(total) = meta.total_size {
        builder = builder.header("stream-total-size", total.to_string());
    }
    if let Some(exp) = meta.expires_at {
        builder = builder.header("stream-expires-at", exp.to_string());
    }
    if let Some(ct) = state.registry.content_type(&stream_id) {
        builder = builder.header("upstream-content-type", ct);
    }
    Ok(builder.body(empty_body()).unwrap())
}

async fn delete(
    stream_id: String,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    state: &ProxyState,
) -> Result<Response<BoxBody>, ProxyError> {
    let cfg = state.config.load();
    require_secret(headers, query, &cfg.secret)?;

    state.store.delete(&stream_id).await?;
    state.registry.forget(&stream_id);
    Ok(with_cors(Response::builder().status(StatusCode::NO_CONTENT))
        .body(empty_body())
        .unwrap())
}

// ---------------------------------------------------------------------
// shared helpers
// ---------------------------------------------------------------------

fn preflight_response() -> Response<BoxBody> {
    with_cors(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("access-control-allow-methods", "GET, POST, PATCH, DELETE, OPTIONS")
        .header(
            "access-control-allow-headers",
            "Content-Type, Authorization, Upstream-URL, Upstream-Method, Upstream-Authorization, Stream-Signed-URL-TTL",
        ))
        .body(empty_body())
        .unwrap()
}

fn health_response() -> Response<BoxBody> {
    with_cors(Response::builder().status(StatusCode::OK).header("content-type", "application/json"))
        .body(full_body(r#"{"status":"ok"}"#))
        .unwrap()
}

/// Build the 502 pass-through response for an upstream 4xx/5xx (§4.D step 3):
/// the body is relayed untouched, the real status is exposed via
/// `Upstream-Status`, and no stream is created.
fn upstream_failure_response(status: u16, body: Bytes) -> Response<BoxBody> {
    with_cors(Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header("upstream-status", status.to_string()))
        .body(full_body(body))
        .unwrap()
}

fn require_secret(headers: &HeaderMap, query: &HashMap<String, String>, expected: &str) -> Result<(), ProxyError> {
    match capability::verify_service_secret(secret_param(headers, query).as_deref(), expected) {
        SecretOutcome::Ok => Ok(()),
        SecretOutcome::Missing => Err(ProxyError::MissingSecret),
        SecretOutcome::Invalid => Err(ProxyError::InvalidSecret),
    }
}

/// Read/abort capability check: HMAC must be valid *and* unexpired.
fn require_read_capability(secret: &str, stream_id: &str, query: &HashMap<String, String>) -> Result<(), ProxyError> {
    let expires = query.get("expires").map(String::as_str).unwrap_or("");
    let signature = query.get("signature").map(String::as_str).unwrap_or("");
    match capability::verify_signed_url(secret, stream_id, expires, signature, now_unix(), true) {
        VerifyOutcome::Ok => Ok(()),
        VerifyOutcome::Expired => Err(ProxyError::SignatureExpired),
        VerifyOutcome::Invalid => Err(ProxyError::SignatureInvalid),
    }
}

fn secret_param(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    if let Some(s) = query.get("secret") {
        if !s.is_empty() {
            return Some(s.clone());
        }
    }
    if let Some(auth) = headers.get(http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    None
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_upstream_method(raw: &str) -> Result<reqwest::Method, ProxyError> {
    match raw.to_ascii_uppercase().as_str() {
        "GET" => Ok(reqwest::Method::GET),
        "POST" => Ok(reqwest::Method::POST),
        "PUT" => Ok(reqwest::Method::PUT),
        "PATCH" => Ok(reqwest::Method::PATCH),
        "DELETE" => Ok(reqwest::Method::DELETE),
        other => Err(ProxyError::InvalidUpstreamMethod(other.to_string())),
    }
}

/// Strip proxy control headers, then apply the hop-by-hop filter and the
/// `Upstream-Authorization` → `Authorization` translation (§4.B).
fn outbound_request_headers(src: &HeaderMap) -> HeaderMap {
    let mut trimmed = src.clone();
    for name in CONTROL_HEADERS {
        trimmed.remove(*name);
    }
    filter_outbound_headers(&trimmed)
}

fn request_origin(headers: &HeaderMap) -> String {
    let scheme = header_str(headers, "x-forwarded-proto").unwrap_or("http");
    let host = header_str(headers, "host").unwrap_or("localhost");
    format!("{}://{}", scheme, host)
}

fn url_ttl_override(headers: &HeaderMap, default_secs: u64) -> u64 {
    header_str(headers, "stream-signed-url-ttl")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_secs)
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Parse `{origin}/v1/proxy/{streamId}?expires=…&signature=…` into its parts.
fn parse_stream_url(raw: &str) -> Option<(String, String, String)> {
    let (path_part, query_part) = raw.split_once('?').unwrap_or((raw, ""));
    let marker = "/v1/proxy/";
    let idx = path_part.find(marker)?;
    let stream_id = percent_decode(&path_part[idx + marker.len()..]);
    if stream_id.is_empty() {
        return None;
    }
    let query = parse_query(query_part);
    let expires = query.get("expires")?.clone();
    let signature = query.get("signature")?.clone();
    Some((stream_id, expires, signature))
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        map.insert(percent_decode(k), percent_decode(v));
    }
    map
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Scan a stream's existing frames once to recover the current max response
/// id — the registry's allocator bootstrap (§3 Response id, §9).
async fn bootstrap_max_response_id(store: &StoreClient, stream_id: &str) -> Option<u32> {
    let (stream, _) = store.read(stream_id, "-1", None).await.ok()?;
    let bytes = stream
        .try_fold(bytes::BytesMut::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
        .ok()?;
    let (frames, _) = frame::decode_all(&bytes);
    frames.iter().map(|f| f.response_id).max()
}

/// Spawn the background task that drives the upstream pipe and unregisters
/// the connection once its terminal frame is written (§4.D/§4.E).
fn spawn_pipe(
    state: &ProxyState,
    stream_id: String,
    response_id: u32,
    status: u16,
    headers: Vec<(String, String)>,
    resp: reqwest::Response,
    connection_id: u32,
    connection: Arc<Connection>,
) {
    let store = state.store.clone();
    let registry = state.registry.clone();
    let cfg = state.config.load();
    let pipe_config = PipeConfig {
        batch_size_bytes: cfg.batch_size_bytes,
        batch_time: Duration::from_millis(cfg.batch_time_ms),
        inactivity_timeout: Duration::from_millis(cfg.inactivity_ms),
        startup_timeout: Duration::from_millis(cfg.startup_timeout_ms),
        max_response_bytes: cfg.max_response_bytes,
    };
    let cancel = connection.cancel.clone();
    let terminal_written = connection.terminal_written.clone();

    tokio::spawn(async move {
        metrics::gauge!("proxy_pipes_active").increment(1.0);
        pipe::run_pipe(
            &store,
            &stream_id,
            response_id,
            status,
            headers,
            resp,
            cancel,
            terminal_written,
            &pipe_config,
        )
        .await;
        metrics::gauge!("proxy_pipes_active").decrement(1.0);
        registry.unregister(&stream_id, connection_id);
    });
}
