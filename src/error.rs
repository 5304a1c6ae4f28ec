use http::StatusCode;
use std::fmt;

/// Domain error taxonomy. Every variant maps to exactly one `(StatusCode,
/// code)` pair via `response_parts` — the single place that mapping lives,
/// so every call site that builds an error response goes through it.
#[derive(Debug)]
pub enum ProxyError {
    MissingSecret,
    InvalidSecret,
    SignatureInvalid,
    SignatureExpired,
    MissingUpstreamUrl,
    MissingUpstreamMethod,
    InvalidUpstreamMethod(String),
    UpstreamNotAllowed(String),
    RedirectNotAllowed,
    UpstreamTimeout,
    UpstreamError(String),
    StorageError(String),
    StreamNotFound,
    StreamClosed,
    MalformedStreamUrl,
    RenewalRejected,
    InvalidAction(String),
    Internal(String),
}

impl ProxyError {
    pub fn response_parts(&self) -> (StatusCode, &'static str) {
        use ProxyError::*;
        match self {
            MissingSecret => (StatusCode::UNAUTHORIZED, "MISSING_SECRET"),
            InvalidSecret => (StatusCode::UNAUTHORIZED, "INVALID_SECRET"),
            SignatureInvalid => (StatusCode::FORBIDDEN, "SIGNATURE_INVALID"),
            SignatureExpired => (StatusCode::FORBIDDEN, "SIGNATURE_EXPIRED"),
            MissingUpstreamUrl => (StatusCode::BAD_REQUEST, "MISSING_UPSTREAM_URL"),
            MissingUpstreamMethod => (StatusCode::BAD_REQUEST, "MISSING_UPSTREAM_METHOD"),
            InvalidUpstreamMethod(_) => (StatusCode::BAD_REQUEST, "INVALID_UPSTREAM_METHOD"),
            UpstreamNotAllowed(_) => (StatusCode::FORBIDDEN, "UPSTREAM_NOT_ALLOWED"),
            RedirectNotAllowed => (StatusCode::BAD_REQUEST, "REDIRECT_NOT_ALLOWED"),
            UpstreamTimeout => (StatusCode::GATEWAY_TIMEOUT, "UPSTREAM_TIMEOUT"),
            UpstreamError(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
            StorageError(_) => (StatusCode::BAD_GATEWAY, "STORAGE_ERROR"),
            StreamNotFound => (StatusCode::NOT_FOUND, "STREAM_NOT_FOUND"),
            StreamClosed => (StatusCode::CONFLICT, "STREAM_CLOSED"),
            MalformedStreamUrl => (StatusCode::BAD_REQUEST, "MALFORMED_STREAM_URL"),
            RenewalRejected => (StatusCode::FORBIDDEN, "RENEWAL_REJECTED"),
            InvalidAction(_) => (StatusCode::BAD_REQUEST, "INVALID_ACTION"),
            Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    /// `{"error":{"code":"...","message":"..."}}`
    pub fn body_json(&self) -> String {
        let (_, code) = self.response_parts();
        serde_json::json!({ "error": { "code": code, "message": self.to_string() } }).to_string()
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::MissingSecret => write!(f, "missing service secret"),
            ProxyError::InvalidSecret => write!(f, "invalid service secret"),
            ProxyError::SignatureInvalid => write!(f, "signed url signature invalid"),
            ProxyError::SignatureExpired => write!(f, "signed url expired"),
            ProxyError::MissingUpstreamUrl => write!(f, "Upstream-URL header is required"),
            ProxyError::MissingUpstreamMethod => write!(f, "Upstream-Method header is required"),
            ProxyError::InvalidUpstreamMethod(m) => write!(f, "invalid upstream method: {}", m),
            ProxyError::UpstreamNotAllowed(url) => write!(f, "upstream url not allowed: {}", url),
            ProxyError::RedirectNotAllowed => write!(f, "upstream redirect not allowed"),
            ProxyError::UpstreamTimeout => write!(f, "timed out waiting for upstream"),
            ProxyError::UpstreamError(msg) => write!(f, "upstream error: {}", msg),
            ProxyError::StorageError(msg) => write!(f, "storage error: {}", msg),
            ProxyError::StreamNotFound => write!(f, "stream not found"),
            ProxyError::StreamClosed => write!(f, "stream is closed"),
            ProxyError::MalformedStreamUrl => write!(f, "malformed stream url"),
            ProxyError::RenewalRejected => write!(f, "renewal rejected by upstream"),
            ProxyError::InvalidAction(a) => write!(f, "invalid action: {}", a),
            ProxyError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}
