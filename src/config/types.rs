use serde::{Deserialize, Serialize};

/// Top-level proxy configuration (§6.5). Every field has a built-in default
/// so the process can start with zero configuration for local development;
/// environment variables override whichever fields plausibly vary per
/// deployment (see `apply_env_overrides`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Base URL of the append-only stream store, e.g. `http://127.0.0.1:9000`.
    #[serde(default = "default_store_url")]
    pub store_url: String,

    /// Glob patterns restricting which upstream URLs may be proxied.
    /// An empty allowlist denies everything.
    #[serde(default)]
    pub allowlist: Vec<String>,

    /// Shared secret used to mint capabilities and to authenticate
    /// write-side operations. Empty means the service is unconfigured and
    /// every secret-gated request is rejected.
    #[serde(default)]
    pub secret: String,

    #[serde(default = "default_stream_ttl_seconds")]
    pub stream_ttl_seconds: u64,

    #[serde(default = "default_url_ttl_seconds")]
    pub url_ttl_seconds: u64,

    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: u64,

    #[serde(default = "default_batch_size_bytes")]
    pub batch_size_bytes: usize,

    #[serde(default = "default_batch_time_ms")]
    pub batch_time_ms: u64,

    #[serde(default = "default_inactivity_ms")]
    pub inactivity_ms: u64,

    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            store_url: default_store_url(),
            allowlist: Vec::new(),
            secret: String::new(),
            stream_ttl_seconds: default_stream_ttl_seconds(),
            url_ttl_seconds: default_url_ttl_seconds(),
            max_response_bytes: default_max_response_bytes(),
            batch_size_bytes: default_batch_size_bytes(),
            batch_time_ms: default_batch_time_ms(),
            inactivity_ms: default_inactivity_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_store_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_stream_ttl_seconds() -> u64 {
    86_400
}

fn default_url_ttl_seconds() -> u64 {
    604_800
}

fn default_max_response_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_batch_size_bytes() -> usize {
    4096
}

fn default_batch_time_ms() -> u64 {
    50
}

fn default_inactivity_ms() -> u64 {
    600_000
}

fn default_startup_timeout_ms() -> u64 {
    60_000
}
