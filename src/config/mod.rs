pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl ProxyConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — allowing the proxy to start with zero configuration for
    /// local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: ProxyConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            ProxyConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            "loaded proxy configuration, allowlist_len={}",
            config.allowlist.len()
        );
        Ok(config)
    }

    /// Apply environment variable overrides for fields that plausibly vary
    /// per deployment. Left deliberately small: this proxy has exactly one
    /// fixed route surface, so there is no business config to hot-reload.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PROXY_SECRET") {
            self.secret = v;
        }
        if let Ok(v) = std::env::var("PROXY_STORE_URL") {
            self.store_url = v;
        }
        if let Ok(v) = std::env::var("PROXY_ALLOWLIST") {
            self.allowlist = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("PROXY_HOST") {
            self.host = v;
        }
        if let Ok(v) = std::env::var("PROXY_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.port = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_url.is_empty() {
            anyhow::bail!("store_url must not be empty");
        }
        if self.secret.is_empty() {
            tracing::warn!("config: secret is empty, all secret-gated requests will be rejected");
        }
        for pattern in &self.allowlist {
            globset::GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| anyhow::anyhow!("invalid allowlist pattern {:?}: {}", pattern, e))?;
        }
        Ok(())
    }
}
