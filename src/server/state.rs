use crate::allowlist::Allowlist;
use crate::config::ProxyConfig;
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::store::StoreClient;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Shared proxy state, cheaply cloneable. Composed of the sub-pieces each
/// handler needs: static config behind a lock-free `ArcSwap`, the metrics
/// handle, the compiled allowlist, the store client, and the connection
/// registry (live pipes, response-id allocator, content-type cache).
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<ArcSwap<ProxyConfig>>,
    pub metrics: Metrics,
    pub allowlist: Arc<Allowlist>,
    pub store: StoreClient,
    pub registry: Arc<Registry>,
    pub upstream_client: reqwest::Client,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let allowlist = Allowlist::compile(&config.allowlist)
            .map_err(|e| anyhow::anyhow!("invalid allowlist: {}", e))?;
        let store = StoreClient::new(config.store_url.clone());

        // Redirects are rejected by construction (§4.D step 2), not merely
        // by inspecting the response status.
        let upstream_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let metrics = Metrics::install();

        Ok(Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics,
            allowlist: Arc::new(allowlist),
            store,
            registry: Arc::new(Registry::new()),
            upstream_client,
        })
    }
}
