//! Thin typed façade over the append-only stream store's HTTP contract:
//! `PUT`/`HEAD`/`POST`/`GET`/`DELETE` on `/v1/streams/{id}`.

use crate::error::ProxyError;
use bytes::Bytes;
use futures_util::Stream;
use reqwest::StatusCode;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct StreamMetadata {
    pub next_offset: String,
    pub total_size: Option<u64>,
    pub closed: bool,
    pub expires_at: Option<i64>,
}

#[derive(Clone)]
pub struct StoreClient {
    http: reqwest::Client,
    base_url: String,
}

impl StoreClient {
    pub fn new(base_url: String) -> StoreClient {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("store http client must build");
        StoreClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, stream_id: &str) -> String {
        format!("{}/v1/streams/{}", self.base_url, stream_id)
    }

    pub async fn create(&self, stream_id: &str, ttl_seconds: u64, content_type: Option<&str>) -> Result<(), ProxyError> {
        let mut req = self
            .http
            .put(self.url(stream_id))
            .header("Stream-TTL", ttl_seconds.to_string());
        if let Some(ct) = content_type {
            req = req.header("Content-Type", ct);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ProxyError::StorageError(e.to_string()))?;
        record_result("create", expect_success(resp, "create").await)
    }

    pub async fn append(&self, stream_id: &str, body: Bytes) -> Result<(), ProxyError> {
        let resp = self
            .http
            .post(self.url(stream_id))
            .body(body)
            .send()
            .await
            .map_err(|e| ProxyError::StorageError(e.to_string()))?;
        record_result("append", expect_success(resp, "append").await)
    }

    pub async fn head(&self, stream_id: &str) -> Result<StreamMetadata, ProxyError> {
        let resp = self
            .http
            .head(self.url(stream_id))
            .send()
            .await
            .map_err(|e| ProxyError::StorageError(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            metrics::counter!("proxy_store_requests_total", "op" => "head", "result" => "not_found").increment(1);
            return Err(ProxyError::StreamNotFound);
        }
        if !resp.status().is_success() {
            metrics::counter!("proxy_store_requests_total", "op" => "head", "result" => "error").increment(1);
            return Err(ProxyError::StorageError(format!("head returned {}", resp.status())));
        }
        metrics::counter!("proxy_store_requests_total", "op" => "head", "result" => "ok").increment(1);

        let header = |name: &str| -> Option<String> {
            resp.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
        };

        Ok(StreamMetadata {
            next_offset: header("Stream-Next-Offset").unwrap_or_default(),
            total_size: header("Stream-Total-Size").and_then(|v| v.parse().ok()),
            closed: header("Stream-Closed").map(|v| v == "true").unwrap_or(false),
            expires_at: header("Stream-Expires-At").and_then(|v| v.parse().ok()),
        })
    }

    /// Read from `offset` (`-1` start, `now` tail, or an opaque offset token
    /// returned by a previous read). Returns the response's
    /// `Stream-Next-Offset`/`Stream-Closed` headers (available as soon as
    /// the store responds) and the body as a chunk stream — the proxy is a
    /// transparent forwarder for GET (§5), so a `&live=long-poll|sse` read
    /// is relayed as the store produces it rather than buffered in full.
    pub async fn read(
        &self,
        stream_id: &str,
        offset: &str,
        live: Option<&str>,
    ) -> Result<(impl Stream<Item = Result<Bytes, reqwest::Error>>, StreamMetadata), ProxyError> {
        let mut req = self.http.get(self.url(stream_id)).query(&[("offset", offset)]);
        if let Some(live) = live {
            req = req.query(&[("live", live)]);
        }
        let resp = req.send().await.map_err(|e| ProxyError::StorageError(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            metrics::counter!("proxy_store_requests_total", "op" => "read", "result" => "not_found").increment(1);
            return Err(ProxyError::StreamNotFound);
        }
        if !resp.status().is_success() {
            metrics::counter!("proxy_store_requests_total", "op" => "read", "result" => "error").increment(1);
            return Err(ProxyError::StorageError(format!("read returned {}", resp.status())));
        }
        metrics::counter!("proxy_store_requests_total", "op" => "read", "result" => "ok").increment(1);

        let meta = StreamMetadata {
            next_offset: resp
                .headers()
                .get("Stream-Next-Offset")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            total_size: None,
            closed: resp
                .headers()
                .get("Stream-Closed")
                .map(|v| v == "true")
                .unwrap_or(false),
            expires_at: None,
        };

        Ok((resp.bytes_stream(), meta))
    }

    /// Idempotent: a 404 from the store is treated as success.
    pub async fn delete(&self, stream_id: &str) -> Result<(), ProxyError> {
        let resp = self
            .http
            .delete(self.url(stream_id))
            .send()
            .await
            .map_err(|e| ProxyError::StorageError(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND || resp.status().is_success() {
            metrics::counter!("proxy_store_requests_total", "op" => "delete", "result" => "ok").increment(1);
            return Ok(());
        }
        metrics::counter!("proxy_store_requests_total", "op" => "delete", "result" => "error").increment(1);
        Err(ProxyError::StorageError(format!("delete returned {}", resp.status())))
    }
}

async fn expect_success(resp: reqwest::Response, op: &'static str) -> Result<(), ProxyError> {
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(ProxyError::StorageError(format!(
            "{} returned {}",
            op,
            resp.status()
        )))
    }
}

fn record_result(op: &'static str, result: Result<(), ProxyError>) -> Result<(), ProxyError> {
    let outcome = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!("proxy_store_requests_total", "op" => op, "result" => outcome).increment(1);
    result
}
