//! In-memory, per-stream bookkeeping: live upstream connections (for
//! targeted abort and shutdown drain), the response-id allocator, and the
//! upstream content-type cache.
//!
//! Grounded in the same per-key `DashMap` + atomic-state idiom the teacher
//! uses for its circuit breaker and rate limiter registries — here applied
//! to per-stream connection tables instead of per-node health state.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// A single in-flight upstream pipe.
pub struct Connection {
    pub response_id: u32,
    pub cancel: CancellationToken,
    /// Set once the terminal frame has been written, so abort/shutdown can
    /// tell "already completed" from "newly aborted" idempotently.
    pub terminal_written: Arc<AtomicBool>,
}

#[derive(Default)]
struct StreamConnections {
    next_connection_id: AtomicU32,
    connections: DashMap<u32, Arc<Connection>>,
}

/// Per-stream response-id allocator. Bootstraps on first use by scanning the
/// stream's existing frames for the current maximum id, then advances the
/// counter under a per-stream async mutex so concurrent creates/reconnects
/// allocate unique, monotonically increasing ids.
struct ResponseIdAllocator {
    state: Mutex<Option<u32>>,
}

pub struct Registry {
    connections: DashMap<String, Arc<StreamConnections>>,
    response_ids: DashMap<String, Arc<ResponseIdAllocator>>,
    content_types: DashMap<String, String>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            connections: DashMap::new(),
            response_ids: DashMap::new(),
            content_types: DashMap::new(),
        }
    }

    /// Allocate the next response id for `stream_id`. `bootstrap` is invoked
    /// exactly once per stream, only if no id has been allocated yet in this
    /// process, to recover the current maximum from the store.
    pub async fn allocate_response_id<F, Fut>(&self, stream_id: &str, bootstrap: F) -> u32
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Option<u32>>,
    {
        let allocator = self
            .response_ids
            .entry(stream_id.to_string())
            .or_insert_with(|| Arc::new(ResponseIdAllocator { state: Mutex::new(None) }))
            .clone();

        let mut guard = allocator.state.lock().await;
        let next = match *guard {
            Some(current) => current + 1,
            None => bootstrap().await.map(|max| max + 1).unwrap_or(0),
        };
        *guard = Some(next);
        next
    }

    /// Register a new in-flight connection before its first frame is
    /// written. Returns a handle the pipe uses to mark itself terminal.
    pub fn register(&self, stream_id: &str, response_id: u32) -> (u32, Arc<Connection>) {
        let stream = self
            .connections
            .entry(stream_id.to_string())
            .or_insert_with(|| Arc::new(StreamConnections::default()))
            .clone();

        let connection_id = stream.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection {
            response_id,
            cancel: CancellationToken::new(),
            terminal_written: Arc::new(AtomicBool::new(false)),
        });
        stream.connections.insert(connection_id, connection.clone());
        metrics::gauge!("proxy_registry_connections").increment(1.0);
        (connection_id, connection)
    }

    /// Unregister a connection once its terminal frame has been written.
    pub fn unregister(&self, stream_id: &str, connection_id: u32) {
        if let Some(stream) = self.connections.get(stream_id) {
            if stream.connections.remove(&connection_id).is_some() {
                metrics::gauge!("proxy_registry_connections").decrement(1.0);
            }
        }
    }

    /// Trigger cancellation on every live connection for `stream_id`.
    /// Returns an outcome per the abort endpoint's idempotence contract.
    pub fn abort_stream(&self, stream_id: &str) -> AbortOutcome {
        let Some(stream) = self.connections.get(stream_id) else {
            return AbortOutcome::AlreadyCompleted;
        };
        if stream.connections.is_empty() {
            return AbortOutcome::AlreadyCompleted;
        }

        let mut any_newly_aborted = false;
        let mut all_already_cancelled = true;
        for entry in stream.connections.iter() {
            let conn = entry.value();
            if conn.terminal_written.load(Ordering::Acquire) {
                continue;
            }
            if conn.cancel.is_cancelled() {
                continue;
            }
            all_already_cancelled = false;
            conn.cancel.cancel();
            any_newly_aborted = true;
        }

        if any_newly_aborted {
            AbortOutcome::Aborted
        } else if all_already_cancelled {
            AbortOutcome::AlreadyAborted
        } else {
            AbortOutcome::AlreadyCompleted
        }
    }

    /// Cancel every registered connection, across every stream — used on
    /// graceful shutdown to stop in-flight upstream pipes promptly.
    pub fn cancel_all(&self) {
        for stream in self.connections.iter() {
            for entry in stream.value().connections.iter() {
                entry.value().cancel.cancel();
            }
        }
    }

    pub fn set_content_type(&self, stream_id: &str, content_type: String) {
        self.content_types.insert(stream_id.to_string(), content_type);
    }

    pub fn content_type(&self, stream_id: &str) -> Option<String> {
        self.content_types.get(stream_id).map(|v| v.clone())
    }

    /// Clear all cached state for a stream — called on delete and on
    /// create-failure so a retried create starts clean.
    pub fn forget(&self, stream_id: &str) {
        self.connections.remove(stream_id);
        self.response_ids.remove(stream_id);
        self.content_types.remove(stream_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    Aborted,
    AlreadyAborted,
    AlreadyCompleted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_response_id_bootstraps_once_then_increments() {
        let registry = Registry::new();
        let calls = std::sync::atomic::AtomicU32::new(0);

        let first = registry
            .allocate_response_id("s1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Some(4)
            })
            .await;
        assert_eq!(first, 5);

        let second = registry
            .allocate_response_id("s1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                None
            })
            .await;
        assert_eq!(second, 6);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "bootstrap runs only once");
    }

    #[tokio::test]
    async fn test_response_id_bootstraps_to_zero_on_empty_stream() {
        let registry = Registry::new();
        let first = registry.allocate_response_id("s1", || async { None }).await;
        assert_eq!(first, 0);
    }

    #[test]
    fn test_abort_idempotence() {
        let registry = Registry::new();
        assert_eq!(registry.abort_stream("missing"), AbortOutcome::AlreadyCompleted);

        let (conn_id, conn) = registry.register("s1", 0);
        assert_eq!(registry.abort_stream("s1"), AbortOutcome::Aborted);
        assert!(conn.cancel.is_cancelled());
        assert_eq!(registry.abort_stream("s1"), AbortOutcome::AlreadyAborted);

        conn.terminal_written.store(true, Ordering::Release);
        registry.unregister("s1", conn_id);
        assert_eq!(registry.abort_stream("s1"), AbortOutcome::AlreadyCompleted);
    }

    #[test]
    fn test_content_type_cleared_on_forget() {
        let registry = Registry::new();
        registry.set_content_type("s1", "text/event-stream".to_string());
        assert_eq!(registry.content_type("s1").as_deref(), Some("text/event-stream"));
        registry.forget("s1");
        assert_eq!(registry.content_type("s1"), None);
    }
}
