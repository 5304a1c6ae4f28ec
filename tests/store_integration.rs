//! Integration test for `StoreClient` against a real (in-process) HTTP
//! server standing in for the append-only stream store, instead of the
//! docker-based fixtures the gateway's discovery tests use — there is no
//! external service to containerize here, just an HTTP contract.

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use streamproxy::store::StoreClient;
use tokio::net::TcpListener;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

#[derive(Default)]
struct FakeStore {
    streams: Mutex<HashMap<String, Vec<u8>>>,
}

async fn handle(
    req: Request<Incoming>,
    store: Arc<FakeStore>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let Some(stream_id) = path.strip_prefix("/v1/streams/").map(str::to_string) else {
        return Ok(Response::builder().status(404).body(full(Bytes::new())).unwrap());
    };

    match *req.method() {
        Method::PUT => {
            store.streams.lock().unwrap().insert(stream_id, Vec::new());
            Ok(Response::builder().status(StatusCode::CREATED).body(full(Bytes::new())).unwrap())
        }
        Method::POST => {
            let body = req.into_body().collect().await?.to_bytes();
            let mut streams = store.streams.lock().unwrap();
            match streams.get_mut(&stream_id) {
                Some(buf) => {
                    buf.extend_from_slice(&body);
                    Ok(Response::builder().status(StatusCode::OK).body(full(Bytes::new())).unwrap())
                }
                None => Ok(Response::builder().status(404).body(full(Bytes::new())).unwrap()),
            }
        }
        Method::HEAD => {
            let streams = store.streams.lock().unwrap();
            match streams.get(&stream_id) {
                Some(buf) => Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("stream-next-offset", buf.len().to_string())
                    .header("stream-total-size", buf.len().to_string())
                    .header("stream-closed", "false")
                    .body(full(Bytes::new()))
                    .unwrap()),
                None => Ok(Response::builder().status(404).body(full(Bytes::new())).unwrap()),
            }
        }
        Method::GET => {
            let streams = store.streams.lock().unwrap();
            match streams.get(&stream_id) {
                Some(buf) => Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("stream-next-offset", buf.len().to_string())
                    .header("stream-closed", "false")
                    .body(full(Bytes::copy_from_slice(buf)))
                    .unwrap()),
                None => Ok(Response::builder().status(404).body(full(Bytes::new())).unwrap()),
            }
        }
        Method::DELETE => {
            store.streams.lock().unwrap().remove(&stream_id);
            Ok(Response::builder().status(StatusCode::NO_CONTENT).body(full(Bytes::new())).unwrap())
        }
        _ => Ok(Response::builder().status(405).body(full(Bytes::new())).unwrap()),
    }
}

async fn spawn_fake_store() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let store = Arc::new(FakeStore::default());

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => continue,
            };
            let store = store.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = hyper::service::service_fn(move |req| handle(req, store.clone()));
                let _ = auto::Builder::new(TokioExecutor::new())
                    .http1()
                    .serve_connection(io, svc)
                    .await;
            });
        }
    });

    format!("http://{}", addr)
}

#[tokio::test]
async fn test_store_client_full_lifecycle() {
    let base_url = spawn_fake_store().await;
    let client = StoreClient::new(base_url);

    client.create("s1", 3600, Some("text/plain")).await.expect("create");

    let meta = client.head("s1").await.expect("head");
    assert_eq!(meta.next_offset, "0");
    assert!(!meta.closed);

    client.append("s1", Bytes::from_static(b"hello ")).await.expect("append 1");
    client.append("s1", Bytes::from_static(b"world")).await.expect("append 2");

    let (stream, meta) = client.read("s1", "-1", None).await.expect("read");
    let body = stream
        .try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
        .expect("collect read stream");
    assert_eq!(&body[..], b"hello world");
    assert_eq!(meta.next_offset, "11");

    client.delete("s1").await.expect("delete");
    client.delete("s1").await.expect("delete is idempotent");
}

#[tokio::test]
async fn test_store_client_head_missing_stream_is_not_found() {
    let base_url = spawn_fake_store().await;
    let client = StoreClient::new(base_url);

    let err = client.head("does-not-exist").await.unwrap_err();
    assert!(matches!(err, streamproxy::error::ProxyError::StreamNotFound));
}
