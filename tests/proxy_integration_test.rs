//! End-to-end tests driving the caching engine over real localhost TCP
//! origins: cache hits, miss-fetch-cache, single-flight coalescing,
//! pass-through forwarding, origin failures, and TTL expiry.

use objcache_proxy::adapter::{GenericAdapter, MinioAdapter, ObjectStoreAdapter};
use objcache_proxy::config::CacheConfig;
use objcache_proxy::engine::CachingEngine;
use objcache_proxy::object_cache::{ObjectCache, StoredRecord};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn test_cache_config() -> CacheConfig {
    CacheConfig {
        shards: 32,
        life_window: Duration::from_secs(600),
        clean_window: Duration::from_millis(50),
        hard_max_bytes: 32 * 64 * 1024,
        max_entry_size: 32 * 1024,
    }
}

fn generic_engine(config: &CacheConfig) -> Arc<CachingEngine> {
    let cache = Arc::new(ObjectCache::new(config));
    Arc::new(CachingEngine::new(
        cache,
        vec![ObjectStoreAdapter::Generic(GenericAdapter {
            host: String::new(),
        })],
    ))
}

fn minio_engine(config: &CacheConfig) -> Arc<CachingEngine> {
    let cache = Arc::new(ObjectCache::new(config));
    Arc::new(CachingEngine::new(
        cache,
        vec![ObjectStoreAdapter::Minio(MinioAdapter {
            host: String::new(),
        })],
    ))
}

/// Never reached on pure cache-hit paths
fn dead_target() -> SocketAddr {
    "127.0.0.1:1".parse().unwrap()
}

/// Origin that answers every request with a fixed response after an optional
/// delay, counting accepted connections
async fn spawn_origin(
    response: &'static [u8],
    delay: Option<Duration>,
) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&accepts);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buffer = [0u8; 8192];
                // One request head is enough; these origins close per request
                let _ = stream.read(&mut buffer).await;
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let _ = stream.write_all(response).await;
            });
        }
    });

    (addr, accepts)
}

/// Origin that records everything it receives until client EOF, then responds
async fn spawn_recording_origin(
    response: &'static [u8],
) -> (SocketAddr, Arc<tokio::sync::Mutex<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let recorded = Arc::new(tokio::sync::Mutex::new(Vec::new()));

    let sink = Arc::clone(&recorded);
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut received = Vec::new();
        let mut buffer = [0u8; 8192];
        loop {
            match stream.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buffer[..n]),
            }
        }
        *sink.lock().await = received;
        let _ = stream.write_all(response).await;
    });

    (addr, recorded)
}

/// Send one request through the engine and collect the full response
async fn send_through_engine(
    engine: Arc<CachingEngine>,
    target: SocketAddr,
    request: &[u8],
) -> Vec<u8> {
    let (client, proxy_side) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(async move {
        let _ = engine.handle(proxy_side, target).await;
    });

    let (mut read, mut write) = tokio::io::split(client);
    write.write_all(request).await.unwrap();
    write.shutdown().await.unwrap();

    let mut response = Vec::new();
    read.read_to_end(&mut response).await.unwrap();
    task.await.unwrap();
    response
}

const GET_BK: &[u8] = b"GET /b/k HTTP/1.1\r\nHost: h\r\n\r\n";

#[tokio::test]
async fn cache_hit_returns_exact_synthesized_bytes() {
    let engine = generic_engine(&test_cache_config());
    engine
        .cache()
        .put(
            "generic:h/b/k",
            &StoredRecord {
                headers: vec![(
                    "Content-Type".to_string(),
                    "application/octet-stream".to_string(),
                )],
                body: b"HELLO".to_vec(),
            },
        )
        .unwrap();

    let response = send_through_engine(engine, dead_target(), GET_BK).await;
    assert_eq!(
        response,
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: application/octet-stream\r\n\r\nHELLO"
    );
}

#[tokio::test]
async fn cache_miss_fetches_once_then_serves_locally() {
    let (origin, accepts) = spawn_origin(
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: text/plain\r\nETag: \"v1\"\r\n\r\nWORLD",
        None,
    )
    .await;
    let engine = generic_engine(&test_cache_config());

    // First request goes to the origin; the client sees its bytes verbatim
    let first = send_through_engine(Arc::clone(&engine), origin, GET_BK).await;
    let first_text = String::from_utf8(first).unwrap();
    assert!(first_text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(first_text.contains("ETag: \"v1\"\r\n"));
    assert!(first_text.ends_with("WORLD"));
    assert_eq!(accepts.load(Ordering::SeqCst), 1);

    // Second request is served from the cache without dialing the origin
    let second = send_through_engine(Arc::clone(&engine), origin, GET_BK).await;
    assert_eq!(
        second,
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: application/octet-stream\r\n\r\nWORLD"
    );
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
    assert!(engine.cache().get("generic:h/b/k").is_some());
}

#[tokio::test]
async fn minio_adapter_restores_captured_headers() {
    let (origin, accepts) = spawn_origin(
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: text/plain\r\nETag: \"v1\"\r\n\r\nWORLD",
        None,
    )
    .await;
    let engine = minio_engine(&test_cache_config());

    let _first = send_through_engine(Arc::clone(&engine), origin, GET_BK).await;
    let second = send_through_engine(Arc::clone(&engine), origin, GET_BK).await;

    // Captured origin headers come back verbatim; framing headers are
    // regenerated
    assert_eq!(
        second,
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: text/plain\r\nETag: \"v1\"\r\n\r\nWORLD"
    );
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_misses_collapse_to_one_origin_fetch() {
    let (origin, accepts) = spawn_origin(
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nWORLD",
        Some(Duration::from_millis(150)),
    )
    .await;
    let engine = generic_engine(&test_cache_config());

    let mut clients = Vec::new();
    for _ in 0..100 {
        let engine = Arc::clone(&engine);
        clients.push(tokio::spawn(async move {
            send_through_engine(engine, origin, GET_BK).await
        }));
    }

    for client in clients {
        let response = client.await.unwrap();
        assert!(response.ends_with(b"WORLD"), "every client gets the body");
    }
    assert_eq!(accepts.load(Ordering::SeqCst), 1, "origin saw one GET");
}

#[tokio::test]
async fn post_is_forwarded_byte_exact_without_caching() {
    let (origin, recorded) =
        spawn_recording_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK").await;
    let engine = generic_engine(&test_cache_config());

    let request = b"POST /b/k HTTP/1.1\r\nHost: h\r\nContent-Length: 7\r\n\r\npayload";
    let response = send_through_engine(Arc::clone(&engine), origin, request).await;

    assert!(String::from_utf8(response).unwrap().ends_with("OK"));
    assert_eq!(recorded.lock().await.as_slice(), request);
    assert_eq!(engine.cache().entry_count(), 0);
}

#[tokio::test]
async fn unreachable_origin_yields_503() {
    // Bind then drop to get a refusing port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let engine = generic_engine(&test_cache_config());
    let response = send_through_engine(engine, dead, GET_BK).await;
    assert_eq!(response, b"HTTP/1.1 503 Service Unavailable\r\n\r\n");
}

#[tokio::test]
async fn non_200_is_relayed_and_never_cached() {
    let (origin, accepts) = spawn_origin(
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNOT FOUND",
        None,
    )
    .await;
    let engine = generic_engine(&test_cache_config());

    let first = send_through_engine(Arc::clone(&engine), origin, GET_BK).await;
    assert!(String::from_utf8(first).unwrap().starts_with("HTTP/1.1 404"));
    assert_eq!(engine.cache().entry_count(), 0);

    // Still a miss: the next request dials the origin again
    let second = send_through_engine(Arc::clone(&engine), origin, GET_BK).await;
    assert!(String::from_utf8(second).unwrap().starts_with("HTTP/1.1 404"));
    assert_eq!(accepts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn expired_entry_is_swept_and_refetched() {
    let config = CacheConfig {
        life_window: Duration::from_millis(50),
        ..test_cache_config()
    };
    let engine = generic_engine(&config);
    engine
        .cache()
        .put(
            "generic:h/b/k",
            &StoredRecord {
                headers: Vec::new(),
                body: b"STALE".to_vec(),
            },
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.cache().sweep_expired(), 1);
    assert!(engine.cache().get("generic:h/b/k").is_none());

    // A fresh request repopulates from the origin
    let (origin, accepts) =
        spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nFRESH", None).await;
    let response = send_through_engine(Arc::clone(&engine), origin, GET_BK).await;
    assert!(response.ends_with(b"FRESH"));
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
    assert_eq!(
        engine.cache().get("generic:h/b/k").unwrap().body,
        b"FRESH".to_vec()
    );
}

#[tokio::test]
async fn oversized_origin_response_is_relayed_not_cached() {
    // 64 KiB body against a 32 KiB entry limit
    let body = vec![b'A'; 64 * 1024];
    let mut response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len())
        .into_bytes();
    response.extend_from_slice(&body);
    let response: &'static [u8] = Box::leak(response.into_boxed_slice());

    let (origin, _accepts) = spawn_origin(response, None).await;
    let engine = generic_engine(&test_cache_config());

    let received = send_through_engine(Arc::clone(&engine), origin, GET_BK).await;
    assert!(received.ends_with(&body[..]));
    assert_eq!(engine.cache().entry_count(), 0);
}
