//! Caching Engine Module
//!
//! Per-connection request handling: parse one HTTP/1.1 request from the
//! client socket, classify it through the adapter chain, serve cache hits
//! locally, run single-flight origin fetches on misses (streaming to the
//! client while the cache fills), and fall back to raw forwarding on any
//! anomaly. A connection that enters the forward path never re-enters cache
//! logic.

use crate::adapter::{classify, AdapterDecision, ObjectStoreAdapter};
use crate::forward::{self, BAD_REQUEST, SERVICE_UNAVAILABLE};
use crate::object_cache::{FetchRole, FlightGuard, ObjectCache, StoredRecord};
use crate::{ProxyError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Upper bound on the bytes a request or response head may occupy
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Header table size handed to the parser
const MAX_HEADERS: usize = 64;

/// Connections slower than this are logged as suspicious, not failed
const SLOW_CONNECTION: Duration = Duration::from_secs(1);

/// Parsed request line and headers; the raw bytes are kept separately for
/// byte-exact forwarding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub host: String,
    pub headers: Vec<(String, String)>,
}

/// Parsed origin response head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Bytes the head occupies in the buffer it was parsed from
    pub head_len: usize,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

/// Parse a request head out of `buffer`.
///
/// Returns `Ok(None)` while the head is still incomplete.
pub fn parse_request_head(buffer: &[u8]) -> Result<Option<RequestHead>> {
    let mut headers_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers_storage);

    match request.parse(buffer) {
        Ok(httparse::Status::Complete(_)) => {
            let method = request.method.unwrap_or_default().to_string();
            let target = request.path.unwrap_or("/");
            let (path, query) = match target.split_once('?') {
                Some((p, q)) => (p.to_string(), Some(q.to_string())),
                None => (target.to_string(), None),
            };
            let headers: Vec<(String, String)> = request
                .headers
                .iter()
                .filter(|h| !h.name.is_empty())
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).to_string(),
                    )
                })
                .collect();
            let host = headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("host"))
                .map(|(_, value)| value.clone())
                .unwrap_or_default();

            Ok(Some(RequestHead {
                method,
                path,
                query,
                host,
                headers,
            }))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ProxyError::ParseRequest(e.to_string())),
    }
}

/// Parse a response head out of `buffer`; `Ok(None)` while incomplete
pub fn parse_response_head(buffer: &[u8]) -> Result<Option<ResponseHead>> {
    let mut headers_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers_storage);

    match response.parse(buffer) {
        Ok(httparse::Status::Complete(head_len)) => {
            let status = response.code.unwrap_or(0);
            let headers: Vec<(String, String)> = response
                .headers
                .iter()
                .filter(|h| !h.name.is_empty())
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).to_string(),
                    )
                })
                .collect();
            let content_length = headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<u64>().ok());
            let chunked = headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("transfer-encoding"))
                .map(|(_, value)| value.to_ascii_lowercase().contains("chunked"))
                .unwrap_or(false);

            Ok(Some(ResponseHead {
                status,
                headers,
                head_len,
                content_length,
                chunked,
            }))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ProxyError::ParseRequest(e.to_string())),
    }
}

/// Read from `stream` into `buffer` until a complete request head is present
async fn read_request_head<S>(stream: &mut S, buffer: &mut Vec<u8>) -> Result<RequestHead>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        if let Some(head) = parse_request_head(buffer)? {
            return Ok(head);
        }
        if buffer.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::ParseRequest("request head too large".to_string()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::ParseRequest(
                "connection closed before a complete request".to_string(),
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

/// How an origin fetch ended
enum FetchOutcome {
    /// 200 response fully read; the client has every byte and the record is
    /// ready for insertion
    Cached(StoredRecord),
    /// Response relayed verbatim to the client but not cacheable
    /// (non-200 status, chunked encoding, or oversized body)
    Relayed(String),
    /// Failed before anything reached the client; forwarding is still safe
    Unsent(ProxyError),
    /// Failed after bytes reached the client; the connection must close
    Broken(ProxyError),
}

/// Response headers that must not be replayed from the cache; the synthesized
/// response carries its own framing
fn capture_headers(head: &ResponseHead) -> Vec<(String, String)> {
    head.headers
        .iter()
        .filter(|(name, _)| {
            !name.eq_ignore_ascii_case("content-length")
                && !name.eq_ignore_ascii_case("transfer-encoding")
                && !name.eq_ignore_ascii_case("connection")
        })
        .cloned()
        .collect()
}

/// The caching engine shared by all workers
pub struct CachingEngine {
    cache: Arc<ObjectCache>,
    adapters: Vec<ObjectStoreAdapter>,
}

impl CachingEngine {
    pub fn new(cache: Arc<ObjectCache>, adapters: Vec<ObjectStoreAdapter>) -> Self {
        Self { cache, adapters }
    }

    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    /// Drive one client connection to completion
    pub async fn handle<S>(&self, client: S, target: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let result = self.handle_inner(client, target).await;

        let elapsed = started.elapsed();
        if elapsed > SLOW_CONNECTION {
            warn!(
                "Slow connection towards {}: took {:.2}s",
                target,
                elapsed.as_secs_f64()
            );
        }
        result
    }

    async fn handle_inner<S>(&self, mut client: S, target: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut raw = Vec::with_capacity(8192);
        let head = match read_request_head(&mut client, &mut raw).await {
            Ok(head) => head,
            Err(e) => {
                if matches!(e, ProxyError::ParseRequest(_)) {
                    let _ = client.write_all(BAD_REQUEST).await;
                    let _ = client.shutdown().await;
                }
                return Err(e);
            }
        };

        match classify(&self.adapters, &head) {
            AdapterDecision::PassThrough => {
                debug!("{} {} not intercepted, forwarding", head.method, head.path);
                self.forward(&mut client, target, &raw).await
            }
            AdapterDecision::Intercept {
                adapter_index,
                fingerprint,
            } => {
                self.intercept(client, target, raw, adapter_index, fingerprint)
                    .await
            }
        }
    }

    /// Cache hit / single-flight miss loop for an intercepted request
    async fn intercept<S>(
        &self,
        mut client: S,
        target: SocketAddr,
        raw: Vec<u8>,
        adapter_index: usize,
        fingerprint: String,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let adapter = &self.adapters[adapter_index];

        loop {
            if let Some(record) = self.cache.get(&fingerprint) {
                let response = adapter.synthesize_response(&record);
                match client.write_all(&response).await {
                    Ok(()) => {
                        debug!(
                            "Served {} from cache ({})",
                            fingerprint,
                            forward::format_bytes(record.body.len() as u64)
                        );
                        let _ = client.shutdown().await;
                        return Ok(());
                    }
                    Err(e) => {
                        debug!(
                            "Local response write failed for {}, forwarding: {}",
                            fingerprint, e
                        );
                        return self.forward(&mut client, target, &raw).await;
                    }
                }
            }

            match self.cache.begin_flight(&fingerprint) {
                FetchRole::Fetcher(guard) => {
                    // The record may have landed between the miss and the
                    // registration; serve it as a hit
                    if self.cache.contains(&fingerprint) {
                        guard.complete_success();
                        continue;
                    }
                    return self
                        .fetch_and_serve(client, target, &raw, &fingerprint, guard)
                        .await;
                }
                FetchRole::Waiter(mut rx) => match rx.recv().await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => {
                        debug!("Origin fetch for {} failed ({}), forwarding", fingerprint, e);
                        return self.forward(&mut client, target, &raw).await;
                    }
                    Err(_) => {
                        debug!("Fetcher for {} vanished, retrying", fingerprint);
                        continue;
                    }
                },
            }
        }
    }

    /// Run the origin fetch as the flight's fetcher and settle the guard
    async fn fetch_and_serve<S>(
        &self,
        mut client: S,
        target: SocketAddr,
        raw: &[u8],
        fingerprint: &str,
        guard: FlightGuard,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.fetch_origin(&mut client, target, raw).await {
            FetchOutcome::Cached(record) => {
                match self.cache.put(fingerprint, &record) {
                    Ok(()) => guard.complete_success(),
                    Err(e) => {
                        warn!("Cache insert for {} failed: {}", fingerprint, e);
                        guard.complete_error(e.to_string());
                    }
                }
                let _ = client.shutdown().await;
                Ok(())
            }
            FetchOutcome::Relayed(reason) => {
                debug!("Relayed {} without caching: {}", fingerprint, reason);
                guard.complete_error(reason);
                let _ = client.shutdown().await;
                Ok(())
            }
            FetchOutcome::Unsent(e) => {
                guard.complete_error(e.to_string());
                debug!("Origin fetch for {} failed ({}), forwarding", fingerprint, e);
                self.forward(&mut client, target, raw).await
            }
            FetchOutcome::Broken(e) => {
                // Bytes already sent cannot be retracted; insertion skipped
                guard.complete_error(e.to_string());
                Err(e)
            }
        }
    }

    /// Fetch one response from the origin, streaming it to the client as it
    /// arrives (tee) while accumulating the body for the cache
    async fn fetch_origin<S>(
        &self,
        client: &mut S,
        target: SocketAddr,
        raw: &[u8],
    ) -> FetchOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut origin = match forward::dial_origin(target).await {
            Ok(origin) => origin,
            Err(e) => return FetchOutcome::Unsent(e),
        };
        if let Err(e) = origin.write_all(raw).await {
            return FetchOutcome::Unsent(e.into());
        }

        // Incremental response-head read
        let mut response_buf: Vec<u8> = Vec::with_capacity(8192);
        let mut chunk = [0u8; 8192];
        let head = loop {
            match parse_response_head(&response_buf) {
                Ok(Some(head)) => break head,
                Ok(None) => {}
                Err(e) => return FetchOutcome::Unsent(e),
            }
            if response_buf.len() > MAX_HEAD_BYTES {
                return FetchOutcome::Unsent(ProxyError::ParseRequest(
                    "origin response head too large".to_string(),
                ));
            }
            match origin.read(&mut chunk).await {
                Ok(0) => {
                    return FetchOutcome::Unsent(ProxyError::Io(
                        "origin closed before a complete response".to_string(),
                    ))
                }
                Ok(n) => response_buf.extend_from_slice(&chunk[..n]),
                Err(e) => return FetchOutcome::Unsent(e.into()),
            }
        };

        let initial_body_len = (response_buf.len() - head.head_len) as u64;
        let oversized = head
            .content_length
            .map(|len| len + 256 > self.cache.max_entry_size())
            .unwrap_or(false);

        // Everything read so far goes to the client in one write, head
        // included
        if let Err(e) = client.write_all(&response_buf).await {
            if head.status != 200 || head.chunked || oversized {
                return FetchOutcome::Broken(e.into());
            }
            // A dead client does not stop the fetch: waiters still profit
            debug!("Client write failed mid-fetch, caching for waiters: {}", e);
            return self
                .drain_body_for_cache(origin, head, response_buf)
                .await;
        }

        if head.status != 200 || head.chunked || oversized {
            let reason = if head.status != 200 {
                format!("origin returned status {}", head.status)
            } else if head.chunked {
                "origin response is chunked".to_string()
            } else {
                "origin response exceeds the entry size limit".to_string()
            };
            let remaining = head
                .content_length
                .map(|len| len.saturating_sub(initial_body_len));
            return match relay_remaining(&mut origin, client, remaining).await {
                Ok(()) => FetchOutcome::Relayed(reason),
                Err(e) => FetchOutcome::Broken(e),
            };
        }

        // Cacheable: tee the body to the client while accumulating it
        let mut body = Vec::with_capacity(head.content_length.unwrap_or(8192) as usize);
        body.extend_from_slice(&response_buf[head.head_len..]);
        let mut client_ok = true;

        loop {
            if let Some(expected) = head.content_length {
                if (body.len() as u64) >= expected {
                    break;
                }
            }
            match origin.read(&mut chunk).await {
                Ok(0) => {
                    if let Some(expected) = head.content_length {
                        if (body.len() as u64) < expected {
                            return FetchOutcome::Broken(ProxyError::Io(format!(
                                "origin body truncated at {} of {} bytes",
                                body.len(),
                                expected
                            )));
                        }
                    }
                    break;
                }
                Ok(n) => {
                    body.extend_from_slice(&chunk[..n]);
                    if body.len() as u64 + 256 > self.cache.max_entry_size() {
                        // Too big to cache after all; keep streaming
                        if !client_ok {
                            return FetchOutcome::Broken(ProxyError::Io(
                                "client gone and response uncacheable".to_string(),
                            ));
                        }
                        if let Err(e) = client.write_all(&chunk[..n]).await {
                            return FetchOutcome::Broken(e.into());
                        }
                        let remaining = head
                            .content_length
                            .map(|len| len.saturating_sub(body.len() as u64));
                        return match relay_remaining(&mut origin, client, remaining).await {
                            Ok(()) => FetchOutcome::Relayed(
                                "origin response exceeds the entry size limit".to_string(),
                            ),
                            Err(e) => FetchOutcome::Broken(e),
                        };
                    }
                    if client_ok {
                        if let Err(e) = client.write_all(&chunk[..n]).await {
                            debug!(
                                "Client write failed mid-fetch, caching for waiters: {}",
                                e
                            );
                            client_ok = false;
                        }
                    }
                }
                Err(e) => return FetchOutcome::Broken(e.into()),
            }
        }

        FetchOutcome::Cached(StoredRecord {
            headers: capture_headers(&head),
            body,
        })
    }

    /// Finish reading a 200 body for the cache after the client went away
    async fn drain_body_for_cache(
        &self,
        mut origin: tokio::net::TcpStream,
        head: ResponseHead,
        response_buf: Vec<u8>,
    ) -> FetchOutcome {
        let mut body = Vec::with_capacity(head.content_length.unwrap_or(8192) as usize);
        body.extend_from_slice(&response_buf[head.head_len..]);
        let mut chunk = [0u8; 8192];

        loop {
            if let Some(expected) = head.content_length {
                if (body.len() as u64) >= expected {
                    break;
                }
            }
            if body.len() as u64 + 256 > self.cache.max_entry_size() {
                return FetchOutcome::Broken(ProxyError::Io(
                    "client gone and response uncacheable".to_string(),
                ));
            }
            match origin.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => body.extend_from_slice(&chunk[..n]),
                Err(e) => return FetchOutcome::Broken(e.into()),
            }
        }

        if body.is_empty() {
            return FetchOutcome::Broken(ProxyError::Io(
                "client gone before any body arrived".to_string(),
            ));
        }
        FetchOutcome::Cached(StoredRecord {
            headers: capture_headers(&head),
            body,
        })
    }

    /// Forward with 503 fallback when the origin cannot be dialed
    async fn forward<S>(&self, client: &mut S, target: SocketAddr, raw: &[u8]) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match forward::forward_connection(&mut *client, target, raw).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if matches!(e, ProxyError::DialOrigin(_)) {
                    let _ = client.write_all(SERVICE_UNAVAILABLE).await;
                    let _ = client.shutdown().await;
                }
                Err(e)
            }
        }
    }
}

/// Stream up to `remaining` bytes (or everything until EOF when `None`) from
/// the origin to the client
async fn relay_remaining<S>(
    origin: &mut tokio::net::TcpStream,
    client: &mut S,
    mut remaining: Option<u64>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if remaining == Some(0) {
        return Ok(());
    }
    let mut chunk = [0u8; 8192];
    loop {
        let n = origin.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        client.write_all(&chunk[..n]).await?;
        if let Some(left) = remaining {
            let left = left.saturating_sub(n as u64);
            if left == 0 {
                return Ok(());
            }
            remaining = Some(left);
        }
    }
}
