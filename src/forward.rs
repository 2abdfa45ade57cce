//! Forward Module
//!
//! The pass-through fallback: dial the connection's original destination,
//! replay the request bytes already read from the client, then splice the two
//! streams until either side closes. Used for every request the adapters
//! decline and for any anomaly inside the caching engine.

use crate::{ProxyError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error};

/// TCP connect timeout towards the original destination
pub const ORIGIN_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Canned client responses for terminal failures
pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
pub const SERVICE_UNAVAILABLE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\r\n";

/// Dial the original destination with the connect timeout applied
pub async fn dial_origin(target: SocketAddr) -> Result<TcpStream> {
    match tokio::time::timeout(ORIGIN_DIAL_TIMEOUT, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::DialOrigin(format!("{}: {}", target, e))),
        Err(_) => Err(ProxyError::DialOrigin(format!(
            "{}: connect timed out",
            target
        ))),
    }
}

/// Dial the target, replay `initial` (the request bytes already consumed from
/// the client socket), then splice bidirectionally.
///
/// Returns `(tx_bytes, rx_bytes)` where tx is client→origin (excluding the
/// replayed bytes) and rx is origin→client. A dial failure is returned to the
/// caller, which owns the 503 fallback.
pub async fn forward_connection<S>(
    client: S,
    target: SocketAddr,
    initial: &[u8],
) -> Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut origin = dial_origin(target).await?;
    if !initial.is_empty() {
        origin.write_all(initial).await?;
    }

    debug!("Forwarding connection to {}", target);
    splice(client, origin, target).await
}

/// Copy both directions until each side closes, with graceful half-close
async fn splice<S>(client: S, origin: TcpStream, target: SocketAddr) -> Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut origin_read, mut origin_write) = origin.into_split();

    let client_to_origin = async {
        let mut buffer = [0u8; 8192];
        let mut total_bytes = 0u64;

        loop {
            match client_read.read(&mut buffer).await {
                Ok(0) => {
                    debug!(
                        "Client closed connection towards {} (sent {} bytes)",
                        target, total_bytes
                    );
                    let _ = origin_write.shutdown().await;
                    break;
                }
                Ok(n) => match origin_write.write_all(&buffer[..n]).await {
                    Ok(()) => total_bytes += n as u64,
                    Err(e) => {
                        if e.kind() == std::io::ErrorKind::ConnectionReset
                            || e.kind() == std::io::ErrorKind::BrokenPipe
                        {
                            debug!("Origin {} closed while writing: {}", target, e);
                        } else {
                            error!("Failed to write to origin {}: {}", target, e);
                        }
                        break;
                    }
                },
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::ConnectionReset {
                        debug!("Client reset connection towards {}: {}", target, e);
                    } else {
                        error!("Failed to read from client for {}: {}", target, e);
                    }
                    break;
                }
            }
        }

        total_bytes
    };

    let origin_to_client = async {
        let mut buffer = [0u8; 8192];
        let mut total_bytes = 0u64;

        loop {
            match origin_read.read(&mut buffer).await {
                Ok(0) => {
                    debug!(
                        "Origin {} closed connection (sent {} bytes)",
                        target, total_bytes
                    );
                    let _ = client_write.shutdown().await;
                    break;
                }
                Ok(n) => match client_write.write_all(&buffer[..n]).await {
                    Ok(()) => total_bytes += n as u64,
                    Err(e) => {
                        if e.kind() == std::io::ErrorKind::ConnectionReset
                            || e.kind() == std::io::ErrorKind::BrokenPipe
                        {
                            debug!("Client closed while writing from {}: {}", target, e);
                        } else {
                            error!("Failed to write to client from {}: {}", target, e);
                        }
                        break;
                    }
                },
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::ConnectionReset {
                        debug!("Origin {} reset connection: {}", target, e);
                    } else {
                        error!("Failed to read from origin {}: {}", target, e);
                    }
                    break;
                }
            }
        }

        total_bytes
    };

    let (tx_bytes, rx_bytes) = tokio::join!(client_to_origin, origin_to_client);

    debug!(
        "Forwarding to {} completed: tx={}, rx={}",
        target,
        format_bytes(tx_bytes),
        format_bytes(rx_bytes)
    );

    Ok((tx_bytes, rx_bytes))
}

/// Format bytes in human-readable form for logs
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}
