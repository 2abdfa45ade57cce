//! Connection Dispatcher Module
//!
//! Owns the proxy listener and the fixed worker pool. The acceptor recovers
//! each connection's original destination, then enqueues it on a bounded
//! queue; a full queue blocks the acceptor. Workers dequeue independently and
//! hand the connection to the caching engine (or raw-forward it in bypass
//! mode).

use crate::engine::CachingEngine;
use crate::config::ServerConfig;
use crate::forward;
use crate::original_dst;
use crate::shutdown::ShutdownSignal;
use crate::{ProxyError, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Recovers the pre-redirection target of an accepted connection
pub type TargetResolver = Box<dyn Fn(&TcpStream) -> Result<SocketAddr> + Send + Sync>;

/// One accepted connection, owned by a single worker until completion
pub struct WorkerTask {
    pub stream: TcpStream,
    pub target: SocketAddr,
    pub id: u64,
}

/// Listener plus bounded worker pool
pub struct Dispatcher {
    listener: TcpListener,
    engine: Arc<CachingEngine>,
    worker_count: usize,
    queue_capacity: usize,
    bypass_http_handler: bool,
    target_resolver: TargetResolver,
    active_connections: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Bind the proxy listener on localhost. Bind failures are fatal to
    /// startup.
    pub async fn bind(config: &ServerConfig, engine: Arc<CachingEngine>) -> Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), config.proxy_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::Io(format!("Failed to bind {}: {}", addr, e)))?;
        info!("Proxy listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            engine,
            worker_count: config.worker_count,
            queue_capacity: config.queue_capacity,
            bypass_http_handler: config.bypass_http_handler,
            target_resolver: Box::new(original_dst::original_destination),
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Replace the target recovery function (used by builds without the
    /// kernel hooks)
    pub fn set_target_resolver(&mut self, resolver: TargetResolver) {
        self.target_resolver = resolver;
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Accept until shutdown, then drain the queue and join the workers
    pub async fn run(self, mut shutdown_signal: ShutdownSignal) -> Result<()> {
        let (task_tx, task_rx) = mpsc::channel::<WorkerTask>(self.queue_capacity);
        let task_rx = Arc::new(Mutex::new(task_rx));

        let mut workers = Vec::with_capacity(self.worker_count);
        for worker_id in 0..self.worker_count {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&task_rx),
                Arc::clone(&self.engine),
                Arc::clone(&self.active_connections),
                self.bypass_http_handler,
            )));
        }
        debug!("Started {} proxy workers", self.worker_count);

        let mut next_id = 0u64;
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let active = self.active_connections.fetch_add(1, Ordering::SeqCst) + 1;
                            debug!(
                                "Accepted connection {} from {} ({} active)",
                                next_id, client_addr, active
                            );

                            let target = match (self.target_resolver)(&stream) {
                                Ok(target) => target,
                                Err(e) => {
                                    // No original destination means no response
                                    warn!("Dropping connection from {}: {}", client_addr, e);
                                    self.active_connections.fetch_sub(1, Ordering::SeqCst);
                                    continue;
                                }
                            };

                            let task = WorkerTask { stream, target, id: next_id };
                            next_id += 1;

                            // A full queue blocks here, back-pressuring accepts
                            if task_tx.send(task).await.is_err() {
                                self.active_connections.fetch_sub(1, Ordering::SeqCst);
                                error!("Worker queue closed, stopping acceptor");
                                break;
                            }
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("Dispatcher received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        // Closing the queue lets workers drain what is left and exit
        drop(task_tx);
        for worker in workers {
            let _ = worker.await;
        }
        info!("Dispatcher stopped");
        Ok(())
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<WorkerTask>>>,
    engine: Arc<CachingEngine>,
    active_connections: Arc<AtomicUsize>,
    bypass_http_handler: bool,
) {
    debug!("Worker {} started", worker_id);
    loop {
        // Hold the queue lock only while waiting; handling runs unlocked
        let task = { queue.lock().await.recv().await };
        let Some(WorkerTask { stream, target, id }) = task else {
            break;
        };

        let result = if bypass_http_handler {
            forward::forward_connection(stream, target, &[])
                .await
                .map(|_| ())
        } else {
            engine.handle(stream, target).await
        };

        if let Err(e) = result {
            let text = e.to_string();
            if text.contains("connection closed")
                || text.contains("broken pipe")
                || text.contains("reset by peer")
            {
                debug!("Connection {} ended early: {}", id, text);
            } else {
                debug!("Connection {} to {} failed: {}", id, target, text);
            }
        }
        active_connections.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("Worker {} stopped", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{GenericAdapter, ObjectStoreAdapter};
    use crate::config::CacheConfig;
    use crate::object_cache::ObjectCache;
    use crate::shutdown::ShutdownCoordinator;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_server_config() -> ServerConfig {
        ServerConfig {
            proxy_port: 0,
            worker_count: 4,
            queue_capacity: 16,
            bypass_http_handler: false,
        }
    }

    fn test_engine() -> Arc<CachingEngine> {
        let cache = Arc::new(ObjectCache::new(&CacheConfig {
            shards: 32,
            hard_max_bytes: 32 * 64 * 1024,
            max_entry_size: 32 * 1024,
            ..CacheConfig::default()
        }));
        Arc::new(CachingEngine::new(
            cache,
            vec![ObjectStoreAdapter::Generic(GenericAdapter {
                host: String::new(),
            })],
        ))
    }

    async fn spawn_origin(body: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buffer = [0u8; 4096];
                    let _ = stream.read(&mut buffer).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.write_all(body).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_dispatch_through_worker_pool() {
        let origin = spawn_origin(b"WORLD").await;

        let mut dispatcher = Dispatcher::bind(&test_server_config(), test_engine())
            .await
            .unwrap();
        dispatcher.set_target_resolver(Box::new(move |_| Ok(origin)));
        let proxy_addr = dispatcher.local_addr().unwrap();

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let signal = ShutdownSignal::new(coordinator.subscribe());
        let dispatcher_task = tokio::spawn(async move { dispatcher.run(signal).await });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(b"GET /b/k HTTP/1.1\r\nHost: h\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("WORLD"));

        coordinator.initiate_shutdown().await.unwrap();
        dispatcher_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_resolver_failure_drops_connection() {
        let mut dispatcher = Dispatcher::bind(&test_server_config(), test_engine())
            .await
            .unwrap();
        dispatcher
            .set_target_resolver(Box::new(|_| Err(ProxyError::Io("no destination".into()))));
        let proxy_addr = dispatcher.local_addr().unwrap();

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let signal = ShutdownSignal::new(coordinator.subscribe());
        let dispatcher_task = tokio::spawn(async move { dispatcher.run(signal).await });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(b"GET /b/k HTTP/1.1\r\nHost: h\r\n\r\n")
            .await
            .unwrap();
        // The proxy closes without writing anything; the read may also
        // surface as a reset depending on timing
        let mut response = Vec::new();
        let _ = client.read_to_end(&mut response).await;
        assert!(response.is_empty());

        coordinator.initiate_shutdown().await.unwrap();
        dispatcher_task.await.unwrap().unwrap();
    }
}
