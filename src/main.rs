use objcache_proxy::{
    adapter::ObjectStoreAdapter,
    config::Config,
    dispatcher::Dispatcher,
    engine::CachingEngine,
    object_cache::ObjectCache,
    redirect::Redirector,
    shutdown::{ShutdownCoordinator, ShutdownSignal},
    stats::{self, StatsLog},
    Result,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging.log_level);

    info!(
        "Starting objcache-proxy v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );
    info!(
        "Proxy port: {}, workers: {}, queue: {}",
        config.server.proxy_port, config.server.worker_count, config.server.queue_capacity
    );
    info!(
        "Cache: shards={}, life_window={:?}, clean_window={:?}, hard_max={}MB",
        config.cache.shards,
        config.cache.life_window,
        config.cache.clean_window,
        config.cache.hard_max_bytes / 1024 / 1024
    );
    if config.server.bypass_http_handler {
        info!("Bypass mode: HTTP handler disabled, raw forwarding only");
    }

    // Attach the kernel redirection hooks. Failure degrades to an idle
    // listener rather than aborting startup.
    let _redirector = if config.redirect.enabled {
        match Redirector::attach(&config.redirect, config.server.proxy_port) {
            Ok(redirector) => Some(redirector),
            Err(e) => {
                warn!("Continuing without kernel redirection: {}", e);
                None
            }
        }
    } else {
        info!("Kernel redirection disabled by configuration");
        None
    };

    // Build the cache, adapters, and engine
    let cache = Arc::new(ObjectCache::new(&config.cache));
    let adapters: Vec<ObjectStoreAdapter> = config
        .adapters
        .iter()
        .map(ObjectStoreAdapter::from_spec)
        .collect();
    for (index, spec) in config.adapters.iter().enumerate() {
        info!(
            "Adapter {}: {:?} (host filter: {:?})",
            index, spec.kind, spec.host
        );
    }
    let engine = Arc::new(CachingEngine::new(Arc::clone(&cache), adapters));

    // Bind the listener before anything else spawns; a bind failure is fatal
    let dispatcher = Dispatcher::bind(&config.server, Arc::clone(&engine)).await?;

    // Initialize shutdown coordinator
    let mut shutdown_coordinator = ShutdownCoordinator::new(Duration::from_secs(30));

    // Start the TTL sweeper
    let sweeper_signal = ShutdownSignal::new(shutdown_coordinator.subscribe());
    let _sweeper_task = tokio::spawn(Arc::clone(&cache).run_sweeper(sweeper_signal));

    // Start the stats sampler
    let _stats_task = if config.stats.enabled {
        let stats_log = Arc::new(StatsLog::new());
        if let Some(path) = &config.stats.csv_path {
            info!("Cache stats export: {}", path.display());
            shutdown_coordinator.set_stats_export(Arc::clone(&stats_log), path.clone());
        }
        let sampler_signal = ShutdownSignal::new(shutdown_coordinator.subscribe());
        Some(tokio::spawn(stats::run_sampler(
            Arc::clone(&cache),
            stats_log,
            config.stats.clone(),
            sampler_signal,
        )))
    } else {
        None
    };

    // Start the dispatcher
    let dispatcher_signal = ShutdownSignal::new(shutdown_coordinator.subscribe());
    let dispatcher_task = tokio::spawn(async move {
        if let Err(e) = dispatcher.run(dispatcher_signal).await {
            error!("Dispatcher failed: {}", e);
        }
    });

    // Start shutdown listener and wait for it to complete
    let shutdown_task = tokio::spawn(async move {
        if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
            error!("Shutdown coordinator failed: {}", e);
        }
    });

    shutdown_task.await.ok();
    info!("Shutdown coordinator completed, waiting for the dispatcher");
    dispatcher_task.await.ok();

    info!("objcache-proxy shutdown complete");
    Ok(())
}
