//! Statistics Module
//!
//! Periodically snapshots the cache counters and exports them as CSV. The
//! sampler runs as a background task; the shutdown coordinator writes one
//! final export on teardown.

use crate::config::StatsConfig;
use crate::object_cache::{CacheStats, ObjectCache};
use crate::shutdown::ShutdownSignal;
use crate::{ProxyError, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// One timestamped view of the cache counters
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub time: DateTime<Utc>,
    pub stats: CacheStats,
}

/// Append-only log of cache stats snapshots
#[derive(Default)]
pub struct StatsLog {
    entries: Mutex<Vec<StatsSnapshot>>,
}

impl StatsLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, stats: CacheStats) {
        self.entries.lock().unwrap().push(StatsSnapshot {
            time: Utc::now(),
            stats,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite `path` with every recorded snapshot
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let entries = self.entries.lock().unwrap();
        let mut out = String::from("time,hits,misses,delete_hits,delete_misses,collisions\n");
        for snapshot in entries.iter() {
            out.push_str(&format!(
                "{},{},{},{},{},{}\n",
                snapshot.time.to_rfc3339(),
                snapshot.stats.hits,
                snapshot.stats.misses,
                snapshot.stats.del_hits,
                snapshot.stats.del_misses,
                snapshot.stats.collisions
            ));
        }
        std::fs::write(path, out)
            .map_err(|e| ProxyError::Io(format!("writing {}: {}", path.display(), e)))
    }
}

/// Background sampler; records every `sample_interval` and keeps the CSV
/// export current when a path is configured
pub async fn run_sampler(
    cache: Arc<ObjectCache>,
    log: Arc<StatsLog>,
    config: StatsConfig,
    mut shutdown_signal: ShutdownSignal,
) {
    let mut interval = tokio::time::interval(config.sample_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let stats = cache.stats();
                debug!(
                    "Cache stats: hits={}, misses={}, entries={}, bytes={}",
                    stats.hits, stats.misses, cache.entry_count(), cache.total_bytes()
                );
                log.record(stats);
                if let Some(path) = &config.csv_path {
                    if let Err(e) = log.write_csv(path) {
                        warn!("Stats export failed: {}", e);
                    }
                }
            }
            _ = shutdown_signal.wait_for_shutdown() => {
                info!("Stats sampler received shutdown signal");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(hits: u64, misses: u64) -> CacheStats {
        CacheStats {
            hits,
            misses,
            del_hits: 1,
            del_misses: 2,
            collisions: 0,
        }
    }

    #[test]
    fn test_record_appends() {
        let log = StatsLog::new();
        assert!(log.is_empty());
        log.record(stats(1, 2));
        log.record(stats(3, 4));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_write_csv_format() {
        let log = StatsLog::new();
        log.record(stats(10, 5));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache_stats.csv");
        log.write_csv(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "time,hits,misses,delete_hits,delete_misses,collisions"
        );
        assert!(lines[1].ends_with(",10,5,1,2,0"));
    }

    #[test]
    fn test_write_csv_overwrites() {
        let log = StatsLog::new();
        log.record(stats(1, 1));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache_stats.csv");
        log.write_csv(&path).unwrap();
        log.record(stats(2, 2));
        log.write_csv(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }
}
