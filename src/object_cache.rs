//! Object Cache Module
//!
//! A sharded, byte-bounded, TTL-swept in-memory store for cached object
//! responses. Each shard owns a hash map plus an insertion-order ring used for
//! oldest-first eviction and TTL sweeping. Concurrent misses on the same
//! fingerprint collapse to a single origin fetch through an in-flight table of
//! broadcast completion handles.

use crate::config::CacheConfig;
use crate::shutdown::ShutdownSignal;
use crate::{ProxyError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

/// What the cache stores per fingerprint: the origin response headers captured
/// verbatim plus the raw body bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Encode a record into the opaque shard payload
pub fn encode_record(record: &StoredRecord) -> Result<Vec<u8>> {
    bincode::serialize(record).map_err(|e| ProxyError::Serialization(e.to_string()))
}

/// Decode a shard payload back into a record
pub fn decode_record(payload: &[u8]) -> Result<StoredRecord> {
    bincode::deserialize(payload).map_err(|e| ProxyError::Deserialization(e.to_string()))
}

/// Result broadcast to single-flight waiters.
/// `Ok(())` means the record is now in the cache; `Err` carries the fetch
/// error message.
pub type FlightResult = std::result::Result<(), String>;

/// One message is enough: the completion notification
const FLIGHT_CHANNEL_CAPACITY: usize = 1;

struct Entry {
    payload: Vec<u8>,
    inserted_at: Instant,
}

fn entry_size(key: &str, payload: &[u8]) -> u64 {
    (key.len() + payload.len()) as u64
}

#[derive(Default)]
struct Shard {
    map: HashMap<String, Entry>,
    /// Insertion-order ring; the front is always the oldest live entry
    order: VecDeque<String>,
    bytes: u64,
}

impl Shard {
    fn remove_key(&mut self, key: &str) -> Option<Entry> {
        let entry = self.map.remove(key)?;
        self.bytes = self.bytes.saturating_sub(entry_size(key, &entry.payload));
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        Some(entry)
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let key = self.order.pop_front()?;
        if let Some(entry) = self.map.remove(&key) {
            self.bytes = self.bytes.saturating_sub(entry_size(&key, &entry.payload));
        }
        Some(key)
    }

    fn insert(&mut self, key: String, entry: Entry) {
        self.bytes += entry_size(&key, &entry.payload);
        self.order.push_back(key.clone());
        self.map.insert(key, entry);
    }
}

/// Cache counters, snapshot form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub del_hits: u64,
    pub del_misses: u64,
    /// Reserved: shards key on the full fingerprint string, so hash
    /// collisions cannot produce false hits
    pub collisions: u64,
}

/// Role assigned to a caller after registering for a missing fingerprint
pub enum FetchRole {
    /// First caller; responsible for running the origin fetch and completing
    /// the guard
    Fetcher(FlightGuard),
    /// Someone else is already fetching; await the receiver
    Waiter(broadcast::Receiver<FlightResult>),
}

/// RAII handle for an in-flight fetch.
///
/// Dropping the guard without completing closes the channel; waiters observe
/// the closure and fall back to their own fetch or forward path.
pub struct FlightGuard {
    key: String,
    sender: broadcast::Sender<FlightResult>,
    pending: Arc<DashMap<String, broadcast::Sender<FlightResult>>>,
    completed: bool,
}

impl FlightGuard {
    /// Notify all waiters that the record is cached and retire the flight
    pub fn complete_success(mut self) {
        self.completed = true;
        let _ = self.sender.send(Ok(()));
        self.pending.remove(&self.key);
    }

    /// Notify all waiters of the fetch failure and retire the flight.
    /// Failures are never cached.
    pub fn complete_error(mut self, error: String) {
        self.completed = true;
        let _ = self.sender.send(Err(error));
        self.pending.remove(&self.key);
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.pending.remove(&self.key);
        }
    }
}

/// Sharded fingerprint → record store with single-flight initialization
pub struct ObjectCache {
    shards: Vec<Mutex<Shard>>,
    shard_budget: u64,
    max_entry_size: u64,
    life_window: Duration,
    clean_window: Duration,
    pending: Arc<DashMap<String, broadcast::Sender<FlightResult>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    del_hits: AtomicU64,
    del_misses: AtomicU64,
}

impl ObjectCache {
    pub fn new(config: &CacheConfig) -> Self {
        let shard_count = config.shards.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(Mutex::new(Shard::default()));
        }

        Self {
            shards,
            // Per-shard budget keeps the global cap without cross-shard locks
            shard_budget: config.hard_max_bytes / shard_count as u64,
            max_entry_size: config.max_entry_size,
            life_window: config.life_window,
            clean_window: config.clean_window,
            pending: Arc::new(DashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            del_hits: AtomicU64::new(0),
            del_misses: AtomicU64::new(0),
        }
    }

    /// Shard owning a fingerprint; stable across the cache lifetime
    pub fn shard_for(&self, key: &str) -> usize {
        (xxh3_64(key.as_bytes()) % self.shards.len() as u64) as usize
    }

    /// Look up a fingerprint. Side-effect free apart from the hit/miss
    /// counters: no reordering, no TTL refresh.
    pub fn get(&self, key: &str) -> Option<StoredRecord> {
        let shard = self.shards[self.shard_for(key)].lock().unwrap();
        match shard.map.get(key) {
            Some(entry) => match decode_record(&entry.payload) {
                Ok(record) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(record)
                }
                Err(e) => {
                    // A record that cannot decode is as good as absent
                    warn!("Dropping undecodable cache entry for {}: {}", key, e);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Presence check that bypasses the hit/miss counters
    pub fn contains(&self, key: &str) -> bool {
        self.shards[self.shard_for(key)]
            .lock()
            .unwrap()
            .map
            .contains_key(key)
    }

    /// Largest encoded entry the cache will accept
    pub fn max_entry_size(&self) -> u64 {
        self.max_entry_size
    }

    /// Insert a record, evicting oldest entries in the owning shard until it
    /// fits. An entry that can never fit fails without touching shard state.
    pub fn put(&self, key: &str, record: &StoredRecord) -> Result<()> {
        if key.is_empty() {
            return Err(ProxyError::InvalidKey("empty fingerprint".to_string()));
        }
        if record.body.is_empty() {
            return Err(ProxyError::DataNil);
        }

        let payload = encode_record(record)?;
        let size = entry_size(key, &payload);
        if size > self.max_entry_size {
            return Err(ProxyError::Cache(format!(
                "entry for {} is {} bytes, over the {} byte entry limit",
                key, size, self.max_entry_size
            )));
        }
        if size > self.shard_budget {
            return Err(ProxyError::Cache(format!(
                "entry for {} is {} bytes, over the {} byte shard budget",
                key, size, self.shard_budget
            )));
        }

        let mut shard = self.shards[self.shard_for(key)].lock().unwrap();
        shard.remove_key(key);
        while shard.bytes + size > self.shard_budget {
            match shard.evict_oldest() {
                Some(evicted) => debug!("Evicted {} to make room for {}", evicted, key),
                None => break,
            }
        }
        shard.insert(
            key.to_string(),
            Entry {
                payload,
                inserted_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Remove a fingerprint; `CacheMiss` if it was not present
    pub fn delete(&self, key: &str) -> Result<()> {
        let mut shard = self.shards[self.shard_for(key)].lock().unwrap();
        if shard.remove_key(key).is_some() {
            self.del_hits.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            self.del_misses.fetch_add(1, Ordering::Relaxed);
            Err(ProxyError::CacheMiss)
        }
    }

    /// Register interest in a missing fingerprint.
    ///
    /// The first caller becomes the fetcher and must complete the returned
    /// guard; everyone else gets a receiver for the completion broadcast.
    pub fn begin_flight(&self, key: &str) -> FetchRole {
        match self.pending.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, _rx) = broadcast::channel(FLIGHT_CHANNEL_CAPACITY);
                vacant.insert(tx.clone());
                FetchRole::Fetcher(FlightGuard {
                    key: key.to_string(),
                    sender: tx,
                    pending: Arc::clone(&self.pending),
                    completed: false,
                })
            }
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                FetchRole::Waiter(occupied.get().subscribe())
            }
        }
    }

    /// Number of fetches currently in flight
    pub fn in_flight_count(&self) -> usize {
        self.pending.len()
    }

    /// Fetch a record, running `initializer` at most once per miss epoch no
    /// matter how many callers arrive concurrently.
    ///
    /// The initializer runs outside any shard lock. Waiters whose fetcher
    /// vanishes (guard dropped without completion) retry and may become the
    /// fetcher themselves.
    pub async fn get_or_init<F, Fut>(
        &self,
        key: &str,
        initializer: Option<F>,
    ) -> Result<StoredRecord>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<StoredRecord>>,
    {
        loop {
            if let Some(found) = self.get(key) {
                return Ok(found);
            }

            let init = initializer.as_ref().ok_or(ProxyError::InitializerNil)?;

            match self.begin_flight(key) {
                FetchRole::Fetcher(guard) => {
                    // The record may have landed between the miss and the
                    // registration
                    if let Some(found) = self.get(key) {
                        guard.complete_success();
                        return Ok(found);
                    }
                    match init().await {
                        Ok(record) => {
                            if let Err(e) = self.put(key, &record) {
                                guard.complete_error(e.to_string());
                                return Err(e);
                            }
                            guard.complete_success();
                            return Ok(record);
                        }
                        Err(e) => {
                            let message = e.to_string();
                            guard.complete_error(message.clone());
                            return Err(ProxyError::InitializerFailed(message));
                        }
                    }
                }
                FetchRole::Waiter(mut rx) => match rx.recv().await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => return Err(ProxyError::InitializerFailed(e)),
                    // Channel closed: the fetcher died, take over on retry
                    Err(_) => continue,
                },
            }
        }
    }

    /// Remove entries older than the life window. Returns how many were
    /// removed.
    pub fn sweep_expired(&self) -> u64 {
        let mut removed = 0u64;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            loop {
                let expired = match shard.order.front() {
                    Some(front) => shard
                        .map
                        .get(front)
                        .map(|e| e.inserted_at.elapsed() > self.life_window)
                        .unwrap_or(true),
                    None => false,
                };
                if !expired {
                    break;
                }
                if shard.evict_oldest().is_some() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Background TTL sweeper; runs every clean window until shutdown
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown_signal: ShutdownSignal) {
        let mut interval = tokio::time::interval(self.clean_window);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = self.sweep_expired();
                    if removed > 0 {
                        debug!("TTL sweep removed {} entries", removed);
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("Cache sweeper received shutdown signal");
                    break;
                }
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            del_hits: self.del_hits.load(Ordering::Relaxed),
            del_misses: self.del_misses.load(Ordering::Relaxed),
            collisions: 0,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().map.len()).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.shards.iter().map(|s| s.lock().unwrap().bytes).sum()
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;

    /// Encoding round-trips losslessly for any record
    #[quickcheck]
    fn prop_record_round_trip(headers: Vec<(String, String)>, body: Vec<u8>) -> TestResult {
        let original = StoredRecord { headers, body };
        match encode_record(&original) {
            Ok(payload) => match decode_record(&payload) {
                Ok(decoded) if decoded == original => TestResult::passed(),
                _ => TestResult::failed(),
            },
            Err(_) => TestResult::failed(),
        }
    }

    /// Shard selection is stable and in range
    #[quickcheck]
    fn prop_shard_selection_stable(key: String) -> bool {
        let cache = ObjectCache::new(&CacheConfig::default());
        let first = cache.shard_for(&key);
        first == cache.shard_for(&key) && first < 1024
    }

    /// put followed by get returns the stored bytes
    #[quickcheck]
    fn prop_put_get_round_trip(key: String, body: Vec<u8>) -> TestResult {
        if key.is_empty() || body.is_empty() || body.len() > 4096 {
            return TestResult::discard();
        }
        let config = CacheConfig {
            shards: 32,
            max_entry_size: 16 * 1024,
            hard_max_bytes: 32 * 64 * 1024,
            ..CacheConfig::default()
        };
        let cache = ObjectCache::new(&config);
        let record = StoredRecord {
            headers: Vec::new(),
            body: body.clone(),
        };
        if cache.put(&key, &record).is_err() {
            return TestResult::failed();
        }
        match cache.get(&key) {
            Some(found) if found.body == body => TestResult::passed(),
            _ => TestResult::failed(),
        }
    }
}
