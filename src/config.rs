//! Configuration Module
//!
//! Handles configuration loading from an optional YAML file plus command-line
//! overrides, with per-section validation.

use crate::{ProxyError, Result};
use clap::{Arg, ArgAction, Command};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs_f64()))
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let mut num_end = 0;
        for (i, c) in s.chars().enumerate() {
            if c.is_ascii_digit() || c == '.' {
                num_end = i + 1;
            } else {
                break;
            }
        }

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let duration = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            "" => Duration::from_secs_f64(value),
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub redirect: RedirectConfig,
    #[serde(default)]
    pub adapters: Vec<AdapterSpec>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

/// Server and worker-pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the local proxy listener binds on 127.0.0.1
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    /// Number of worker tasks draining the connection queue
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Capacity of the bounded connection queue; a full queue back-pressures
    /// the acceptor
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Skip the HTTP caching handler and raw-forward every connection
    #[serde(default)]
    pub bypass_http_handler: bool,
}

fn default_proxy_port() -> u16 {
    18000
}

fn default_worker_count() -> usize {
    10_000
}

fn default_queue_capacity() -> usize {
    100_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            proxy_port: default_proxy_port(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            bypass_http_handler: false,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.proxy_port < 1024 {
            return Err(format!(
                "Proxy port must be 1024 or higher for non-privileged ports, got {}",
                self.proxy_port
            ));
        }
        if self.worker_count == 0 {
            return Err("Worker count must be at least 1".to_string());
        }
        if self.queue_capacity < self.worker_count {
            return Err(format!(
                "Queue capacity ({}) must be at least the worker count ({})",
                self.queue_capacity, self.worker_count
            ));
        }
        Ok(())
    }
}

/// Object cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of independent shards; must be a power of two in [32, 1024]
    #[serde(default = "default_shards")]
    pub shards: usize,
    /// Entry lifetime before the sweeper removes it
    #[serde(with = "duration_serde", default = "default_life_window")]
    pub life_window: Duration,
    /// Interval between sweeper passes
    #[serde(with = "duration_serde", default = "default_clean_window")]
    pub clean_window: Duration,
    /// Hard cap on total cached bytes across all shards
    #[serde(default = "default_hard_max_bytes")]
    pub hard_max_bytes: u64,
    /// Largest acceptable encoded entry
    #[serde(default = "default_max_entry_size")]
    pub max_entry_size: u64,
}

fn default_shards() -> usize {
    1024
}

fn default_life_window() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_clean_window() -> Duration {
    Duration::from_secs(1)
}

fn default_hard_max_bytes() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_max_entry_size() -> u64 {
    1_000_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            life_window: default_life_window(),
            clean_window: default_clean_window(),
            hard_max_bytes: default_hard_max_bytes(),
            max_entry_size: default_max_entry_size(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(32..=1024).contains(&self.shards) || !self.shards.is_power_of_two() {
            return Err(format!(
                "Cache shards must be a power of two between 32 and 1024, got {}",
                self.shards
            ));
        }
        if self.clean_window.is_zero() {
            return Err("Clean window must be non-zero".to_string());
        }
        if self.life_window < self.clean_window {
            return Err(format!(
                "Life window ({:?}) must be at least the clean window ({:?})",
                self.life_window, self.clean_window
            ));
        }
        if self.hard_max_bytes / self.shards as u64 == 0 {
            return Err("Hard cache size too small for the shard count".to_string());
        }
        Ok(())
    }
}

/// Kernel redirection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectConfig {
    /// Attach the cgroup hooks at startup; disabling leaves an idle listener
    #[serde(default = "default_redirect_enabled")]
    pub enabled: bool,
    /// Root cgroup the three programs attach to
    #[serde(default = "default_cgroup_path")]
    pub cgroup_path: PathBuf,
    /// Compiled eBPF object file
    #[serde(default = "default_bpf_object_path")]
    pub bpf_object_path: PathBuf,
}

fn default_redirect_enabled() -> bool {
    true
}

fn default_cgroup_path() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_bpf_object_path() -> PathBuf {
    PathBuf::from("proxy_bpf.o")
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            enabled: default_redirect_enabled(),
            cgroup_path: default_cgroup_path(),
            bpf_object_path: default_bpf_object_path(),
        }
    }
}

/// Which object-storage dialect an adapter speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// Path-style `/<bucket>/<key>` with octet-stream synthesis
    Generic,
    /// MinIO dialect; restores captured origin headers on synthesis
    Minio,
}

/// One adapter registration; order in the list is match priority
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub kind: AdapterKind,
    /// Substring the request Host header must contain; empty matches any host
    #[serde(default)]
    pub host: String,
}

impl Default for AdapterSpec {
    fn default() -> Self {
        Self {
            kind: AdapterKind::Generic,
            host: String::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Cache statistics sampling and export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_stats_enabled")]
    pub enabled: bool,
    #[serde(with = "duration_serde", default = "default_sample_interval")]
    pub sample_interval: Duration,
    /// When set, the sampler rewrites this CSV file on every pass
    #[serde(default)]
    pub csv_path: Option<PathBuf>,
}

fn default_stats_enabled() -> bool {
    true
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: default_stats_enabled(),
            sample_interval: default_sample_interval(),
            csv_path: None,
        }
    }
}

impl Config {
    /// Load configuration from command-line arguments and an optional YAML file
    pub fn load() -> Result<Config> {
        let matches = Command::new("objcache-proxy")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Transparent caching proxy for object-storage traffic")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Path to a YAML configuration file"),
            )
            .arg(
                Arg::new("bypass")
                    .long("bypass")
                    .action(ArgAction::SetTrue)
                    .help("Disable the HTTP caching handler and raw-forward every connection"),
            )
            .get_matches();

        let mut config = match matches.get_one::<String>("config") {
            Some(path) => Self::from_file(path)?,
            None => {
                debug!("No configuration file given, using defaults");
                Config::default()
            }
        };

        if matches.get_flag("bypass") {
            config.server.bypass_http_handler = true;
        }

        if config.adapters.is_empty() {
            config.adapters.push(AdapterSpec::default());
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML file
    pub fn from_file(path: &str) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("Failed to read {}: {}", path, e)))?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.server.validate().map_err(ProxyError::Config)?;
        self.cache.validate().map_err(ProxyError::Config)?;
        if !self.server.bypass_http_handler && self.adapters.is_empty() {
            return Err(ProxyError::Config(
                "At least one adapter is required unless bypass mode is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let mut config = Config::default();
        config.adapters.push(AdapterSpec::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.server.proxy_port, 18000);
        assert_eq!(config.server.worker_count, 10_000);
        assert_eq!(config.server.queue_capacity, 100_000);
        assert_eq!(config.cache.shards, 1024);
        assert_eq!(config.cache.life_window, Duration::from_secs(600));
        assert_eq!(config.cache.clean_window, Duration::from_secs(1));
    }

    #[test]
    fn test_parse_duration_units() {
        use duration_serde::parse_duration;

        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("5 fortnights").is_err());
    }

    #[test]
    fn test_shard_count_validation() {
        let mut cache = CacheConfig::default();
        cache.shards = 100; // not a power of two
        assert!(cache.validate().is_err());
        cache.shards = 16; // below range
        assert!(cache.validate().is_err());
        cache.shards = 32;
        assert!(cache.validate().is_ok());
    }

    #[test]
    fn test_queue_must_cover_workers() {
        let mut server = ServerConfig::default();
        server.worker_count = 100;
        server.queue_capacity = 50;
        assert!(server.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
server:
  proxy_port: 19000
  worker_count: 64
  queue_capacity: 256
cache:
  shards: 64
  life_window: 2m
  clean_window: 500ms
  hard_max_bytes: 1048576
adapters:
  - kind: minio
    host: minio.internal
  - kind: generic
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.proxy_port, 19000);
        assert_eq!(config.cache.shards, 64);
        assert_eq!(config.cache.life_window, Duration::from_secs(120));
        assert_eq!(config.cache.clean_window, Duration::from_millis(500));
        assert_eq!(config.adapters.len(), 2);
        assert_eq!(config.adapters[0].kind, AdapterKind::Minio);
        assert_eq!(config.adapters[0].host, "minio.internal");
        assert_eq!(config.adapters[1].host, "");
        assert!(config.validate().is_ok());
    }
}
