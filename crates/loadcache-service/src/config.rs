use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// How log lines are rendered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `pretty` when attached to a terminal, `simplified` otherwise.
    Auto,
    /// Multi-line, colored output.
    Pretty,
    /// One line per event, no colors.
    Simplified,
    /// One JSON object per event.
    Json,
}

/// The `logging` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// Verbosity of the engine's own events, overridden by `RUST_LOG`.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// The `metrics` section.
///
/// Metrics are only sent when `statsd` is set, either here or through `STATSD_SERVER`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of the statsd server.
    pub statsd: Option<String>,
    /// Prepended to every metric name.
    pub prefix: String,
    /// Tags sent along with every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "loadcache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Sizing of the in-memory tiers.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Size budget (in bytes) of the bounded resource cache.
    ///
    /// The budget is the sum of [`Resource::size`](crate::engine::Resource::size) of all
    /// entries. It can be scaled at runtime with
    /// [`Engine::set_memory_size_multiplier`](crate::engine::Engine::set_memory_size_multiplier).
    ///
    /// Defaults to `64 MiB`.
    pub max_size: u64,

    /// Whether resources that were dropped without being released are moved into the memory
    /// cache once their reclamation is noticed.
    ///
    /// Defaults to `false`.
    pub active_resource_retention: bool,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 64 * 1024 * 1024,
            active_resource_retention: false,
        }
    }
}

/// Configuration of the filesystem disk cache.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Maximum duration since last use of a cache item (item last used).
    ///
    /// `None` disables expiry, [`FsDiskCache::cleanup`](crate::caching::FsDiskCache::cleanup)
    /// then keeps every entry.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Option<Duration>,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            max_unused_for: Some(Duration::from_secs(3600 * 24 * 7)),
        }
    }
}

/// Sizing of the executor pools jobs run on.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolsConfig {
    /// Worker threads of the pool that reads from the disk caches.
    pub disk_cache_threads: usize,
    /// Worker threads of the pool fetching from sources.
    pub source_threads: usize,
    /// How many pipelines may run concurrently on the source pool.
    pub source_concurrency: usize,
    /// Worker threads of the source pool that has no concurrency limit.
    pub unlimited_source_threads: usize,
    /// Worker threads of the pool used for animated resources.
    pub animation_threads: usize,
    /// How many pipelines may run concurrently on the animation pool.
    pub animation_concurrency: usize,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            disk_cache_threads: 1,
            source_threads: 4,
            source_concurrency: 4,
            unlimited_source_threads: 4,
            animation_threads: 2,
            animation_concurrency: 2,
        }
    }
}

/// Engine configuration, usually read from a YAML file with [`Config::get`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the filesystem disk cache. Without it, nothing is persisted.
    pub cache_dir: Option<PathBuf>,

    pub logging: Logging,

    pub metrics: Metrics,

    /// Where internal errors are reported.
    pub sentry_dsn: Option<Dsn>,

    /// The in-memory tiers.
    pub memory_cache: MemoryCacheConfig,

    /// The filesystem disk cache, only used if `cache_dir` is set.
    pub disk_cache: DiskCacheConfig,

    /// The executor pools.
    pub pools: PoolsConfig,

    /// Upper bound of idle jobs kept around for reuse.
    pub job_pool_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            memory_cache: MemoryCacheConfig::default(),
            disk_cache: DiskCacheConfig::default(),
            pools: PoolsConfig::default(),
            job_pool_size: 150,
        }
    }
}

impl Config {
    /// Reads the configuration at `path`, or returns the defaults without a path.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open config file `{}`", path.display()))?;
        Self::from_reader(file)
    }

    /// Parses a YAML configuration. Unknown fields are ignored, an empty document is an error.
    pub fn from_reader(mut reader: impl io::Read) -> Result<Self> {
        let mut yaml = String::new();
        reader
            .read_to_string(&mut yaml)
            .context("failed to read config")?;
        anyhow::ensure!(!yaml.trim().is_empty(), "config is empty");
        serde_yaml::from_str(&yaml).context("invalid config YAML")
    }

    /// Joins `name` onto the configured `cache_dir`, if there is one.
    pub fn cache_dir<P: AsRef<Path>>(&self, name: P) -> Option<PathBuf> {
        Some(self.cache_dir.as_ref()?.join(name))
    }
}

/// Accepts the level names understood by [`LevelFilter`]'s `FromStr`, like `"off"` or `"debug"`.
fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    let level = String::deserialize(deserializer)?;
    level.parse().map_err(|_| {
        de::Error::invalid_value(
            de::Unexpected::Str(&level),
            &"one of off, error, warn, info, debug or trace",
        )
    })
}
