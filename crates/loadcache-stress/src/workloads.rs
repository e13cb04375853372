use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::oneshot;

use loadcache_service::caching::FetchError;
use loadcache_service::engine::{
    DirectExecutor, Engine, EngineResource, LoadError, LoadRequest, Model, Options, Priority,
    ResourceCallback,
};
use loadcache_service::pipeline::{DataFetcher, DataSource, DiskCacheStrategy, LoadData, ModelLoader};
use loadcache_test::TestResource;

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open workloads file `{}`", path.display()))?;
        let config: Self = serde_yaml::from_reader(file).context("invalid workloads YAML")?;
        anyhow::ensure!(!config.workloads.is_empty(), "no workloads defined");
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
pub struct Workload {
    pub concurrency: usize,
    /// How many distinct models the workload requests.
    pub keys: usize,
    /// How long every fetch takes.
    #[serde(with = "humantime_serde", default)]
    pub fetch_delay: Duration,
    /// The probability of a fetch failing, between 0 and 1.
    #[serde(default)]
    pub fail_rate: f64,
    /// The size in bytes of fetched data.
    #[serde(default = "default_data_size")]
    pub data_size: usize,
    #[serde(default)]
    pub disk_cache_strategy: Option<DiskCacheStrategy>,
}

fn default_data_size() -> usize {
    1024
}

/// Counts how often a workload's fetchers actually ran.
#[derive(Debug, Default)]
pub struct FetchStats {
    pub fetches: AtomicUsize,
    pub failures: AtomicUsize,
}

struct SyntheticFetcher {
    data: Bytes,
    delay: Duration,
    fail_rate: f64,
    stats: Arc<FetchStats>,
}

impl DataFetcher for SyntheticFetcher {
    fn load_data(&self, _priority: Priority) -> BoxFuture<'_, Result<Bytes, FetchError>> {
        Box::pin(async move {
            self.stats.fetches.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(self.delay).await;
            if rand::random_bool(self.fail_rate.clamp(0.0, 1.0)) {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                return Err(FetchError::DownloadError("synthetic failure".into()));
            }
            Ok(self.data.clone())
        })
    }

    fn data_class(&self) -> &str {
        "bytes"
    }

    fn data_source(&self) -> DataSource {
        DataSource::Remote
    }
}

/// Serves the models of a single workload, `<prefix><n>`.
pub struct SyntheticLoader {
    prefix: String,
    data: Bytes,
    delay: Duration,
    fail_rate: f64,
    stats: Arc<FetchStats>,
}

impl SyntheticLoader {
    pub fn new(prefix: String, workload: &Workload, stats: Arc<FetchStats>) -> Self {
        Self {
            prefix,
            data: Bytes::from(vec![0xab; workload.data_size]),
            delay: workload.fetch_delay,
            fail_rate: workload.fail_rate,
            stats,
        }
    }
}

impl ModelLoader for SyntheticLoader {
    fn handles(&self, model: &Model) -> bool {
        model.as_str().starts_with(&self.prefix)
    }

    fn build_load_data(
        &self,
        model: &Model,
        _width: u32,
        _height: u32,
        _options: &Options,
    ) -> Option<LoadData> {
        let fetcher = SyntheticFetcher {
            data: self.data.clone(),
            delay: self.delay,
            fail_rate: self.fail_rate,
            stats: Arc::clone(&self.stats),
        };
        Some(LoadData::new(model.as_str(), Arc::new(fetcher)))
    }
}

type Outcome = Result<(EngineResource<TestResource>, DataSource), LoadError>;

struct OneshotCallback(Mutex<Option<oneshot::Sender<Outcome>>>);

impl OneshotCallback {
    fn send(&self, outcome: Outcome) {
        let sender = self.0.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(sender) = sender {
            sender.send(outcome).ok();
        }
    }
}

impl ResourceCallback<TestResource> for OneshotCallback {
    fn on_resource_ready(&self, resource: EngineResource<TestResource>, data_source: DataSource) {
        self.send(Ok((resource, data_source)));
    }

    fn on_load_failed(&self, error: LoadError) {
        self.send(Err(error));
    }
}

/// Loads `request` and releases the resource right away.
///
/// Returns where the resource came from.
pub async fn process_load(
    engine: &Engine<TestResource>,
    request: LoadRequest,
) -> Result<DataSource, LoadError> {
    let (tx, rx) = oneshot::channel();
    let callback = Arc::new(OneshotCallback(Mutex::new(Some(tx))));
    let _status = engine.load(request, callback, Arc::new(DirectExecutor));

    let (resource, data_source) = rx.await.map_err(|_| LoadError::default())??;
    engine.release(resource);
    Ok(data_source)
}
