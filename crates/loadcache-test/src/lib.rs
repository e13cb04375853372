//! Helpers for testing the engine.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the disk cache silently stops
//!    persisting anything. To avoid this, assign it to a variable in the test function (e.g.
//!    `let _cache_dir = test::tempdir()`).
//!
//!  - [`TestFetcher`]s are shared between the test and the engine. Keep an `Arc` around to
//!    inspect how often they were called, cleaned up, or cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{Notify, mpsc};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use loadcache_service::caching::{CacheKey, DiskCache, DiskCacheFactory, FetchError, Writer};
use loadcache_service::config::{Config, PoolsConfig};
use loadcache_service::engine::{
    EngineResource, Executors, LoadError, Model, Options, Priority, Resource, ResourceCallback,
};
use loadcache_service::pipeline::{
    DataFetcher, DataSource, Decoded, EncodeStrategy, LoadData, ModelLoader, ResourceDecoder,
};

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `loadcache_service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("loadcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A config with the filesystem disk cache in `cache_dir`.
pub fn config_with_cache(cache_dir: &TempDir) -> Config {
    Config {
        cache_dir: Some(cache_dir.path().to_path_buf()),
        ..Default::default()
    }
}

/// Executors running every pool on the current tokio runtime.
///
/// # Panics
///
/// Panics when called outside of a tokio runtime.
pub fn executors() -> Executors {
    Executors::with_handle(
        tokio::runtime::Handle::current(),
        &PoolsConfig::default(),
    )
}

/// The resource produced by [`TestDecoder`]: the decoded bytes.
#[derive(Debug)]
pub struct TestResource {
    pub data: Bytes,
    recycled: Arc<AtomicUsize>,
}

impl Resource for TestResource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn recycle(&self) {
        self.recycled.fetch_add(1, Ordering::SeqCst);
    }
}

/// Decodes any data into a [`TestResource`].
///
/// Data equal to `b"corrupt"` is rejected as malformed.
#[derive(Debug, Default)]
pub struct TestDecoder {
    recycled: Arc<AtomicUsize>,
    decoded: Arc<Mutex<Vec<DataSource>>>,
    encode_strategy: EncodeStrategy,
    data_class: Option<String>,
}

impl TestDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the decoder encode resources for the disk cache with the given strategy.
    pub fn encode_strategy(mut self, strategy: EncodeStrategy) -> Self {
        self.encode_strategy = strategy;
        self
    }

    /// Only handles data of `class`, instead of every class.
    pub fn only_class(mut self, class: &str) -> Self {
        self.data_class = Some(class.to_owned());
        self
    }

    /// How many resources produced by this decoder have been recycled.
    pub fn recycled(&self) -> Arc<AtomicUsize> {
        self.recycled.clone()
    }

    /// The sources of all data this decoder has been given, in order.
    pub fn decoded(&self) -> Arc<Mutex<Vec<DataSource>>> {
        self.decoded.clone()
    }
}

impl ResourceDecoder<TestResource> for TestDecoder {
    fn handles(&self, data_class: &str) -> bool {
        self.data_class
            .as_deref()
            .is_none_or(|class| class == data_class)
    }

    fn decode(
        &self,
        data: Bytes,
        data_source: DataSource,
        _options: &Options,
    ) -> Decoded<TestResource> {
        self.decoded.lock().unwrap().push(data_source);
        if data == "corrupt" {
            return Err(FetchError::Malformed("corrupt data".into()));
        }
        Ok(TestResource {
            data,
            recycled: self.recycled.clone(),
        })
    }

    fn encode(&self, resource: &TestResource) -> Option<Bytes> {
        Some(resource.data.clone())
    }

    fn encode_strategy(&self) -> EncodeStrategy {
        self.encode_strategy
    }
}

/// A [`DataFetcher`] with canned results that records how it is used.
#[derive(Debug)]
pub struct TestFetcher {
    result: Result<Bytes, FetchError>,
    delay: Duration,
    data_source: DataSource,
    data_class: String,
    gate: Option<Arc<Notify>>,
    calls: AtomicUsize,
    cleanups: AtomicUsize,
    cancels: AtomicUsize,
}

impl TestFetcher {
    /// A remote fetcher producing `data`.
    pub fn new(data: &'static [u8]) -> Self {
        Self {
            result: Ok(Bytes::from_static(data)),
            delay: Duration::ZERO,
            data_source: DataSource::Remote,
            data_class: "bytes".into(),
            gate: None,
            calls: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        }
    }

    /// A remote fetcher failing with `error`.
    pub fn failing(error: FetchError) -> Self {
        Self {
            result: Err(error),
            ..Self::new(b"")
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn data_source(mut self, data_source: DataSource) -> Self {
        self.data_source = data_source;
        self
    }

    pub fn data_class(mut self, class: &str) -> Self {
        self.data_class = class.to_owned();
        self
    }

    /// Holds every fetch until `gate` is notified.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl DataFetcher for TestFetcher {
    fn load_data(&self, _priority: Priority) -> BoxFuture<'_, Result<Bytes, FetchError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.result.clone()
        })
    }

    fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn data_class(&self) -> &str {
        &self.data_class
    }

    fn data_source(&self) -> DataSource {
        self.data_source
    }
}

/// A [`ModelLoader`] handing out the same [`TestFetcher`] for every model.
///
/// The source key of a model is the model itself, prefixed with the loader's key prefix.
pub struct TestLoader {
    fetcher: Arc<TestFetcher>,
    key_prefix: String,
    alternate_keys: Vec<String>,
}

impl TestLoader {
    pub fn new(fetcher: Arc<TestFetcher>) -> Self {
        Self {
            fetcher,
            key_prefix: String::new(),
            alternate_keys: Vec::new(),
        }
    }

    pub fn key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_owned();
        self
    }

    pub fn alternate_keys(mut self, keys: &[&str]) -> Self {
        self.alternate_keys = keys.iter().map(|key| key.to_string()).collect();
        self
    }
}

impl ModelLoader for TestLoader {
    fn handles(&self, _model: &Model) -> bool {
        true
    }

    fn build_load_data(
        &self,
        model: &Model,
        _width: u32,
        _height: u32,
        _options: &Options,
    ) -> Option<LoadData> {
        let fetcher: Arc<dyn DataFetcher> = self.fetcher.clone();
        let load_data = LoadData::new(format!("{}{model}", self.key_prefix), fetcher)
            .with_alternate_keys(self.alternate_keys.clone());
        Some(load_data)
    }
}

pub type Outcome = Result<(EngineResource<TestResource>, DataSource), LoadError>;

/// A [`ResourceCallback`] recording every outcome it receives.
pub struct RecordingCallback {
    tx: mpsc::UnboundedSender<Outcome>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Outcome>>,
    received: AtomicUsize,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            received: AtomicUsize::new(0),
        })
    }

    /// Waits for the next outcome.
    ///
    /// # Panics
    ///
    /// Panics if nothing is received within five seconds.
    pub async fn wait(&self) -> Outcome {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for the callback")
            .expect("callback channel closed")
    }

    /// Waits for the next outcome, expecting a resource.
    pub async fn resource(&self) -> (EngineResource<TestResource>, DataSource) {
        match self.wait().await {
            Ok(ready) => ready,
            Err(error) => panic!("load failed: {error}"),
        }
    }

    /// Waits for the next outcome, expecting a failure.
    pub async fn error(&self) -> LoadError {
        match self.wait().await {
            Ok((resource, _)) => panic!("expected failure, got {resource:?}"),
            Err(error) => error,
        }
    }

    /// How many outcomes were received in total.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

impl ResourceCallback<TestResource> for RecordingCallback {
    fn on_resource_ready(&self, resource: EngineResource<TestResource>, data_source: DataSource) {
        self.received.fetch_add(1, Ordering::SeqCst);
        self.tx.send(Ok((resource, data_source))).ok();
    }

    fn on_load_failed(&self, error: LoadError) {
        self.received.fetch_add(1, Ordering::SeqCst);
        self.tx.send(Err(error)).ok();
    }
}

/// An in-memory [`DiskCache`] that counts reads and writes.
#[derive(Debug, Default)]
pub struct MemoryDiskCache {
    entries: Mutex<HashMap<CacheKey, Bytes>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryDiskCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A factory handing this cache to an engine.
    pub fn factory(self: &Arc<Self>) -> impl DiskCacheFactory + 'static {
        let cache: Arc<dyn DiskCache> = self.clone();
        move || Some(cache.clone())
    }

    /// Stores `data` under `key` without counting it as a write.
    pub fn insert(&self, key: CacheKey, data: &'static [u8]) {
        self.entries
            .lock()
            .unwrap()
            .insert(key, Bytes::from_static(data));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl DiskCache for MemoryDiskCache {
    fn get(&self, key: &CacheKey) -> Option<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn put(&self, key: &CacheKey, writer: &mut dyn Writer) -> Result<(), FetchError> {
        let mut buf = Vec::new();
        writer.write(&mut buf)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock()
            .unwrap()
            .insert(key.clone(), Bytes::from(buf));
        Ok(())
    }

    fn delete(&self, key: &CacheKey) {
        self.entries.lock().unwrap().remove(key);
    }

    fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}
