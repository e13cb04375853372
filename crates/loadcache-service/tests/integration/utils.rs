use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use loadcache_service::config::Config;
use loadcache_service::engine::{DirectExecutor, Engine, LoadRequest, LoadStatus};
use loadcache_service::pipeline::{DataSource, DiskCacheStrategy};
use loadcache_test as test;

pub use test::{MemoryDiskCache, RecordingCallback, TestDecoder, TestFetcher, TestLoader, TestResource};

/// An engine under test, together with handles to inspect its collaborators.
pub struct TestEngine {
    pub engine: Engine<TestResource>,
    pub disk_cache: Arc<MemoryDiskCache>,
    recycled: Arc<AtomicUsize>,
    decoded: Arc<Mutex<Vec<DataSource>>>,
}

impl TestEngine {
    /// Loads `request`, delivering the result inline on the pipeline's thread.
    pub fn load(
        &self,
        request: LoadRequest,
    ) -> (Option<LoadStatus<TestResource>>, Arc<RecordingCallback>) {
        let callback = RecordingCallback::new();
        let status = self
            .engine
            .load(request, callback.clone(), Arc::new(DirectExecutor));
        (status, callback)
    }

    /// How many decoded resources have been recycled.
    pub fn recycled(&self) -> usize {
        self.recycled.load(Ordering::SeqCst)
    }

    /// The sources the decoder has been given data from, in order.
    pub fn decoded(&self) -> Vec<DataSource> {
        self.decoded.lock().unwrap().clone()
    }
}

/// Setup tests and create an engine running on the current runtime.
///
/// The engine persists into an in-memory disk cache. The `update_config` closure can modify the
/// default configuration before the engine is built.
pub fn setup_engine(
    decoder: TestDecoder,
    loaders: Vec<TestLoader>,
    update_config: impl FnOnce(&mut Config),
) -> TestEngine {
    test::setup();

    let mut config = Config::default();
    update_config(&mut config);

    let disk_cache = MemoryDiskCache::new();
    let recycled = decoder.recycled();
    let decoded = decoder.decoded();

    let mut builder = Engine::builder(&config, decoder)
        .disk_cache_factory(disk_cache.factory())
        .executors(test::executors());
    for loader in loaders {
        builder = builder.model_loader(loader);
    }

    TestEngine {
        engine: builder.build().unwrap(),
        disk_cache,
        recycled,
        decoded,
    }
}

/// A request for `model` that neither reads from nor writes to the disk cache.
pub fn uncached_request(model: &str) -> LoadRequest {
    LoadRequest::new(model).disk_cache_strategy(DiskCacheStrategy::None)
}
