use std::sync::Arc;

use loadcache_service::config::Config;
use loadcache_service::engine::{DirectExecutor, Engine, LoadRequest};
use loadcache_service::pipeline::{DataSource, DiskCacheStrategy};
use loadcache_test as test;

use crate::{RecordingCallback, TestDecoder, TestFetcher, TestLoader, TestResource};

fn fs_engine(config: &Config, fetcher: &Arc<TestFetcher>) -> Engine<TestResource> {
    Engine::builder(config, TestDecoder::new())
        .model_loader(TestLoader::new(fetcher.clone()))
        .executors(test::executors())
        .build()
        .unwrap()
}

async fn load(engine: &Engine<TestResource>, request: LoadRequest) -> DataSource {
    let callback = RecordingCallback::new();
    engine.load(request, callback.clone(), Arc::new(DirectExecutor));
    let (resource, data_source) = callback.resource().await;
    engine.release(resource);
    data_source
}

#[tokio::test]
async fn test_fs_cache_survives_restart() {
    test::setup();
    let cache_dir = test::tempdir();
    let config = test::config_with_cache(&cache_dir);
    let fetcher = Arc::new(TestFetcher::new(b"cat"));
    let request = LoadRequest::new("cat.png").disk_cache_strategy(DiskCacheStrategy::Data);

    let engine = fs_engine(&config, &fetcher);
    assert_eq!(load(&engine, request.clone()).await, DataSource::Remote);
    engine.shutdown();
    drop(engine);

    let engine = fs_engine(&config, &fetcher);
    assert_eq!(load(&engine, request).await, DataSource::DataDiskCache);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_clear_disk_cache() {
    test::setup();
    let cache_dir = test::tempdir();
    let config = test::config_with_cache(&cache_dir);
    let fetcher = Arc::new(TestFetcher::new(b"cat"));
    let request = LoadRequest::new("cat.png").skip_memory_cache(true);

    let engine = fs_engine(&config, &fetcher);
    assert_eq!(load(&engine, request.clone()).await, DataSource::Remote);
    assert_eq!(load(&engine, request.clone()).await, DataSource::DataDiskCache);

    engine.clear_disk_cache();
    assert_eq!(load(&engine, request).await, DataSource::Remote);
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_without_cache_dir_nothing_is_persisted() {
    test::setup();
    let fetcher = Arc::new(TestFetcher::new(b"cat"));
    let request = LoadRequest::new("cat.png").skip_memory_cache(true);

    let engine = fs_engine(&Config::default(), &fetcher);
    assert_eq!(load(&engine, request.clone()).await, DataSource::Remote);
    assert_eq!(load(&engine, request).await, DataSource::Remote);
    assert_eq!(fetcher.calls(), 2);
}
