use std::collections::BTreeMap;
use std::sync::Arc;

use loadcache_service::caching::{CacheKey, FetchError};
use loadcache_service::engine::LoadRequest;
use loadcache_service::pipeline::{DataSource, DiskCacheStrategy, EncodeStrategy};

use crate::{TestDecoder, TestFetcher, TestLoader, setup_engine, uncached_request};

fn resource_key(source_key: &str, width: u32, height: u32) -> CacheKey {
    let empty = BTreeMap::new();
    CacheKey::resource_cache(source_key, "", width, height, &empty, "", &empty)
}

#[tokio::test]
async fn test_remote_data_is_persisted_before_delivery() {
    let fetcher = Arc::new(TestFetcher::new(b"cat"));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    let (_, callback) = engine.load(LoadRequest::new("cat.png"));
    let (resource, data_source) = callback.resource().await;
    assert_eq!(data_source, DataSource::Remote);
    assert!(engine.disk_cache.contains(&CacheKey::data_cache("cat.png", "")));
    assert_eq!(engine.disk_cache.writes(), 1);
    // decoded from the copy read back from the disk cache
    assert_eq!(engine.decoded(), [DataSource::Remote]);
    assert_eq!(fetcher.cleanups(), 1);

    engine.engine.release(resource);
    engine.engine.clear_memory();

    let (_, callback) = engine.load(LoadRequest::new("cat.png"));
    let (resource, data_source) = callback.resource().await;
    assert_eq!(data_source, DataSource::DataDiskCache);
    assert_eq!(resource.get().data, "cat");
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_fallback_to_next_source() {
    let missing = Arc::new(TestFetcher::failing(FetchError::NotFound));
    let fallback = Arc::new(TestFetcher::new(b"cat"));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![
            TestLoader::new(missing.clone()).key_prefix("primary/"),
            TestLoader::new(fallback.clone()).key_prefix("fallback/"),
        ],
        |_| {},
    );

    let (_, callback) = engine.load(uncached_request("cat.png"));
    let (resource, _) = callback.resource().await;
    assert_eq!(resource.get().data, "cat");
    assert_eq!(missing.calls(), 1);
    assert_eq!(missing.cleanups(), 1);
    assert_eq!(fallback.calls(), 1);
}

#[tokio::test]
async fn test_all_sources_failing() {
    let missing = Arc::new(TestFetcher::failing(FetchError::NotFound));
    let denied = Arc::new(TestFetcher::failing(FetchError::PermissionDenied(
        "403".into(),
    )));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![
            TestLoader::new(missing.clone()).key_prefix("primary/"),
            TestLoader::new(denied.clone()).key_prefix("fallback/"),
        ],
        |_| {},
    );

    let (_, callback) = engine.load(uncached_request("cat.png"));
    let error = callback.error().await;

    let failed_keys: Vec<_> = error
        .failures()
        .iter()
        .map(|failure| failure.source_key.as_deref().unwrap())
        .collect();
    assert_eq!(failed_keys, ["primary/cat.png", "fallback/cat.png"]);
    assert_eq!(
        error.last_error(),
        Some(&FetchError::PermissionDenied("403".into()))
    );
}

#[tokio::test]
async fn test_no_model_loader() {
    let engine = setup_engine(TestDecoder::new(), vec![], |_| {});

    let (_, callback) = engine.load(LoadRequest::new("cat.png"));
    let error = callback.error().await;
    assert!(matches!(
        error.last_error(),
        Some(FetchError::Unsupported(_))
    ));
}

#[tokio::test]
async fn test_only_retrieve_from_cache() {
    let fetcher = Arc::new(TestFetcher::new(b"cat"));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    let only_cache = LoadRequest::new("cat.png").only_retrieve_from_cache(true);
    let (_, callback) = engine.load(only_cache.clone());
    let error = callback.error().await;
    assert!(error.failures().is_empty());
    assert_eq!(fetcher.calls(), 0);

    let (_, callback) = engine.load(LoadRequest::new("cat.png"));
    let (resource, _) = callback.resource().await;
    engine.engine.release(resource);
    engine.engine.clear_memory();

    let (_, callback) = engine.load(only_cache);
    let (_, data_source) = callback.resource().await;
    assert_eq!(data_source, DataSource::DataDiskCache);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_transformed_resource_is_cached() {
    let fetcher = Arc::new(TestFetcher::new(b"cat").data_source(DataSource::Local));
    let engine = setup_engine(
        TestDecoder::new().encode_strategy(EncodeStrategy::Transformed),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    let request = LoadRequest::new("cat.png").size(10, 20);
    let (_, callback) = engine.load(request.clone());
    let (resource, data_source) = callback.resource().await;
    assert_eq!(data_source, DataSource::Local);

    // local data itself is never written
    assert!(engine.disk_cache.contains(&resource_key("cat.png", 10, 20)));
    assert!(!engine.disk_cache.contains(&CacheKey::data_cache("cat.png", "")));

    engine.engine.release(resource);
    engine.engine.clear_memory();

    let (_, callback) = engine.load(request);
    let (_, data_source) = callback.resource().await;
    assert_eq!(data_source, DataSource::ResourceDiskCache);
    assert_eq!(
        engine.decoded(),
        [DataSource::Local, DataSource::ResourceDiskCache]
    );
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_alternate_key_hit_is_written_as_resource() {
    let fetcher = Arc::new(TestFetcher::new(b"fresh"));
    let engine = setup_engine(
        TestDecoder::new().encode_strategy(EncodeStrategy::Transformed),
        vec![TestLoader::new(fetcher.clone()).alternate_keys(&["legacy/cat.png"])],
        |_| {},
    );
    engine
        .disk_cache
        .insert(CacheKey::data_cache("legacy/cat.png", ""), b"stale");

    let (_, callback) = engine.load(LoadRequest::new("cat.png"));
    let (resource, data_source) = callback.resource().await;
    assert_eq!(data_source, DataSource::DataDiskCache);
    assert_eq!(resource.get().data, "stale");
    assert_eq!(fetcher.calls(), 0);

    assert!(engine.disk_cache.contains(&resource_key("legacy/cat.png", 0, 0)));
}

#[tokio::test]
async fn test_source_key_of_later_loader_is_not_alternate() {
    let first = Arc::new(TestFetcher::new(b"first"));
    let second = Arc::new(TestFetcher::new(b"second"));
    let engine = setup_engine(
        TestDecoder::new().encode_strategy(EncodeStrategy::Transformed),
        vec![
            TestLoader::new(first.clone()).key_prefix("a/"),
            TestLoader::new(second.clone()).key_prefix("b/"),
        ],
        |_| {},
    );
    engine
        .disk_cache
        .insert(CacheKey::data_cache("b/cat.png", ""), b"cached");

    let (_, callback) = engine.load(LoadRequest::new("cat.png"));
    let (resource, data_source) = callback.resource().await;
    assert_eq!(data_source, DataSource::DataDiskCache);
    assert_eq!(resource.get().data, "cached");
    assert_eq!(first.calls() + second.calls(), 0);

    // data found under a source key is already cached as well as it gets
    assert!(!engine.disk_cache.contains(&resource_key("b/cat.png", 0, 0)));
    assert_eq!(engine.disk_cache.len(), 1);
}

#[tokio::test]
async fn test_strategy_none_writes_nothing() {
    let fetcher = Arc::new(TestFetcher::new(b"cat"));
    let engine = setup_engine(
        TestDecoder::new().encode_strategy(EncodeStrategy::Transformed),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    let (_, callback) = engine.load(uncached_request("cat.png"));
    callback.resource().await;
    assert!(engine.disk_cache.is_empty());
    assert_eq!(engine.disk_cache.reads(), 0);
}

#[tokio::test]
async fn test_strategy_resource_skips_data() {
    let fetcher = Arc::new(TestFetcher::new(b"cat"));
    let engine = setup_engine(
        TestDecoder::new().encode_strategy(EncodeStrategy::Transformed),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    let request = LoadRequest::new("cat.png").disk_cache_strategy(DiskCacheStrategy::Resource);
    let (_, callback) = engine.load(request);
    let (_, data_source) = callback.resource().await;
    assert_eq!(data_source, DataSource::Remote);

    assert_eq!(engine.disk_cache.len(), 1);
    assert!(engine.disk_cache.contains(&resource_key("cat.png", 0, 0)));
}

#[tokio::test]
async fn test_decoder_rejecting_data_class() {
    let fetcher = Arc::new(TestFetcher::new(b"cat").data_class("video"));
    let engine = setup_engine(
        TestDecoder::new().only_class("image"),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    // the data is neither cacheable nor decodable, so the source is skipped
    let (_, callback) = engine.load(uncached_request("cat.png"));
    let error = callback.error().await;
    assert!(error.failures().is_empty());
    assert_eq!(fetcher.calls(), 0);
}
