use std::sync::{Arc, Barrier};
use std::time::Duration;

use loadcache_service::caching::FetchError;
use loadcache_service::engine::{LoadRequest, Residency, TrimLevel};
use loadcache_service::pipeline::DataSource;
use tokio::sync::Notify;

use crate::{TestDecoder, TestFetcher, TestLoader, setup_engine, uncached_request};

const THIRTY_BYTES: &[u8] = b"012345678901234567890123456789";

#[tokio::test]
async fn test_concurrent_loads_share_a_job() {
    let gate = Arc::new(Notify::new());
    let fetcher = Arc::new(TestFetcher::new(b"cat").gated(gate.clone()));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    let (first_status, first) = engine.load(uncached_request("cat.png"));
    let (second_status, second) = engine.load(uncached_request("cat.png"));
    assert!(first_status.is_some());
    assert!(second_status.is_some());
    assert_eq!(engine.engine.stats().jobs, 1);

    gate.notify_one();
    let (first, first_source) = first.resource().await;
    let (second, second_source) = second.resource().await;

    assert_eq!(fetcher.calls(), 1);
    assert!(first.ptr_eq(&second));
    assert_eq!(first.get().data, "cat");
    assert_eq!(first_source, DataSource::Remote);
    assert_eq!(second_source, DataSource::Remote);
    assert_eq!(first.acquired(), 2);

    assert_eq!(
        engine.engine.residency(&uncached_request("cat.png")),
        Residency {
            active: true,
            cached: false,
            running: false,
        }
    );
}

#[tokio::test]
async fn test_released_resource_is_reused_from_memory() {
    let fetcher = Arc::new(TestFetcher::new(b"cat"));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    let (_, callback) = engine.load(uncached_request("cat.png"));
    let (resource, _) = callback.resource().await;
    engine.engine.release(resource.clone());

    let stats = engine.engine.stats();
    assert_eq!((stats.active, stats.cached, stats.cache_size), (0, 1, 3));

    // served synchronously, without a job
    let (status, callback) = engine.load(uncached_request("cat.png"));
    assert!(status.is_none());
    let (again, data_source) = callback.resource().await;
    assert_eq!(data_source, DataSource::MemoryCache);
    assert!(again.ptr_eq(&resource));
    assert_eq!(fetcher.calls(), 1);

    let stats = engine.engine.stats();
    assert_eq!((stats.active, stats.cached), (1, 0));

    engine.engine.release(again);
    engine.engine.clear_memory();
    assert_eq!(engine.recycled(), 1);
    assert!(resource.is_recycled());
}

#[tokio::test]
async fn test_skip_memory_cache() {
    let fetcher = Arc::new(TestFetcher::new(b"cat"));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    let request = uncached_request("cat.png").skip_memory_cache(true);
    let (_, callback) = engine.load(request.clone());
    let (resource, _) = callback.resource().await;
    engine.engine.release(resource);
    assert_eq!(engine.recycled(), 1);
    assert_eq!(engine.engine.stats().cached, 0);

    let (status, callback) = engine.load(request);
    assert!(status.is_some());
    callback.resource().await;
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_cancelled_load_is_never_notified() {
    let fetcher = Arc::new(TestFetcher::new(b"cat"));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    let (status, cancelled) = engine.load(uncached_request("cat.png"));
    status.unwrap().cancel();
    assert_eq!(engine.engine.stats().jobs, 0);

    // the cancelled job is gone, so this starts a fresh one
    let (status, callback) = engine.load(uncached_request("cat.png"));
    assert!(status.is_some());
    assert!(engine.engine.residency(&uncached_request("cat.png")).running);

    let (resource, _) = callback.resource().await;
    assert_eq!(resource.get().data, "cat");
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(cancelled.received(), 0);
    // the cancelled job stops before it reaches the fetcher
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_cancel_one_of_two_loads() {
    let fetcher = Arc::new(TestFetcher::new(b"cat").delay(Duration::from_millis(20)));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    let (first_status, first) = engine.load(uncached_request("cat.png"));
    let (_, second) = engine.load(uncached_request("cat.png"));
    engine.engine.cancel(&first_status.unwrap());
    assert_eq!(engine.engine.stats().jobs, 1);

    let (resource, _) = second.resource().await;
    assert_eq!(resource.acquired(), 1);
    assert_eq!(first.received(), 0);
    assert_eq!(fetcher.cancels(), 0);
}

#[tokio::test]
async fn test_cancel_aborts_running_fetch() {
    let gate = Arc::new(Notify::new());
    let fetcher = Arc::new(TestFetcher::new(b"cat").gated(gate));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    let (status, callback) = engine.load(uncached_request("cat.png"));
    // let the pipeline reach the fetcher
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fetcher.calls(), 1);

    status.unwrap().cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(fetcher.cancels(), 1);
    assert_eq!(fetcher.cleanups(), 1);
    assert_eq!(callback.received(), 0);
    assert_eq!(engine.engine.stats().jobs, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_loads_from_many_threads_share_one_pipeline() {
    let fetcher = Arc::new(TestFetcher::new(b"cat").delay(Duration::from_millis(50)));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );
    let handle = tokio::runtime::Handle::current();
    let barrier = Barrier::new(8);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                barrier.wait();
                let (_, callback) = engine.load(uncached_request("cat.png"));
                let (resource, _) = handle.block_on(callback.resource());
                assert_eq!(resource.get().data, "cat");
                engine.engine.release(resource);
            });
        }
    });
    // the job gives up its own reference after the last delivery
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(fetcher.calls(), 1);
    let stats = engine.engine.stats();
    assert_eq!((stats.jobs, stats.active, stats.cached), (0, 0, 1));
    assert_eq!(engine.recycled(), 0);
}

#[tokio::test]
async fn test_shutdown_fails_running_jobs() {
    let gate = Arc::new(Notify::new());
    let fetcher = Arc::new(TestFetcher::new(b"cat").gated(gate));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    let (status, first) = engine.load(uncached_request("cat.png"));
    assert!(status.is_some());
    tokio::time::sleep(Duration::from_millis(10)).await;

    engine.engine.shutdown();
    let error = first.error().await;
    assert_eq!(error.last_error(), Some(&FetchError::Cancelled));
    assert_eq!(engine.engine.stats().jobs, 0);

    // later loads neither attach to the old job nor start a new one
    let (status, second) = engine.load(uncached_request("cat.png"));
    assert!(status.is_none());
    let error = second.error().await;
    assert_eq!(error.last_error(), Some(&FetchError::Cancelled));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(fetcher.cancels(), 1);
    assert_eq!(first.received(), 1);
}

#[tokio::test]
async fn test_failed_load_leaves_no_trace() {
    let fetcher = Arc::new(TestFetcher::failing(FetchError::NotFound));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    let (_, callback) = engine.load(uncached_request("cat.png"));
    let error = callback.error().await;
    assert_eq!(error.last_error(), Some(&FetchError::NotFound));
    assert_eq!(error.failures()[0].source_key.as_deref(), Some("cat.png"));
    assert_eq!(fetcher.cleanups(), 1);

    assert_eq!(
        engine.engine.residency(&uncached_request("cat.png")),
        Residency::default()
    );

    // failures are not remembered
    let (_, callback) = engine.load(uncached_request("cat.png"));
    callback.error().await;
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_undecodable_data_fails() {
    let fetcher = Arc::new(TestFetcher::new(b"corrupt"));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    let (_, callback) = engine.load(uncached_request("cat.png"));
    let error = callback.error().await;
    assert!(matches!(error.last_error(), Some(FetchError::Malformed(_))));
    assert_eq!(error.failures()[0].data_source, Some(DataSource::Remote));
    assert_eq!(fetcher.cleanups(), 1);
}

#[tokio::test]
async fn test_trim_memory() {
    let fetcher = Arc::new(TestFetcher::new(THIRTY_BYTES));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![TestLoader::new(fetcher.clone())],
        |config| config.memory_cache.max_size = 100,
    );

    for model in ["a", "b", "c"] {
        let (_, callback) = engine.load(uncached_request(model));
        let (resource, _) = callback.resource().await;
        engine.engine.release(resource);
    }
    assert_eq!(engine.engine.stats().cache_size, 90);

    engine.engine.trim_memory(TrimLevel::RunningModerate);
    assert_eq!(engine.engine.stats().cache_size, 90);

    engine.engine.trim_memory(TrimLevel::UiHidden);
    let stats = engine.engine.stats();
    assert_eq!((stats.cached, stats.cache_size), (1, 30));
    assert_eq!(engine.recycled(), 2);
    assert!(engine.engine.residency(&uncached_request("c")).cached);

    engine.engine.trim_memory(TrimLevel::Complete);
    assert_eq!(engine.engine.stats().cached, 0);
    assert_eq!(engine.recycled(), 3);
}

#[tokio::test]
async fn test_memory_size_multiplier_evicts() {
    let fetcher = Arc::new(TestFetcher::new(THIRTY_BYTES));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![TestLoader::new(fetcher.clone())],
        |config| config.memory_cache.max_size = 100,
    );

    for model in ["a", "b"] {
        let (_, callback) = engine.load(uncached_request(model));
        let (resource, _) = callback.resource().await;
        engine.engine.release(resource);
    }

    engine.engine.set_memory_size_multiplier(0.5);
    let stats = engine.engine.stats();
    assert_eq!((stats.cached, stats.cache_size), (1, 30));
    assert!(engine.engine.residency(&uncached_request("b")).cached);
}

#[tokio::test]
async fn test_distinct_requests_do_not_share() {
    let fetcher = Arc::new(TestFetcher::new(b"cat"));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    let small = uncached_request("cat.png").size(10, 10);
    let large = uncached_request("cat.png").size(100, 100);
    let (_, first) = engine.load(small);
    let (_, second) = engine.load(large);

    let (first, _) = first.resource().await;
    let (second, _) = second.resource().await;
    assert!(!first.ptr_eq(&second));
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_cache_only_loads_use_separate_jobs() {
    let fetcher = Arc::new(TestFetcher::new(b"cat"));
    let engine = setup_engine(
        TestDecoder::new(),
        vec![TestLoader::new(fetcher.clone())],
        |_| {},
    );

    let request = LoadRequest::new("cat.png");
    let (_, regular) = engine.load(request.clone());
    let (_, only_cache) = engine.load(request.only_retrieve_from_cache(true));
    assert_eq!(engine.engine.stats().jobs, 2);

    regular.resource().await;
    // depending on which job reads the disk cache first, this either misses or hits
    only_cache.wait().await.ok();
    assert_eq!(fetcher.calls(), 1);
}
