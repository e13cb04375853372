use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use crate::config::PoolsConfig;
use crate::utils::lock;

/// The pools pipelines run on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Reads from the disk caches.
    DiskCache,
    /// Fetches from sources, with a limited number of concurrent runs.
    Source,
    /// Fetches from sources without a concurrency limit.
    UnlimitedSource,
    /// Fetches and decodes animated resources.
    Animation,
}

impl PoolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::DiskCache => "disk-cache",
            PoolKind::Source => "source",
            PoolKind::UnlimitedSource => "unlimited-source",
            PoolKind::Animation => "animation",
        }
    }
}

#[derive(Clone, Debug)]
struct PoolHandle {
    handle: Handle,
    permits: Option<Arc<Semaphore>>,
}

impl PoolHandle {
    fn new(handle: Handle, concurrency: Option<usize>) -> Self {
        Self {
            handle,
            permits: concurrency.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }
}

/// Cheaply cloneable access to the pools, held by every job.
#[derive(Clone, Debug)]
pub struct ExecutorHandles {
    disk_cache: PoolHandle,
    source: PoolHandle,
    unlimited_source: PoolHandle,
    animation: PoolHandle,
    tracker: TaskTracker,
}

impl ExecutorHandles {
    fn new(handles: [Handle; 4], config: &PoolsConfig) -> Self {
        let [disk_cache, source, unlimited_source, animation] = handles;
        Self {
            disk_cache: PoolHandle::new(disk_cache, Some(config.disk_cache_threads)),
            source: PoolHandle::new(source, Some(config.source_concurrency)),
            unlimited_source: PoolHandle::new(unlimited_source, None),
            animation: PoolHandle::new(animation, Some(config.animation_concurrency)),
            tracker: TaskTracker::new(),
        }
    }

    /// Runs `future` on the pool of the given kind.
    ///
    /// On bounded pools, the future only starts running once a permit is available. Futures
    /// still waiting for a permit once [`Executors::shutdown`] gave up draining never run.
    pub fn spawn<F>(&self, kind: PoolKind, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let pool = self.pool(kind);
        let permits = pool.permits.clone();
        self.tracker.spawn_on(
            async move {
                let _permit = match permits {
                    Some(permits) => match permits.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    },
                    None => None,
                };
                future.await
            },
            &pool.handle,
        );
    }

    fn pool(&self, kind: PoolKind) -> &PoolHandle {
        match kind {
            PoolKind::DiskCache => &self.disk_cache,
            PoolKind::Source => &self.source,
            PoolKind::UnlimitedSource => &self.unlimited_source,
            PoolKind::Animation => &self.animation,
        }
    }

    fn close(&self) {
        for kind in [
            PoolKind::DiskCache,
            PoolKind::Source,
            PoolKind::UnlimitedSource,
            PoolKind::Animation,
        ] {
            if let Some(permits) = &self.pool(kind).permits {
                permits.close();
            }
        }
    }
}

/// How long [`Executors::shutdown`] waits for running pipelines.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the runtimes backing the pools.
pub struct Executors {
    handles: ExecutorHandles,
    runtimes: Mutex<Vec<Runtime>>,
}

impl Executors {
    /// Starts one multi-threaded runtime per pool.
    pub fn new(config: &PoolsConfig) -> io::Result<Self> {
        let build = |name: &str, threads: usize| {
            Builder::new_multi_thread()
                .thread_name(format!("loadcache-{name}"))
                .worker_threads(threads.max(1))
                .enable_all()
                .build()
        };

        let runtimes = vec![
            build(PoolKind::DiskCache.as_str(), config.disk_cache_threads)?,
            build(PoolKind::Source.as_str(), config.source_threads)?,
            build(
                PoolKind::UnlimitedSource.as_str(),
                config.unlimited_source_threads,
            )?,
            build(PoolKind::Animation.as_str(), config.animation_threads)?,
        ];
        let handles = [
            runtimes[0].handle().clone(),
            runtimes[1].handle().clone(),
            runtimes[2].handle().clone(),
            runtimes[3].handle().clone(),
        ];

        Ok(Self {
            handles: ExecutorHandles::new(handles, config),
            runtimes: Mutex::new(runtimes),
        })
    }

    /// Runs every pool on an existing runtime.
    ///
    /// The concurrency limits of the bounded pools still apply.
    pub fn with_handle(handle: Handle, config: &PoolsConfig) -> Self {
        let handles = [handle.clone(), handle.clone(), handle.clone(), handle];
        Self {
            handles: ExecutorHandles::new(handles, config),
            runtimes: Mutex::new(Vec::new()),
        }
    }

    pub fn handles(&self) -> &ExecutorHandles {
        &self.handles
    }

    pub fn spawn<F>(&self, kind: PoolKind, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.spawn(kind, future)
    }

    /// Drains and stops all pools.
    ///
    /// Waits up to [`DRAIN_TIMEOUT`] for every spawned pipeline to finish, including the ones
    /// queued for a permit and the ones they reschedule. Whatever is left afterwards is dropped
    /// at its next suspension point.
    ///
    /// Executors running on a borrowed runtime ([`with_handle`](Self::with_handle)) cannot be
    /// waited on, their queued pipelines are dropped right away.
    pub fn shutdown(&self) {
        let tracker = self.handles.tracker.clone();
        tracker.close();
        let runtimes = std::mem::take(&mut *lock(&self.runtimes));
        if runtimes.is_empty() {
            self.handles.close();
            return;
        }

        tracing::debug!(pipelines = tracker.len(), "Draining executors");
        let handles = self.handles.clone();
        let drain = move || {
            let drained = runtimes[0]
                .block_on(async { tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait()).await });
            if drained.is_err() {
                tracing::warn!(
                    pipelines = tracker.len(),
                    "Executors not drained in time, dropping remaining pipelines"
                );
            }
            handles.close();
            for runtime in runtimes {
                runtime.shutdown_timeout(DRAIN_TIMEOUT);
            }
        };

        // a runtime cannot be blocked on from within another one
        if Handle::try_current().is_ok() {
            if std::thread::spawn(drain).join().is_err() {
                tracing::error!("Failed to drain executors");
            }
        } else {
            drain();
        }
    }
}

impl Drop for Executors {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Executors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executors")
            .field("runtimes", &lock(&self.runtimes).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_runs_on_named_pools() {
        let executors = Executors::new(&PoolsConfig::default()).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();

        for kind in [PoolKind::DiskCache, PoolKind::Animation] {
            let tx = tx.clone();
            executors.spawn(kind, async move {
                let name = std::thread::current().name().map(str::to_owned);
                tx.send(name).unwrap();
            });
        }

        let mut names: Vec<_> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, ["loadcache-animation", "loadcache-disk-cache"]);
        executors.shutdown();
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let config = PoolsConfig {
            source_concurrency: 2,
            ..PoolsConfig::default()
        };
        let executors = Executors::with_handle(Handle::current(), &config);
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for _ in 0..6 {
            let running = running.clone();
            let max_running = max_running.clone();
            let tx = tx.clone();
            executors.spawn(PoolKind::Source, async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            });
        }
        for _ in 0..6 {
            rx.recv().await.unwrap();
        }
        assert_eq!(max_running.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_shutdown_drains_running_pipelines() {
        let config = PoolsConfig {
            source_concurrency: 1,
            ..PoolsConfig::default()
        };
        let executors = Executors::new(&config).unwrap();
        let finished = Arc::new(AtomicUsize::new(0));

        // the second one waits for the permit of the first
        for _ in 0..2 {
            let finished = finished.clone();
            executors.spawn(PoolKind::Source, async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }
        executors.shutdown();

        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_bounded_pools() {
        let executors = Executors::with_handle(Handle::current(), &PoolsConfig::default());
        executors.shutdown();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        executors.spawn(PoolKind::Source, async move {
            tx.send(()).ok();
        });
        // the sender is dropped without sending
        assert!(rx.await.is_err());
    }
}
