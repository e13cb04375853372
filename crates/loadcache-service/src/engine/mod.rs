//! # The engine
//!
//! [`Engine::load`] resolves a [`LoadRequest`] from the cheapest tier that has it:
//!
//! 1. the **active resources**, resources currently acquired by some consumer,
//! 2. the **memory cache**, an [`LruResourceCache`] of released resources,
//! 3. a **running job** for the same [`EngineKey`], which the request is attached to,
//! 4. otherwise a new [`DecodeJob`](crate::pipeline::DecodeJob) is started.
//!
//! All of this happens under a single lock, so that concurrent requests for the same key never
//! start more than one job. A key is held by at most one of the tiers at any time: resources
//! move from a job into the active resources, into the memory cache when their last consumer
//! releases them, and back into the active resources on a cache hit.
//!
//! Consumers receive resources [acquired](EngineResource::acquire) on their behalf and have to
//! [`release`](Engine::release) them. Resources that are evicted from the memory cache, or
//! that cannot be cached, are [recycled](Resource::recycle).

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, Weak};

mod active;
mod callback;
mod error;
mod executors;
mod job;
mod jobs;
mod key;
mod memory;
mod request;
mod resource;

pub use callback::{CallbackExecutor, CallbackId, DirectExecutor, ResourceCallback};
pub use error::{FetchFailure, LoadError, ResourceError};
pub use executors::{DRAIN_TIMEOUT, ExecutorHandles, Executors, PoolKind};
pub use key::EngineKey;
pub use memory::{LruResourceCache, TrimLevel};
pub use request::{LoadRequest, Model, Options, Priority};
pub use resource::{EngineResource, ReclaimedResource, Resource, ResourceHooks, ResourceListener};

use active::ActiveResources;
use job::{EngineJob, EngineJobListener, JobFlags, JobPools};
use jobs::Jobs;

use crate::caching::{DiskCache, DiskCacheFactory, FetchError, FsDiskCache, LazyDiskCache};
use crate::config::Config;
use crate::pipeline::{
    DataSource, Encoder, ModelLoader, ModelLoaderRegistry, PipelineComponents, ResourceDecoder,
};
use crate::utils::lock;

/// Collects resources to recycle while the engine's lock is held.
struct ResourceRecycler<R: Resource> {
    resources: Arc<Mutex<Vec<EngineResource<R>>>>,
}

impl<R: Resource> ResourceRecycler<R> {
    fn new() -> Self {
        Self {
            resources: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push(&self, resource: EngineResource<R>) {
        lock(&self.resources).push(resource);
    }

    /// Recycles everything collected so far. Must not be called while holding the engine's lock.
    fn flush(&self) {
        let resources = std::mem::take(&mut *lock(&self.resources));
        for resource in resources {
            if let Err(error) = resource.recycle() {
                tracing::error!(
                    key = %resource.key(),
                    error = &error as &dyn std::error::Error,
                    "Failed to recycle resource"
                );
            }
        }
    }
}

impl<R: Resource> Clone for ResourceRecycler<R> {
    fn clone(&self) -> Self {
        Self {
            resources: Arc::clone(&self.resources),
        }
    }
}

struct EngineState<R: Resource> {
    active: ActiveResources<R>,
    cache: LruResourceCache<R>,
    jobs: Jobs<R>,
    shut_down: bool,
}

struct EngineInner<R: Resource> {
    state: Mutex<EngineState<R>>,
    recycler: ResourceRecycler<R>,
    executors: Executors,
    components: Arc<PipelineComponents<R>>,
    pools: Arc<JobPools<R>>,
    hooks: ResourceHooks<R>,
    job_listener: Weak<dyn EngineJobListener<R>>,
}

impl<R: Resource> EngineInner<R> {
    /// Runs `f` under the engine's lock.
    ///
    /// Reclaimed resources are processed before `f`, and collected resources are recycled after
    /// the lock has been released.
    fn with_state<T>(&self, f: impl FnOnce(&mut EngineState<R>) -> T) -> T {
        let result = {
            let mut state = lock(&self.state);
            for reclaimed in state.active.drain_reclaimed() {
                let resource = EngineResource::from_shared(
                    reclaimed.key,
                    reclaimed.payload,
                    true,
                    false,
                    self.hooks.clone(),
                );
                state.cache.put(resource);
            }
            f(&mut state)
        };
        self.recycler.flush();
        result
    }

    fn cancel(&self, job: &Arc<EngineJob<R>>, callback_id: CallbackId) {
        let cancelled = self.with_state(|state| {
            let cancelled = job.remove_callback(callback_id);
            if cancelled {
                state.jobs.remove_if_current(job.key(), job);
            }
            cancelled
        });

        if cancelled {
            metric!(counter("engine.jobs.cancelled") += 1);
            job.cancel_handle().cancel();
        }
    }
}

impl<R: Resource> EngineJobListener<R> for EngineInner<R> {
    fn on_engine_job_complete(
        &self,
        job: &Arc<EngineJob<R>>,
        key: &EngineKey,
        resource: Option<&EngineResource<R>>,
    ) {
        self.with_state(|state| {
            if let Some(resource) = resource {
                if resource.is_memory_cacheable() {
                    state.active.activate(resource);
                }
            }
            state.jobs.remove_if_current(key, job);
        });
    }
}

impl<R: Resource> ResourceListener<R> for EngineInner<R> {
    fn on_resource_released(&self, resource: &EngineResource<R>) {
        self.with_state(|state| {
            // reacquired before the engine noticed the release
            if resource.is_acquired() || resource.is_recycled() {
                return;
            }
            let was_active = state.active.deactivate_if_current(resource);
            if resource.is_memory_cacheable() && was_active {
                tracing::trace!(key = %resource.key(), "Moving released resource to memory cache");
                state.cache.put(resource.clone());
            } else if !state.cache.contains_resource(resource) {
                self.recycler.push(resource.clone());
            }
        });
    }
}

/// How many entries each tier of an engine holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub active: usize,
    pub cached: usize,
    pub cache_size: u64,
    pub jobs: usize,
}

/// Which tiers hold a key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Residency {
    pub active: bool,
    pub cached: bool,
    pub running: bool,
}

/// Tracks a load that is served by a job.
///
/// Dropping this does not cancel the load.
pub struct LoadStatus<R: Resource> {
    engine: Weak<EngineInner<R>>,
    job: Weak<EngineJob<R>>,
    callback_id: CallbackId,
}

impl<R: Resource> LoadStatus<R> {
    /// Removes the callback of this load.
    ///
    /// Its callback is not invoked anymore, unless that already happened. The job is
    /// cancelled once none of its callbacks are left.
    pub fn cancel(&self) {
        let (Some(engine), Some(job)) = (self.engine.upgrade(), self.job.upgrade()) else {
            return;
        };
        engine.cancel(&job, self.callback_id);
    }

    pub fn callback_id(&self) -> CallbackId {
        self.callback_id
    }
}

impl<R: Resource> fmt::Debug for LoadStatus<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadStatus")
            .field("callback_id", &self.callback_id)
            .finish()
    }
}

/// Builds an [`Engine`].
pub struct EngineBuilder<R: Resource> {
    config: Config,
    loaders: ModelLoaderRegistry,
    decoder: Arc<dyn ResourceDecoder<R>>,
    encoder: Option<Arc<dyn Encoder>>,
    disk_cache: Option<LazyDiskCache>,
    executors: Option<Executors>,
}

impl<R: Resource> EngineBuilder<R> {
    pub fn new(config: &Config, decoder: impl ResourceDecoder<R> + 'static) -> Self {
        Self {
            config: config.clone(),
            loaders: ModelLoaderRegistry::new(),
            decoder: Arc::new(decoder),
            encoder: None,
            disk_cache: None,
            executors: None,
        }
    }

    /// Registers a model loader, after all previously registered ones.
    pub fn model_loader(mut self, loader: impl ModelLoader + 'static) -> Self {
        self.loaders.append(loader);
        self
    }

    /// The encoder writing source data to the disk cache.
    pub fn encoder(mut self, encoder: impl Encoder + 'static) -> Self {
        self.encoder = Some(Arc::new(encoder));
        self
    }

    /// Replaces the filesystem disk cache.
    pub fn disk_cache_factory(mut self, factory: impl DiskCacheFactory + 'static) -> Self {
        self.disk_cache = Some(LazyDiskCache::new(factory));
        self
    }

    /// Runs pipelines on the given executors instead of starting dedicated runtimes.
    pub fn executors(mut self, executors: Executors) -> Self {
        self.executors = Some(executors);
        self
    }

    pub fn build(self) -> io::Result<Engine<R>> {
        let config = self.config;
        let executors = match self.executors {
            Some(executors) => executors,
            None => Executors::new(&config.pools)?,
        };
        let disk_cache = match self.disk_cache {
            Some(disk_cache) => disk_cache,
            None => fs_disk_cache(config.clone()),
        };
        let mut components = PipelineComponents::new(self.loaders, self.decoder, disk_cache);
        if let Some(encoder) = self.encoder {
            components = components.with_encoder(encoder);
        }

        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner<R>>| {
            let listener: Weak<dyn ResourceListener<R>> = weak.clone();
            let job_listener: Weak<dyn EngineJobListener<R>> = weak.clone();

            let active = ActiveResources::new(config.memory_cache.active_resource_retention);
            let hooks = ResourceHooks::new(listener, active.reclaim_sender());

            let recycler = ResourceRecycler::new();
            let mut cache = LruResourceCache::new(config.memory_cache.max_size);
            cache.set_eviction_listener({
                let recycler = recycler.clone();
                move |resource| recycler.push(resource)
            });

            EngineInner {
                state: Mutex::new(EngineState {
                    active,
                    cache,
                    jobs: Jobs::new(),
                    shut_down: false,
                }),
                recycler,
                executors,
                components: Arc::new(components),
                pools: Arc::new(JobPools::new(config.job_pool_size)),
                hooks,
                job_listener,
            }
        });

        Ok(Engine { inner })
    }
}

fn fs_disk_cache(config: Config) -> LazyDiskCache {
    LazyDiskCache::new(move || -> Option<Arc<dyn DiskCache>> {
        match FsDiskCache::from_config(&config) {
            Ok(Some(cache)) => {
                if let Err(error) = cache.clear_tmp() {
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        "Failed to clear temporary disk cache files"
                    );
                }
                Some(Arc::new(cache))
            }
            Ok(None) => None,
            Err(error) => {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "Failed to create disk cache"
                );
                None
            }
        }
    })
}

fn shutdown_error() -> LoadError {
    LoadError::from(FetchFailure::from(FetchError::Cancelled))
}

enum Resolution<R: Resource> {
    Memory(EngineResource<R>),
    ShutDown,
    Job {
        job: Arc<EngineJob<R>>,
        callback_id: CallbackId,
        entry: Option<job::CallbackEntry<R>>,
    },
}

/// Loads resources, deduplicating concurrent requests and caching the results.
///
/// Cloning is cheap, all clones share the same caches and jobs.
pub struct Engine<R: Resource> {
    inner: Arc<EngineInner<R>>,
}

impl<R: Resource> Clone for Engine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Resource> Engine<R> {
    pub fn builder(config: &Config, decoder: impl ResourceDecoder<R> + 'static) -> EngineBuilder<R> {
        EngineBuilder::new(config, decoder)
    }

    /// Loads the resource for `request`, reporting the result to `callback`.
    ///
    /// Returns `None` if the resource was found in memory, in which case `callback` has already
    /// been dispatched on `executor`. Otherwise the returned [`LoadStatus`] can be used to
    /// cancel the load.
    pub fn load(
        &self,
        request: LoadRequest,
        callback: Arc<dyn ResourceCallback<R>>,
        executor: Arc<dyn CallbackExecutor>,
    ) -> Option<LoadStatus<R>> {
        let inner = &self.inner;
        let key = EngineKey::new(&request);

        let (tier, resolution) = inner.with_state(|state| {
            if request.is_memory_cacheable {
                if let Some(resource) = state.active.get(&key) {
                    if resource.acquire().is_ok() {
                        return ("active", Resolution::Memory(resource));
                    }
                }
                if let Some(resource) = state.cache.remove(&key) {
                    match resource.acquire() {
                        Ok(()) => {
                            state.active.activate(&resource);
                            return ("memory", Resolution::Memory(resource));
                        }
                        Err(error) => tracing::error!(
                            key = %key,
                            error = &error as &dyn std::error::Error,
                            "Found recycled resource in memory cache"
                        ),
                    }
                }
            }

            if state.shut_down {
                return ("shutdown", Resolution::ShutDown);
            }

            if let Some(job) = state.jobs.get(&key, request.only_retrieve_from_cache) {
                let job = Arc::clone(job);
                let (callback_id, entry) = job.add_callback(callback.clone(), executor.clone());
                return (
                    "job",
                    Resolution::Job {
                        job,
                        callback_id,
                        entry,
                    },
                );
            }

            let job = Arc::new(EngineJob::new(
                key.clone(),
                JobFlags::new(&request),
                inner.executors.handles().clone(),
                inner.job_listener.clone(),
                inner.hooks.clone(),
                Arc::clone(&inner.pools),
            ));
            let mut decode_job = inner.pools.decode_jobs.acquire();
            decode_job.init(
                Arc::clone(&inner.components),
                &request,
                key.clone(),
                job.cancel_handle().clone(),
            );
            state.jobs.put(Arc::clone(&job));
            let (callback_id, entry) = job.add_callback(callback.clone(), executor.clone());
            job.start(decode_job);
            (
                "new",
                Resolution::Job {
                    job,
                    callback_id,
                    entry,
                },
            )
        });

        metric!(counter("engine.load") += 1, "tier" => tier);
        match resolution {
            Resolution::Memory(resource) => {
                tracing::trace!(%key, tier, "Loaded from memory");
                executor.execute(Box::new(move || {
                    callback.on_resource_ready(resource, DataSource::MemoryCache)
                }));
                None
            }
            Resolution::ShutDown => {
                tracing::debug!(%key, "Rejected load after shutdown");
                executor.execute(Box::new(move || callback.on_load_failed(shutdown_error())));
                None
            }
            Resolution::Job {
                job,
                callback_id,
                entry,
            } => {
                if tier == "new" {
                    metric!(counter("engine.jobs.started") += 1);
                    tracing::debug!(%key, "Started new job");
                } else {
                    tracing::trace!(%key, "Added callback to running job");
                }
                if let Some(entry) = entry {
                    job.deliver(entry);
                }
                Some(LoadStatus {
                    engine: Arc::downgrade(&self.inner),
                    job: Arc::downgrade(&job),
                    callback_id,
                })
            }
        }
    }

    /// Cancels a load, see [`LoadStatus::cancel`].
    pub fn cancel(&self, status: &LoadStatus<R>) {
        status.cancel()
    }

    /// Releases a resource that was handed to a [`ResourceCallback`].
    pub fn release(&self, resource: EngineResource<R>) {
        if let Err(error) = resource.release() {
            tracing::error!(
                key = %resource.key(),
                error = &error as &dyn std::error::Error,
                "Released resource that was not acquired"
            );
        }
    }

    /// Shrinks the memory cache in response to memory pressure.
    pub fn trim_memory(&self, level: TrimLevel) {
        self.inner.with_state(|state| state.cache.trim_memory(level));
    }

    /// Evicts everything from the memory cache.
    pub fn clear_memory(&self) {
        self.inner.with_state(|state| state.cache.clear());
    }

    /// Scales the memory cache size relative to the configured size.
    pub fn set_memory_size_multiplier(&self, multiplier: f64) {
        self.inner
            .with_state(|state| state.cache.set_size_multiplier(multiplier));
    }

    /// Removes every entry from the disk cache, creating it if needed.
    ///
    /// This does blocking I/O and should not be called from an async context.
    pub fn clear_disk_cache(&self) {
        self.inner.components.disk_cache().get().clear();
    }

    /// Drains and stops all executors.
    ///
    /// Loads started afterwards fail right away. Pipelines that are already running get to finish
    /// within [`DRAIN_TIMEOUT`], the jobs of all others fail with
    /// [`FetchError::Cancelled`]. Either way, every callback still receives its result. The
    /// caches are left as they are.
    ///
    /// This blocks the calling thread while draining.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.with_state(|state| state.shut_down = true);
        inner.executors.shutdown();

        let jobs = inner.with_state(|state| state.jobs.drain());
        if !jobs.is_empty() {
            tracing::debug!(jobs = jobs.len(), "Failing jobs left after shutdown");
        }
        for job in jobs {
            job.abort(shutdown_error());
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.with_state(|state| EngineStats {
            active: state.active.len(),
            cached: state.cache.len(),
            cache_size: state.cache.current_size(),
            jobs: state.jobs.len(),
        })
    }

    /// Reports which tiers currently hold the key of `request`.
    pub fn residency(&self, request: &LoadRequest) -> Residency {
        let key = EngineKey::new(request);
        self.inner.with_state(|state| Residency {
            active: state.active.contains(&key),
            cached: state.cache.contains(&key),
            running: state.jobs.contains(&key),
        })
    }
}

impl<R: Resource> fmt::Debug for Engine<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("components", &self.inner.components)
            .field("executors", &self.inner.executors)
            .finish_non_exhaustive()
    }
}
