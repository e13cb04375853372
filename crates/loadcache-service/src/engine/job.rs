use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use super::callback::{CallbackExecutor, CallbackId, ResourceCallback};
use super::error::LoadError;
use super::executors::{ExecutorHandles, PoolKind};
use super::key::EngineKey;
use super::request::LoadRequest;
use super::resource::{EngineResource, Resource, ResourceHooks};
use crate::caching::FetchError;
use crate::pipeline::{CancelHandle, DataSource, DecodeJob, RunOutcome};
use crate::utils::lock;
use crate::utils::pool::{Pool, Poolable};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// The request flags that decide how a job runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct JobFlags {
    pub is_memory_cacheable: bool,
    pub use_unlimited_source_pool: bool,
    pub use_animation_pool: bool,
    pub only_retrieve_from_cache: bool,
}

impl JobFlags {
    pub fn new(request: &LoadRequest) -> Self {
        Self {
            is_memory_cacheable: request.is_memory_cacheable,
            use_unlimited_source_pool: request.use_unlimited_source_pool,
            use_animation_pool: request.use_animation_pool,
            only_retrieve_from_cache: request.only_retrieve_from_cache,
        }
    }

    /// The pool the source stage runs on.
    pub fn active_source_pool(&self) -> PoolKind {
        if self.use_unlimited_source_pool {
            PoolKind::UnlimitedSource
        } else if self.use_animation_pool {
            PoolKind::Animation
        } else {
            PoolKind::Source
        }
    }
}

pub(crate) struct CallbackEntry<R: Resource> {
    id: CallbackId,
    callback: Arc<dyn ResourceCallback<R>>,
    executor: Arc<dyn CallbackExecutor>,
}

impl<R: Resource> Clone for CallbackEntry<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
            executor: Arc::clone(&self.executor),
        }
    }
}

/// The mutable part of a job, recycled through a [`Pool`].
pub(crate) struct JobState<R: Resource> {
    status: JobStatus,
    callbacks: Vec<CallbackEntry<R>>,
    resource: Option<EngineResource<R>>,
    data_source: Option<DataSource>,
    error: Option<LoadError>,
    /// Deliveries that have not finished yet, plus one for the job itself.
    pending: usize,
}

impl<R: Resource> Default for JobState<R> {
    fn default() -> Self {
        Self {
            status: JobStatus::Pending,
            callbacks: Vec::new(),
            resource: None,
            data_source: None,
            error: None,
            pending: 0,
        }
    }
}

impl<R: Resource> Poolable for JobState<R> {
    fn reset(&mut self) {
        self.status = JobStatus::Pending;
        self.callbacks.clear();
        self.resource = None;
        self.data_source = None;
        self.error = None;
        self.pending = 0;
    }
}

/// Pools shared by all jobs of an engine.
pub(crate) struct JobPools<R: Resource> {
    pub states: Pool<JobState<R>>,
    pub decode_jobs: Pool<DecodeJob<R>>,
}

impl<R: Resource> JobPools<R> {
    pub fn new(max_size: usize) -> Self {
        Self {
            states: Pool::new(max_size, JobState::default),
            decode_jobs: Pool::new(max_size, DecodeJob::default),
        }
    }
}

/// Notified by a job once it has a result.
pub(crate) trait EngineJobListener<R: Resource>: Send + Sync {
    /// Called without holding the job's lock. `resource` is `None` when the job failed.
    fn on_engine_job_complete(
        &self,
        job: &Arc<EngineJob<R>>,
        key: &EngineKey,
        resource: Option<&EngineResource<R>>,
    );
}

enum Delivery<R: Resource> {
    Ready(EngineResource<R>, DataSource),
    Failed(LoadError),
}

/// A running load, shared by every request for the same key.
///
/// The job runs one [`DecodeJob`] and hands its result to every registered callback. Each
/// callback receives exactly one result, unless it is removed before that. Removing the last
/// callback of a job that has not finished cancels the pipeline.
pub(crate) struct EngineJob<R: Resource> {
    key: EngineKey,
    flags: JobFlags,
    cancel: CancelHandle,
    executors: ExecutorHandles,
    listener: Weak<dyn EngineJobListener<R>>,
    hooks: ResourceHooks<R>,
    pools: Arc<JobPools<R>>,
    started: Instant,
    state: Mutex<JobState<R>>,
}

impl<R: Resource> EngineJob<R> {
    pub fn new(
        key: EngineKey,
        flags: JobFlags,
        executors: ExecutorHandles,
        listener: Weak<dyn EngineJobListener<R>>,
        hooks: ResourceHooks<R>,
        pools: Arc<JobPools<R>>,
    ) -> Self {
        let state = pools.states.acquire();
        Self {
            key,
            flags,
            cancel: CancelHandle::new(),
            executors,
            listener,
            hooks,
            pools,
            started: Instant::now(),
            state: Mutex::new(state),
        }
    }

    pub fn key(&self) -> &EngineKey {
        &self.key
    }

    pub fn only_retrieve_from_cache(&self) -> bool {
        self.flags.only_retrieve_from_cache
    }

    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }

    /// Registers a callback.
    ///
    /// If the job already has a result, the returned entry has to be passed to
    /// [`deliver`](Self::deliver) once the caller no longer holds the engine's lock.
    pub fn add_callback(
        &self,
        callback: Arc<dyn ResourceCallback<R>>,
        executor: Arc<dyn CallbackExecutor>,
    ) -> (CallbackId, Option<CallbackEntry<R>>) {
        let entry = CallbackEntry {
            id: CallbackId::next(),
            callback,
            executor,
        };
        let id = entry.id;

        let mut state = lock(&self.state);
        state.callbacks.push(entry.clone());
        match state.status {
            JobStatus::Complete | JobStatus::Failed => {
                state.pending += 1;
                (id, Some(entry))
            }
            _ => (id, None),
        }
    }

    /// Removes a callback.
    ///
    /// Returns `true` if this removed the last callback of a job without a result, which
    /// cancels the job. The caller is responsible for firing the [`CancelHandle`].
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut state = lock(&self.state);
        let Some(position) = state.callbacks.iter().position(|entry| entry.id == id) else {
            return false;
        };
        state.callbacks.remove(position);

        if state.callbacks.is_empty() && !state.status.is_terminal() {
            tracing::debug!(key = %self.key, "Cancelling job without callbacks");
            state.status = JobStatus::Cancelled;
            return true;
        }
        false
    }

    /// Starts running `decode_job`.
    pub fn start(self: &Arc<Self>, decode_job: DecodeJob<R>) {
        lock(&self.state).status = JobStatus::Running;
        let pool = if decode_job.will_decode_from_cache() {
            PoolKind::DiskCache
        } else {
            self.flags.active_source_pool()
        };
        self.submit(pool, decode_job);
    }

    fn submit(self: &Arc<Self>, pool: PoolKind, mut decode_job: DecodeJob<R>) {
        tracing::trace!(key = %self.key, pool = pool.as_str(), "Submitting pipeline");
        let job = Arc::clone(self);
        self.executors.spawn(pool, async move {
            let outcome = decode_job.run().await;
            job.on_run_finished(decode_job, outcome);
        });
    }

    fn on_run_finished(self: &Arc<Self>, decode_job: DecodeJob<R>, outcome: RunOutcome<R>) {
        if let RunOutcome::Reschedule = outcome {
            self.submit(self.flags.active_source_pool(), decode_job);
            return;
        }
        self.pools.decode_jobs.release(decode_job);

        match outcome {
            RunOutcome::Reschedule => {}
            RunOutcome::Complete {
                resource,
                data_source,
            } => self.on_resource_ready(resource, data_source),
            RunOutcome::Failed(error) => self.on_load_failed(error),
            RunOutcome::Cancelled => {
                let cancelled = lock(&self.state).status == JobStatus::Cancelled;
                if cancelled {
                    self.release_state();
                } else {
                    self.on_load_failed(LoadError::from(super::FetchFailure::from(
                        FetchError::Cancelled,
                    )));
                }
            }
        }
    }

    fn on_resource_ready(self: &Arc<Self>, payload: R, data_source: DataSource) {
        let (resource, callbacks) = {
            let mut state = lock(&self.state);
            match state.status {
                JobStatus::Cancelled => {
                    drop(state);
                    tracing::debug!(key = %self.key, "Recycling resource of cancelled job");
                    payload.recycle();
                    self.release_state();
                    return;
                }
                JobStatus::Failed => {
                    drop(state);
                    tracing::debug!(key = %self.key, "Recycling resource of aborted job");
                    payload.recycle();
                    return;
                }
                _ => {}
            }

            let resource = EngineResource::new(
                self.key.clone(),
                payload,
                self.flags.is_memory_cacheable,
                true,
                self.hooks.clone(),
            );
            // held by the job until every callback has been notified
            if let Err(error) = resource.acquire() {
                tracing::error!(error = &error as &dyn std::error::Error);
            }

            state.status = JobStatus::Complete;
            state.resource = Some(resource.clone());
            state.data_source = Some(data_source);
            state.pending += state.callbacks.len() + 1;
            (resource, state.callbacks.clone())
        };

        metric!(timer("engine.jobs.duration") = self.started.elapsed(), "status" => "complete");
        tracing::debug!(key = %self.key, %data_source, callbacks = callbacks.len(), "Job complete");
        if let Some(listener) = self.listener.upgrade() {
            listener.on_engine_job_complete(self, &self.key, Some(&resource));
        }
        for entry in callbacks {
            self.deliver(entry);
        }
        self.decrement_pending();
    }

    /// Fails the job unless it already has a result.
    ///
    /// Used when the engine shuts down. The pipeline is cancelled and whatever it still produces
    /// is discarded.
    pub fn abort(self: &Arc<Self>, error: LoadError) {
        self.cancel.cancel();
        self.fail(error, false);
    }

    fn on_load_failed(self: &Arc<Self>, error: LoadError) {
        self.fail(error, true);
    }

    /// `from_pipeline` is set when the pipeline itself has stopped, so a cancelled job can give
    /// up its state.
    fn fail(self: &Arc<Self>, error: LoadError, from_pipeline: bool) {
        let callbacks = {
            let mut state = lock(&self.state);
            match state.status {
                JobStatus::Cancelled => {
                    drop(state);
                    if from_pipeline {
                        self.release_state();
                    }
                    return;
                }
                // aborted while the pipeline was still running
                JobStatus::Complete | JobStatus::Failed => return,
                JobStatus::Pending | JobStatus::Running => {}
            }

            state.status = JobStatus::Failed;
            state.error = Some(error.clone());
            state.pending += state.callbacks.len() + 1;
            state.callbacks.clone()
        };

        metric!(counter("engine.jobs.failed") += 1);
        metric!(timer("engine.jobs.duration") = self.started.elapsed(), "status" => "failed");
        tracing::debug!(
            key = %self.key,
            error = &error as &dyn std::error::Error,
            "Job failed"
        );
        if let Some(listener) = self.listener.upgrade() {
            listener.on_engine_job_complete(self, &self.key, None);
        }
        for entry in callbacks {
            self.deliver(entry);
        }
        self.decrement_pending();
    }

    /// Hands the job's result to a callback on the callback's executor.
    ///
    /// The callback is skipped if it has been removed in the meantime.
    pub fn deliver(self: &Arc<Self>, entry: CallbackEntry<R>) {
        let executor = Arc::clone(&entry.executor);
        let job = Arc::clone(self);
        executor.execute(Box::new(move || job.notify(entry)));
    }

    fn notify(&self, entry: CallbackEntry<R>) {
        let delivery = {
            let mut state = lock(&self.state);
            match state.callbacks.iter().position(|current| current.id == entry.id) {
                Some(position) => {
                    state.callbacks.remove(position);
                    match (&state.resource, state.data_source, &state.error) {
                        (Some(resource), Some(data_source), _) => {
                            // acquired on behalf of the callback
                            match resource.acquire() {
                                Ok(()) => Some(Delivery::Ready(resource.clone(), data_source)),
                                Err(error) => {
                                    tracing::error!(error = &error as &dyn std::error::Error);
                                    None
                                }
                            }
                        }
                        (_, _, Some(error)) => Some(Delivery::Failed(error.clone())),
                        _ => None,
                    }
                }
                None => None,
            }
        };

        match delivery {
            Some(Delivery::Ready(resource, data_source)) => {
                entry.callback.on_resource_ready(resource, data_source)
            }
            Some(Delivery::Failed(error)) => entry.callback.on_load_failed(error),
            None => {}
        }
        self.decrement_pending();
    }

    fn decrement_pending(&self) {
        let released = {
            let mut state = lock(&self.state);
            match state.pending.checked_sub(1) {
                Some(0) => {
                    let status = state.status;
                    let released = mem::take(&mut *state);
                    state.status = status;
                    Some(released)
                }
                Some(pending) => {
                    state.pending = pending;
                    None
                }
                None => {
                    tracing::error!(key = %self.key, "Job delivered more results than it had");
                    None
                }
            }
        };

        if let Some(state) = released {
            if let Some(resource) = &state.resource {
                if let Err(error) = resource.release() {
                    tracing::error!(error = &error as &dyn std::error::Error);
                }
            }
            self.pools.states.release(state);
        }
    }

    fn release_state(&self) {
        let state = {
            let mut state = lock(&self.state);
            let status = state.status;
            let released = mem::take(&mut *state);
            state.status = status;
            released
        };
        self.pools.states.release(state);
    }
}

impl<R: Resource> fmt::Debug for EngineJob<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("EngineJob")
            .field("key", &self.key)
            .field("status", &state.status)
            .field("callbacks", &state.callbacks.len())
            .field("pending", &state.pending)
            .finish()
    }
}
