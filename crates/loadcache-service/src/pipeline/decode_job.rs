use std::mem;
use std::sync::Arc;

use bytes::Bytes;

use super::generators::{
    DataCacheGenerator, FetchedData, Generator, GeneratorResult, ResourceCacheGenerator,
    SourceGenerator,
};
use super::{
    BytesEncoder, CancelHandle, DataCacheWriter, DataSource, DiskCacheStrategy, EncodeStrategy,
    Encoder, LoadData, PipelineComponents, ResourceDecoder,
};
use crate::caching::{CacheKey, DiskCache, FetchError};
use crate::engine::{EngineKey, FetchFailure, LoadError, LoadRequest, Options, Priority, Resource};
use crate::utils::defer::defer;
use crate::utils::pool::Poolable;

/// The stages of a pipeline, in the order they run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Initialize,
    ResourceCache,
    DataCache,
    Source,
    Finished,
}

/// Why the pipeline is being run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunReason {
    /// The first run.
    Initialize,
    /// Continuing on the source pool after a reschedule.
    SwitchToSource,
}

/// How a run of the pipeline ended.
pub enum RunOutcome<R> {
    /// The pipeline has to be run again on the job's source pool.
    Reschedule,
    Complete { resource: R, data_source: DataSource },
    Failed(LoadError),
    Cancelled,
}

/// The context of a single load, shared by all generators.
pub(super) struct DecodeHelper<R: Resource> {
    components: Arc<PipelineComponents<R>>,
    request: LoadRequest,
    key: EngineKey,
    load_data: Option<Vec<LoadData>>,
    cache_keys: Vec<String>,
}

impl<R: Resource> DecodeHelper<R> {
    /// Asks the model loaders for the load's candidate sources, once.
    fn prepare(&mut self, failures: &mut Vec<FetchFailure>) {
        if self.load_data.is_some() {
            return;
        }
        let request = &self.request;
        let load_data = self.components.loaders.load_data(
            &request.model,
            request.width,
            request.height,
            &request.options,
        );
        if load_data.is_empty() {
            failures.push(FetchFailure::from(FetchError::Unsupported(format!(
                "no model loader for `{}`",
                request.model
            ))));
        }

        self.cache_keys.clear();
        for load_data in &load_data {
            let keys = std::iter::once(&load_data.source_key).chain(&load_data.alternate_keys);
            for key in keys {
                if !self.cache_keys.contains(key) {
                    self.cache_keys.push(key.clone());
                }
            }
        }
        self.load_data = Some(load_data);
    }

    pub fn key(&self) -> &EngineKey {
        &self.key
    }

    pub fn load_data(&self) -> &[LoadData] {
        self.load_data.as_deref().unwrap_or_default()
    }

    /// Every key the load's data may be cached under, in loader order.
    ///
    /// Each loader's source key is followed by its alternate keys, duplicates are dropped.
    pub fn cache_keys(&self) -> &[String] {
        &self.cache_keys
    }

    /// Whether `source_key` is not the source key of any of the load's loaders.
    pub fn is_alternate_key(&self, source_key: &str) -> bool {
        !self
            .load_data()
            .iter()
            .any(|load_data| load_data.source_key == source_key)
    }

    pub fn strategy(&self) -> DiskCacheStrategy {
        self.request.disk_cache_strategy
    }

    pub fn priority(&self) -> Priority {
        self.request.priority
    }

    pub fn options(&self) -> &Options {
        &self.request.options
    }

    pub fn decoder(&self) -> &dyn ResourceDecoder<R> {
        &*self.components.decoder
    }

    pub fn encoder(&self) -> &dyn Encoder {
        &*self.components.encoder
    }

    pub fn disk_cache(&self) -> &Arc<dyn DiskCache> {
        self.components.disk_cache.get()
    }

    pub fn data_cache_key(&self, source_key: &str) -> CacheKey {
        CacheKey::data_cache(source_key, &self.request.signature)
    }

    pub fn resource_cache_key(&self, source_key: &str) -> CacheKey {
        let request = &self.request;
        CacheKey::resource_cache(
            source_key,
            &request.signature,
            request.width,
            request.height,
            &request.transformations,
            &request.resource_class,
            &request.options,
        )
    }

    /// Decodes fetched data, writing the decoded resource to the disk cache if the strategy
    /// asks for it.
    fn decode(&self, fetched: FetchedData) -> Result<R, FetchFailure> {
        let _cleanup = fetched
            .fetcher
            .as_ref()
            .map(|fetcher| defer(move || fetcher.cleanup()));

        let resource = self
            .decoder()
            .decode(fetched.data.clone(), fetched.data_source, self.options())
            .map_err(|error| {
                FetchFailure::new(error, fetched.data_source, fetched.source_key.clone())
            })?;

        let encode_strategy = self.decoder().encode_strategy();
        if self.strategy().is_resource_cacheable(
            fetched.from_alternate_key,
            fetched.data_source,
            encode_strategy,
        ) {
            if let Some(encoded) = self.decoder().encode(&resource) {
                self.write_resource(&fetched.source_key, encode_strategy, encoded);
            }
        }
        Ok(resource)
    }

    fn write_resource(&self, source_key: &str, encode_strategy: EncodeStrategy, encoded: Bytes) {
        let key = match encode_strategy {
            EncodeStrategy::Source => self.data_cache_key(source_key),
            EncodeStrategy::Transformed => self.resource_cache_key(source_key),
            EncodeStrategy::None => return,
        };
        let mut writer = DataCacheWriter::new(&BytesEncoder, &encoded, self.options());
        if let Err(error) = self.disk_cache().put(&key, &mut writer) {
            tracing::warn!(
                key = %self.key,
                error = &error as &dyn std::error::Error,
                "Failed to write resource to disk cache"
            );
        }
    }
}

/// Produces the resource of a single load.
///
/// Walks the disk caches and the sources in order until one of them yields data that can be
/// decoded. The stages that are tried depend on the request's [`DiskCacheStrategy`]. Reading
/// from the disk caches happens on the disk cache pool, whenever the pipeline moves on to the
/// sources it asks to be [rescheduled](RunOutcome::Reschedule) onto a source pool.
pub struct DecodeJob<R: Resource> {
    helper: Option<DecodeHelper<R>>,
    stage: Stage,
    run_reason: RunReason,
    generator: Option<Generator>,
    failures: Vec<FetchFailure>,
    cancel: CancelHandle,
}

impl<R: Resource> Default for DecodeJob<R> {
    fn default() -> Self {
        Self {
            helper: None,
            stage: Stage::Initialize,
            run_reason: RunReason::Initialize,
            generator: None,
            failures: Vec::new(),
            cancel: CancelHandle::default(),
        }
    }
}

impl<R: Resource> Poolable for DecodeJob<R> {
    fn reset(&mut self) {
        if let Some(generator) = &mut self.generator {
            generator.cleanup();
        }
        self.helper = None;
        self.stage = Stage::Initialize;
        self.run_reason = RunReason::Initialize;
        self.generator = None;
        self.failures.clear();
        self.cancel = CancelHandle::default();
    }
}

impl<R: Resource> DecodeJob<R> {
    pub fn init(
        &mut self,
        components: Arc<PipelineComponents<R>>,
        request: &LoadRequest,
        key: EngineKey,
        cancel: CancelHandle,
    ) {
        self.helper = Some(DecodeHelper {
            components,
            request: request.clone(),
            key,
            load_data: None,
            cache_keys: Vec::new(),
        });
        self.cancel = cancel;
    }

    /// Whether the first stage reads from a disk cache.
    pub fn will_decode_from_cache(&self) -> bool {
        let first = self.next_stage(Stage::Initialize);
        first == Stage::ResourceCache || first == Stage::DataCache
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn next_stage(&self, current: Stage) -> Stage {
        let Some(helper) = &self.helper else {
            return Stage::Finished;
        };
        let strategy = helper.strategy();
        match current {
            Stage::Initialize if strategy.decode_cached_resource() => Stage::ResourceCache,
            Stage::Initialize => self.next_stage(Stage::ResourceCache),
            Stage::ResourceCache if strategy.decode_cached_data() => Stage::DataCache,
            Stage::ResourceCache => self.next_stage(Stage::DataCache),
            Stage::DataCache if helper.request.only_retrieve_from_cache => Stage::Finished,
            Stage::DataCache => Stage::Source,
            Stage::Source | Stage::Finished => Stage::Finished,
        }
    }

    fn enter_stage(&mut self, stage: Stage) {
        self.stage = stage;
        self.generator = match stage {
            Stage::ResourceCache => Some(Generator::ResourceCache(
                ResourceCacheGenerator::default(),
            )),
            Stage::DataCache => Some(Generator::DataCache(DataCacheGenerator::all())),
            Stage::Source => Some(Generator::Source(SourceGenerator::default())),
            Stage::Initialize | Stage::Finished => None,
        };
    }

    /// Runs the pipeline until it produces a resource, fails, or needs to be rescheduled.
    pub async fn run(&mut self) -> RunOutcome<R> {
        if self.helper.is_none() {
            return RunOutcome::Failed(LoadError::default());
        }
        if self.run_reason == RunReason::Initialize {
            self.run_reason = RunReason::SwitchToSource;
            let stage = self.next_stage(Stage::Initialize);
            self.enter_stage(stage);
        }

        let Some(helper) = self.helper.as_mut() else {
            return RunOutcome::Failed(LoadError::default());
        };
        helper.prepare(&mut self.failures);

        loop {
            if self.cancel.is_cancelled() {
                if let Some(generator) = &mut self.generator {
                    generator.cleanup();
                }
                return RunOutcome::Cancelled;
            }

            let (Some(helper), Some(generator)) = (&self.helper, &mut self.generator) else {
                tracing::debug!(stage = ?self.stage, "No stage left to produce the resource");
                return RunOutcome::Failed(LoadError::new(mem::take(&mut self.failures)));
            };

            match generator.start_next(helper, &self.cancel).await {
                GeneratorResult::Ready(fetched) => {
                    let data_source = fetched.data_source;
                    match helper.decode(fetched) {
                        Ok(resource) => {
                            return RunOutcome::Complete {
                                resource,
                                data_source,
                            };
                        }
                        Err(failure) => {
                            tracing::debug!(key = %helper.key, %failure, "Decoding failed");
                            self.failures.push(failure);
                        }
                    }
                }
                GeneratorResult::Failed(failure) => {
                    if failure.error == FetchError::Cancelled {
                        return RunOutcome::Cancelled;
                    }
                    tracing::debug!(key = %helper.key, %failure, "Fetching failed");
                    self.failures.push(failure);
                }
                GeneratorResult::Reschedule => return RunOutcome::Reschedule,
                GeneratorResult::Exhausted => {
                    let stage = self.next_stage(self.stage);
                    self.enter_stage(stage);
                    if stage == Stage::Source {
                        return RunOutcome::Reschedule;
                    }
                }
            }
        }
    }
}
