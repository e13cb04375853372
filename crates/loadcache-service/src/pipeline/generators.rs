use std::sync::Arc;

use bytes::Bytes;

use super::decode_job::DecodeHelper;
use super::{CancelHandle, DataCacheWriter, DataFetcher, DataSource, LoadData};
use crate::engine::{FetchFailure, Resource};
use crate::utils::defer::defer;

/// Data produced by one of the generators, ready to be decoded.
pub(super) struct FetchedData {
    pub data: Bytes,
    /// The source reported to the callbacks.
    pub data_source: DataSource,
    pub source_key: String,
    /// Whether the data was found under an alternate key rather than the primary one.
    pub from_alternate_key: bool,
    /// The fetcher to clean up once the data has been decoded.
    pub fetcher: Option<Arc<dyn DataFetcher>>,
}

pub(super) enum GeneratorResult {
    /// Nothing left to try, the pipeline moves on to the next stage.
    Exhausted,
    Ready(FetchedData),
    Failed(FetchFailure),
    /// The pipeline has to continue on the source pool.
    Reschedule,
}

/// One stage of the pipeline.
pub(super) enum Generator {
    ResourceCache(ResourceCacheGenerator),
    DataCache(DataCacheGenerator),
    Source(SourceGenerator),
}

impl Generator {
    /// Attempts the next candidate of this stage.
    pub async fn start_next<R: Resource>(
        &mut self,
        helper: &DecodeHelper<R>,
        cancel: &CancelHandle,
    ) -> GeneratorResult {
        match self {
            Generator::ResourceCache(generator) => generator.start_next(helper),
            Generator::DataCache(generator) => generator.start_next(helper),
            Generator::Source(generator) => generator.start_next(helper, cancel).await,
        }
    }

    /// Cleans up fetched data that has not been consumed yet.
    pub fn cleanup(&mut self) {
        if let Generator::Source(generator) = self {
            if let Some(pending) = generator.data_to_cache.take() {
                pending.load_data.fetcher.cleanup();
            }
        }
    }
}

/// Looks up decoded resources in the disk cache.
#[derive(Debug, Default)]
pub(super) struct ResourceCacheGenerator {
    next: usize,
}

impl ResourceCacheGenerator {
    fn start_next<R: Resource>(&mut self, helper: &DecodeHelper<R>) -> GeneratorResult {
        let cache_keys = helper.cache_keys();
        while let Some(source_key) = cache_keys.get(self.next) {
            self.next += 1;
            let key = helper.resource_cache_key(source_key);
            if let Some(data) = helper.disk_cache().get(&key) {
                tracing::trace!(key = %helper.key(), %source_key, "Resource disk cache hit");
                return GeneratorResult::Ready(FetchedData {
                    data,
                    data_source: DataSource::ResourceDiskCache,
                    source_key: source_key.clone(),
                    from_alternate_key: helper.is_alternate_key(source_key),
                    fetcher: None,
                });
            }
        }
        GeneratorResult::Exhausted
    }
}

/// Looks up unmodified source data in the disk cache.
#[derive(Debug)]
pub(super) struct DataCacheGenerator {
    /// The keys to look up, all of the load's cache keys if `None`.
    keys: Option<Vec<String>>,
    next: usize,
    data_source: DataSource,
}

impl DataCacheGenerator {
    pub fn all() -> Self {
        Self {
            keys: None,
            next: 0,
            data_source: DataSource::DataDiskCache,
        }
    }

    /// Looks up only `source_key`, reporting hits as coming from `data_source`.
    pub fn single(source_key: String, data_source: DataSource) -> Self {
        Self {
            keys: Some(vec![source_key]),
            next: 0,
            data_source,
        }
    }

    fn start_next<R: Resource>(&mut self, helper: &DecodeHelper<R>) -> GeneratorResult {
        let keys = self.keys.as_deref().unwrap_or(helper.cache_keys());
        while let Some(source_key) = keys.get(self.next) {
            self.next += 1;
            let key = helper.data_cache_key(source_key);
            if let Some(data) = helper.disk_cache().get(&key) {
                tracing::trace!(key = %helper.key(), %source_key, "Data disk cache hit");
                return GeneratorResult::Ready(FetchedData {
                    data,
                    data_source: self.data_source,
                    source_key: source_key.clone(),
                    from_alternate_key: helper.is_alternate_key(source_key),
                    fetcher: None,
                });
            }
        }
        GeneratorResult::Exhausted
    }
}

struct PendingWrite {
    load_data: LoadData,
    data: Bytes,
}

/// Reads back freshly written source data, falling back to the fetched copy on a miss.
struct CachedSource {
    generator: DataCacheGenerator,
    fallback: Option<FetchedData>,
}

/// Fetches data from the load's sources.
///
/// Data that is cacheable under the load's strategy is written to the disk cache and then read
/// back from there. The write happens on the next [`start_next`](Self::start_next), after the
/// pipeline has been moved onto the source pool.
#[derive(Default)]
pub(super) struct SourceGenerator {
    next: usize,
    data_to_cache: Option<PendingWrite>,
    cached: Option<CachedSource>,
}

impl SourceGenerator {
    async fn start_next<R: Resource>(
        &mut self,
        helper: &DecodeHelper<R>,
        cancel: &CancelHandle,
    ) -> GeneratorResult {
        if let Some(pending) = self.data_to_cache.take() {
            self.cached = Some(cache_data(helper, pending));
        }

        if let Some(cached) = &mut self.cached {
            match cached.generator.start_next(helper) {
                GeneratorResult::Exhausted => {}
                result => {
                    cached.fallback = None;
                    return result;
                }
            }
            if let Some(fallback) = self.cached.take().and_then(|cached| cached.fallback) {
                return GeneratorResult::Ready(fallback);
            }
        }

        let strategy = helper.strategy();
        while let Some(load_data) = helper.load_data().get(self.next) {
            self.next += 1;
            let fetcher = &load_data.fetcher;
            let data_source = fetcher.data_source();
            if !strategy.is_data_cacheable(data_source)
                && !helper.decoder().handles(fetcher.data_class())
            {
                continue;
            }

            tracing::debug!(
                key = %helper.key(),
                source_key = %load_data.source_key,
                %data_source,
                "Fetching from source"
            );
            let result = cancel.fetch(fetcher, helper.priority()).await;
            metric!(
                counter("pipeline.fetch") += 1,
                "source" => data_source.as_str(),
                "status" => match &result {
                    Ok(_) => "ok",
                    Err(error) => error.as_tag(),
                },
            );

            return match result {
                Ok(data) if strategy.is_data_cacheable(data_source) => {
                    self.data_to_cache = Some(PendingWrite {
                        load_data: load_data.clone(),
                        data,
                    });
                    GeneratorResult::Reschedule
                }
                Ok(data) => GeneratorResult::Ready(FetchedData {
                    data,
                    data_source,
                    source_key: load_data.source_key.clone(),
                    from_alternate_key: false,
                    fetcher: Some(Arc::clone(fetcher)),
                }),
                Err(error) => {
                    fetcher.cleanup();
                    GeneratorResult::Failed(FetchFailure::new(
                        error,
                        data_source,
                        load_data.source_key.clone(),
                    ))
                }
            };
        }
        GeneratorResult::Exhausted
    }
}

fn cache_data<R: Resource>(helper: &DecodeHelper<R>, pending: PendingWrite) -> CachedSource {
    let PendingWrite { load_data, data } = pending;
    let fetcher = Arc::clone(&load_data.fetcher);
    let _cleanup = defer(|| fetcher.cleanup());
    let data_source = fetcher.data_source();

    let key = helper.data_cache_key(&load_data.source_key);
    let mut writer = DataCacheWriter::new(helper.encoder(), &data, helper.options());
    match helper.disk_cache().put(&key, &mut writer) {
        Ok(()) => {
            tracing::trace!(key = %helper.key(), source_key = %load_data.source_key, "Wrote data to disk cache")
        }
        Err(error) => tracing::warn!(
            key = %helper.key(),
            source_key = %load_data.source_key,
            error = &error as &dyn std::error::Error,
            "Failed to write data to disk cache"
        ),
    }

    CachedSource {
        generator: DataCacheGenerator::single(load_data.source_key.clone(), data_source),
        fallback: Some(FetchedData {
            data,
            data_source,
            source_key: load_data.source_key,
            from_alternate_key: false,
            fetcher: None,
        }),
    }
}
