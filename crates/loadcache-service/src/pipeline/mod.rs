//! # The data pipeline
//!
//! A load that misses the in-memory tiers runs a [`DecodeJob`]. The job walks a fixed chain of
//! generators, each trying to produce data that the [`ResourceDecoder`] can turn into a
//! resource:
//!
//! 1. decoded resources from the disk cache,
//! 2. unmodified source data from the disk cache,
//! 3. the [`DataFetcher`]s of every [`LoadData`] the [`ModelLoader`]s produce for the model.
//!
//! Which of the stages run, and what gets written back to the disk cache, is decided by the
//! request's [`DiskCacheStrategy`]. Failures of a single candidate are recorded and the chain
//! moves on to the next one. Only when every candidate failed does the load fail.

use std::fmt;
use std::sync::Arc;

mod codec;
mod decode_job;
mod fetcher;
mod generators;
mod strategy;

pub use codec::{BytesEncoder, DataCacheWriter, Decoded, Encoder, ResourceDecoder};
pub use decode_job::{DecodeJob, RunOutcome, Stage};
pub use fetcher::{CancelHandle, DataFetcher, LoadData, ModelLoader, ModelLoaderRegistry};
pub use strategy::{DiskCacheStrategy, EncodeStrategy};

use crate::caching::LazyDiskCache;

/// Where the data of a resource came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataSource {
    /// A source on the local device, like a file.
    Local,
    /// A source on a remote machine, like a server.
    Remote,
    /// Unmodified data read from the disk cache.
    DataDiskCache,
    /// A decoded resource read from the disk cache.
    ResourceDiskCache,
    /// A resource served from memory.
    MemoryCache,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Local => "local",
            DataSource::Remote => "remote",
            DataSource::DataDiskCache => "data_disk_cache",
            DataSource::ResourceDiskCache => "resource_disk_cache",
            DataSource::MemoryCache => "memory_cache",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a pipeline needs besides the request itself, shared by all pipelines.
pub struct PipelineComponents<R> {
    pub(crate) loaders: ModelLoaderRegistry,
    pub(crate) decoder: Arc<dyn ResourceDecoder<R>>,
    pub(crate) encoder: Arc<dyn Encoder>,
    pub(crate) disk_cache: LazyDiskCache,
}

impl<R> PipelineComponents<R> {
    /// Creates the components, writing source data unmodified.
    pub fn new(
        loaders: ModelLoaderRegistry,
        decoder: Arc<dyn ResourceDecoder<R>>,
        disk_cache: LazyDiskCache,
    ) -> Self {
        Self {
            loaders,
            decoder,
            encoder: Arc::new(BytesEncoder),
            disk_cache,
        }
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn disk_cache(&self) -> &LazyDiskCache {
        &self.disk_cache
    }
}

impl<R> fmt::Debug for PipelineComponents<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineComponents")
            .field("loaders", &self.loaders)
            .field("disk_cache", &self.disk_cache)
            .finish_non_exhaustive()
    }
}
