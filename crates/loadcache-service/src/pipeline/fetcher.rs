use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::DataSource;
use crate::caching::FetchError;
use crate::engine::{Model, Options, Priority};
use crate::utils::defer::defer;
use crate::utils::lock;

/// Produces the raw bytes of a single source.
pub trait DataFetcher: Send + Sync {
    /// Fetches the data.
    ///
    /// The returned future may be dropped before it completes when the load is cancelled.
    fn load_data(&self, priority: Priority) -> BoxFuture<'_, Result<Bytes, FetchError>>;

    /// Releases whatever was opened for [`load_data`](Self::load_data).
    ///
    /// Called once the data has been consumed or the fetch failed.
    fn cleanup(&self) {}

    /// Aborts an in-flight [`load_data`](Self::load_data).
    ///
    /// May be called before the fetch started or after it completed.
    fn cancel(&self) {}

    /// Describes the kind of data this fetcher produces, used to pick a decoder.
    fn data_class(&self) -> &str;

    fn data_source(&self) -> DataSource;
}

/// A candidate source for the data of a model.
#[derive(Clone)]
pub struct LoadData {
    /// Identifies the data independently of the requested size and transformations.
    pub source_key: String,
    /// Other keys the same data may have been cached under.
    pub alternate_keys: Vec<String>,
    pub fetcher: Arc<dyn DataFetcher>,
}

impl LoadData {
    pub fn new(source_key: impl Into<String>, fetcher: Arc<dyn DataFetcher>) -> Self {
        Self {
            source_key: source_key.into(),
            alternate_keys: Vec::new(),
            fetcher,
        }
    }

    pub fn with_alternate_keys(mut self, keys: Vec<String>) -> Self {
        self.alternate_keys = keys;
        self
    }
}

impl fmt::Debug for LoadData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadData")
            .field("source_key", &self.source_key)
            .field("alternate_keys", &self.alternate_keys)
            .field("data_source", &self.fetcher.data_source())
            .finish()
    }
}

/// Turns models into [`LoadData`].
pub trait ModelLoader: Send + Sync {
    fn handles(&self, model: &Model) -> bool;

    /// Returns the candidate source for `model`, or `None` if this loader cannot load it after
    /// all.
    fn build_load_data(
        &self,
        model: &Model,
        width: u32,
        height: u32,
        options: &Options,
    ) -> Option<LoadData>;
}

/// The registered [`ModelLoader`]s, in registration order.
#[derive(Clone, Default)]
pub struct ModelLoaderRegistry {
    loaders: Vec<Arc<dyn ModelLoader>>,
}

impl ModelLoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, loader: impl ModelLoader + 'static) {
        self.loaders.push(Arc::new(loader));
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    /// Asks every loader handling `model` for its candidate source.
    pub fn load_data(
        &self,
        model: &Model,
        width: u32,
        height: u32,
        options: &Options,
    ) -> Vec<LoadData> {
        self.loaders
            .iter()
            .filter(|loader| loader.handles(model))
            .filter_map(|loader| loader.build_load_data(model, width, height, options))
            .collect()
    }
}

impl fmt::Debug for ModelLoaderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelLoaderRegistry")
            .field("loaders", &self.loaders.len())
            .finish()
    }
}

/// Cancels a running pipeline.
///
/// Cancelling stops the pipeline at its next step and aborts the fetch that is currently in
/// flight, if any.
#[derive(Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    current: Arc<Mutex<Option<Arc<dyn DataFetcher>>>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
        let current = lock(&self.current).clone();
        if let Some(fetcher) = current {
            fetcher.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Runs `fetcher`, resolving with [`FetchError::Cancelled`] as soon as this is cancelled.
    pub(crate) async fn fetch(
        &self,
        fetcher: &Arc<dyn DataFetcher>,
        priority: Priority,
    ) -> Result<Bytes, FetchError> {
        *lock(&self.current) = Some(Arc::clone(fetcher));
        let _reset = defer(|| *lock(&self.current) = None);

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(FetchError::Cancelled),
            result = fetcher.load_data(priority) => result,
        }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
