use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::pipeline::DiskCacheStrategy;

/// Free-form decode options, part of the request fingerprint.
///
/// Ordered, so insertion order never affects equality.
pub type Options = BTreeMap<String, String>;

/// Identifies what is being loaded, for example a URL or a file path.
///
/// [`ModelLoader`](crate::pipeline::ModelLoader)s decide which models they can produce data for.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Model(Arc<str>);

impl Model {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Model {
    fn from(model: &str) -> Self {
        Self(model.into())
    }
}

impl From<String> for Model {
    fn from(model: String) -> Self {
        Self(model.into())
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

/// How urgently data should be fetched, passed through to
/// [`DataFetcher::load_data`](crate::pipeline::DataFetcher::load_data).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Immediate,
    High,
    #[default]
    Normal,
    Low,
}

/// Everything needed to load a resource.
///
/// ```
/// use loadcache_service::engine::{LoadRequest, Priority};
/// use loadcache_service::pipeline::DiskCacheStrategy;
///
/// let request = LoadRequest::new("https://example.com/cat.png")
///     .size(100, 100)
///     .transform("rotate", "90")
///     .priority(Priority::High)
///     .disk_cache_strategy(DiskCacheStrategy::Data);
/// ```
#[derive(Clone, Debug)]
pub struct LoadRequest {
    pub(crate) model: Model,
    pub(crate) signature: String,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) transformations: BTreeMap<String, String>,
    pub(crate) resource_class: String,
    pub(crate) transcode_class: String,
    pub(crate) options: Options,
    pub(crate) priority: Priority,
    pub(crate) disk_cache_strategy: DiskCacheStrategy,
    pub(crate) is_memory_cacheable: bool,
    pub(crate) use_unlimited_source_pool: bool,
    pub(crate) use_animation_pool: bool,
    pub(crate) only_retrieve_from_cache: bool,
}

impl LoadRequest {
    pub fn new(model: impl Into<Model>) -> Self {
        Self {
            model: model.into(),
            signature: String::new(),
            width: 0,
            height: 0,
            transformations: BTreeMap::new(),
            resource_class: String::new(),
            transcode_class: String::new(),
            options: Options::new(),
            priority: Priority::default(),
            disk_cache_strategy: DiskCacheStrategy::default(),
            is_memory_cacheable: true,
            use_unlimited_source_pool: false,
            use_animation_pool: false,
            only_retrieve_from_cache: false,
        }
    }

    /// Distinguishes versions of the same model, for example a file's modification time.
    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    /// The requested dimensions.
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Adds a named transformation with its parameters.
    pub fn transform(mut self, name: impl Into<String>, params: impl Into<String>) -> Self {
        self.transformations.insert(name.into(), params.into());
        self
    }

    pub fn resource_class(mut self, class: impl Into<String>) -> Self {
        self.resource_class = class.into();
        self
    }

    pub fn transcode_class(mut self, class: impl Into<String>) -> Self {
        self.transcode_class = class.into();
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn disk_cache_strategy(mut self, strategy: DiskCacheStrategy) -> Self {
        self.disk_cache_strategy = strategy;
        self
    }

    /// Bypasses the in-memory tiers, neither reading from nor adding to them.
    pub fn skip_memory_cache(mut self, skip: bool) -> Self {
        self.is_memory_cacheable = !skip;
        self
    }

    /// Runs the source stage on the pool without a concurrency limit.
    pub fn use_unlimited_source_pool(mut self, unlimited: bool) -> Self {
        self.use_unlimited_source_pool = unlimited;
        self
    }

    /// Runs the source stage on the pool reserved for animations.
    pub fn use_animation_pool(mut self, animation: bool) -> Self {
        self.use_animation_pool = animation;
        self
    }

    /// Fails instead of fetching from a source when no cache has the resource.
    pub fn only_retrieve_from_cache(mut self, only_cache: bool) -> Self {
        self.only_retrieve_from_cache = only_cache;
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }
}
