use std::fmt;

use lru::LruCache;

use super::key::EngineKey;
use super::resource::{EngineResource, Resource};

/// Memory pressure levels, as reported by the host.
///
/// Ordered by severity, the numeric values match the levels of common platform callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrimLevel {
    RunningModerate = 5,
    RunningLow = 10,
    RunningCritical = 15,
    UiHidden = 20,
    Background = 40,
    Moderate = 60,
    Complete = 80,
}

type EvictionListener<R> = Box<dyn FnMut(EngineResource<R>) + Send>;

/// A size-bounded, least-recently-used cache of idle resources.
///
/// The size of an entry is the [`size`](EngineResource::size) of its resource. Evicted
/// resources are passed to the eviction listener.
pub struct LruResourceCache<R: Resource> {
    entries: LruCache<EngineKey, EngineResource<R>>,
    initial_max_size: u64,
    max_size: u64,
    current_size: u64,
    on_evicted: Option<EvictionListener<R>>,
}

impl<R: Resource> LruResourceCache<R> {
    pub fn new(max_size: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            initial_max_size: max_size,
            max_size,
            current_size: 0,
            on_evicted: None,
        }
    }

    pub fn set_eviction_listener(&mut self, listener: impl FnMut(EngineResource<R>) + Send + 'static) {
        self.on_evicted = Some(Box::new(listener));
    }

    /// Returns the resource for `key`, marking it as recently used.
    pub fn get(&mut self, key: &EngineKey) -> Option<&EngineResource<R>> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &EngineKey) -> bool {
        self.entries.contains(key)
    }

    /// Whether exactly this resource is cached.
    pub fn contains_resource(&self, resource: &EngineResource<R>) -> bool {
        self.entries
            .peek(resource.key())
            .is_some_and(|cached| cached.ptr_eq(resource))
    }

    /// Inserts `resource`, evicting the least recently used entries until the cache fits.
    ///
    /// A previous entry for the same key is evicted. A resource that does not fit into the cache
    /// at all is evicted right away.
    pub fn put(&mut self, resource: EngineResource<R>) {
        let size = resource.size();
        if size >= self.max_size {
            self.evict(resource);
            return;
        }

        self.current_size += size;
        if let Some(previous) = self.entries.put(resource.key().clone(), resource.clone()) {
            self.current_size -= previous.size();
            if !previous.ptr_eq(&resource) {
                self.evict(previous);
            }
        }
        self.trim_to_size(self.max_size);
    }

    /// Removes the entry for `key` without treating it as evicted.
    pub fn remove(&mut self, key: &EngineKey) -> Option<EngineResource<R>> {
        let resource = self.entries.pop(key)?;
        self.current_size -= resource.size();
        self.report_size();
        Some(resource)
    }

    /// Evicts every entry.
    pub fn clear(&mut self) {
        self.trim_to_size(0);
    }

    /// Evicts least recently used entries until at most `size` bytes are cached.
    pub fn trim_to_size(&mut self, size: u64) {
        let mut evicted = 0;
        while self.current_size > size {
            let Some((_, resource)) = self.entries.pop_lru() else {
                break;
            };
            self.current_size -= resource.size();
            self.evict(resource);
            evicted += 1;
        }
        if evicted > 0 {
            tracing::trace!(evicted, size = self.current_size, "Trimmed memory cache");
        }
        self.report_size();
    }

    /// Evicts entries until at most `fraction` of the maximum size is used.
    pub fn trim(&mut self, fraction: f64) {
        self.trim_to_size((self.max_size as f64 * fraction.clamp(0.0, 1.0)) as u64);
    }

    /// Scales the maximum size relative to the size the cache was created with.
    pub fn set_size_multiplier(&mut self, multiplier: f64) {
        let max_size = (self.initial_max_size as f64 * multiplier.max(0.0)).round() as u64;
        self.set_max_size(max_size);
    }

    pub fn set_max_size(&mut self, max_size: u64) {
        self.max_size = max_size;
        self.trim_to_size(max_size);
    }

    /// Reacts to memory pressure reported by the host.
    pub fn trim_memory(&mut self, level: TrimLevel) {
        tracing::debug!(?level, "Trimming memory cache");
        if level >= TrimLevel::Background {
            self.clear();
        } else if level == TrimLevel::UiHidden || level == TrimLevel::RunningCritical {
            self.trim(0.5);
        }
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self, resource: EngineResource<R>) {
        metric!(counter("memory_cache.evicted") += 1);
        if let Some(listener) = &mut self.on_evicted {
            listener(resource);
        }
    }

    fn report_size(&self) {
        metric!(gauge("memory_cache.size") = self.current_size);
    }
}

impl<R: Resource> fmt::Debug for LruResourceCache<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruResourceCache")
            .field("len", &self.entries.len())
            .field("current_size", &self.current_size)
            .field("max_size", &self.max_size)
            .finish()
    }
}
