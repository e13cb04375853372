use std::fmt;
use std::io;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use super::{CacheKey, FetchError};

/// Writes the contents of a single cache entry.
pub trait Writer {
    /// Writes the entry into `file`.
    ///
    /// The entry is only committed to the cache if this returns `Ok`.
    fn write(&mut self, file: &mut dyn io::Write) -> io::Result<()>;
}

/// A secondary, persistent cache for fetched data and encoded resources.
///
/// Implementations are shared between all running pipelines and need to tolerate concurrent
/// access to the same key.
pub trait DiskCache: Send + Sync {
    /// Returns the contents stored under `key`, if any.
    fn get(&self, key: &CacheKey) -> Option<Bytes>;

    /// Stores the output of `writer` under `key`, replacing an existing entry.
    fn put(&self, key: &CacheKey, writer: &mut dyn Writer) -> Result<(), FetchError>;

    /// Removes the entry stored under `key`.
    fn delete(&self, key: &CacheKey);

    /// Removes all entries.
    fn clear(&self);
}

/// A [`DiskCache`] that never stores anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiskCache;

impl DiskCache for NoopDiskCache {
    fn get(&self, _key: &CacheKey) -> Option<Bytes> {
        None
    }

    fn put(&self, _key: &CacheKey, _writer: &mut dyn Writer) -> Result<(), FetchError> {
        Ok(())
    }

    fn delete(&self, _key: &CacheKey) {}

    fn clear(&self) {}
}

/// Creates the [`DiskCache`] on first use.
///
/// Returning `None` disables disk caching.
pub trait DiskCacheFactory: Send + Sync {
    fn build(&self) -> Option<Arc<dyn DiskCache>>;
}

impl<F> DiskCacheFactory for F
where
    F: Fn() -> Option<Arc<dyn DiskCache>> + Send + Sync,
{
    fn build(&self) -> Option<Arc<dyn DiskCache>> {
        self()
    }
}

/// A [`DiskCache`] handle that defers opening the cache until it is first needed.
///
/// The factory is invoked at most once, even when accessed concurrently.
pub struct LazyDiskCache {
    factory: Box<dyn DiskCacheFactory>,
    cache: OnceLock<Arc<dyn DiskCache>>,
}

impl LazyDiskCache {
    pub fn new(factory: impl DiskCacheFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            cache: OnceLock::new(),
        }
    }

    /// Wraps an already constructed cache.
    pub fn from_cache(cache: Arc<dyn DiskCache>) -> Self {
        Self {
            factory: Box::new(|| -> Option<Arc<dyn DiskCache>> { None }),
            cache: OnceLock::from(cache),
        }
    }

    /// Returns the disk cache, constructing it if needed.
    pub fn get(&self) -> &Arc<dyn DiskCache> {
        self.cache.get_or_init(|| match self.factory.build() {
            Some(cache) => cache,
            None => {
                tracing::debug!("No disk cache available, falling back to a no-op cache");
                Arc::new(NoopDiskCache)
            }
        })
    }
}

impl fmt::Debug for LazyDiskCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyDiskCache")
            .field("created", &self.cache.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_factory_invoked_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let lazy = LazyDiskCache::new({
            let calls = calls.clone();
            move || -> Option<Arc<dyn DiskCache>> {
                calls.fetch_add(1, Ordering::Relaxed);
                None
            }
        });
        assert_eq!(calls.load(Ordering::Relaxed), 0);

        let key = CacheKey::for_testing("foo");
        assert!(lazy.get().get(&key).is_none());
        assert!(lazy.get().get(&key).is_none());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_noop_cache_accepts_writes() {
        struct Failing;
        impl Writer for Failing {
            fn write(&mut self, _file: &mut dyn io::Write) -> io::Result<()> {
                Err(io::ErrorKind::Other.into())
            }
        }

        let lazy = LazyDiskCache::new(|| -> Option<Arc<dyn DiskCache>> { None });
        let key = CacheKey::for_testing("foo");
        assert!(lazy.get().put(&key, &mut Failing).is_ok());
        assert!(lazy.get().get(&key).is_none());
    }
}
