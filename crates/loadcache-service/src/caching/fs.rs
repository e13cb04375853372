use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use filetime::FileTime;
use tempfile::NamedTempFile;

use crate::config::{Config, DiskCacheConfig};

use super::{CacheKey, DiskCache, FetchError, Writer};

/// The version of the on-disk layout, part of every entry's path.
pub const CACHE_VERSION: u32 = 1;

/// The interval in which cache entries should be touched.
///
/// Entries use a "time to idle" instead of "time to live" mode.
/// We thus need to regularly "touch" the files to signal that they are still in use.
/// This is being debounced to once every hour to not have to touch them on every single use.
const TOUCH_EVERY: Duration = Duration::from_secs(3600);

/// A [`DiskCache`] storing every entry as a file below a cache directory.
///
/// Entries live at `<cache_dir>/entries/v1/aa/bbccdd/eeff...`, following
/// [`CacheKey::cache_path`]. New entries are written to a temporary file in `<cache_dir>/tmp`
/// first and then atomically moved into place, so readers never observe partial writes.
#[derive(Debug, Clone)]
pub struct FsDiskCache {
    /// Directory to use for storing cache items. Will be created if it does not exist.
    pub(super) cache_dir: PathBuf,

    /// Directory to use for temporary files.
    tmp_dir: PathBuf,

    /// Options intended to be user-configurable.
    pub(super) cache_config: DiskCacheConfig,
}

impl FsDiskCache {
    /// Creates the cache below the configured `cache_dir`.
    ///
    /// Returns `None` if no `cache_dir` is configured, which disables disk caching.
    pub fn from_config(config: &Config) -> io::Result<Option<Self>> {
        let (Some(cache_dir), Some(tmp_dir)) = (config.cache_dir("entries"), config.cache_dir("tmp"))
        else {
            return Ok(None);
        };
        Self::new(cache_dir, tmp_dir, config.disk_cache.clone()).map(Some)
    }

    pub fn new(
        cache_dir: PathBuf,
        tmp_dir: PathBuf,
        cache_config: DiskCacheConfig,
    ) -> io::Result<Self> {
        fs::create_dir_all(&cache_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            cache_dir,
            tmp_dir,
            cache_config,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Clear the temporary files.
    ///
    /// We need to do this on startup to avoid accidentally leaving temporary files which survive
    /// a hard crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            fs::remove_dir_all(&self.tmp_dir)?;
        }
        fs::create_dir_all(&self.tmp_dir)
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.cache_path(CACHE_VERSION))
    }

    /// Validate cache expiration of path.
    ///
    /// If the entry has not been used within `max_unused_for`, `Err(io::ErrorKind::NotFound)` is
    /// returned. Otherwise returns whether the file should be touched before using.
    pub(super) fn check_expiry(&self, path: &Path) -> io::Result<bool> {
        // We use `mtime` to keep track of "cache last used", because literally every other
        // filesystem attribute is unreliable.
        let metadata = path.metadata()?;
        let mtime_elapsed = metadata.modified()?.elapsed().unwrap_or_default();

        let max_unused_for = self.cache_config.max_unused_for.unwrap_or(Duration::MAX);
        if mtime_elapsed > max_unused_for {
            return Err(io::ErrorKind::NotFound.into());
        }

        Ok(mtime_elapsed >= TOUCH_EVERY)
    }

    fn read_entry(&self, path: &Path) -> io::Result<Option<Bytes>> {
        // `io::ErrorKind::NotFound` can be returned from multiple locations in this function. All
        // of those can indicate a cache miss as cleanup can run inbetween.
        catch_not_found(|| {
            let should_touch = self.check_expiry(path)?;
            let contents = fs::read(path)?;
            tracing::trace!(path = %path.display(), len = contents.len(), "Read cache entry");

            if should_touch {
                filetime::set_file_mtime(path, FileTime::now())?;
            }

            Ok(Bytes::from(contents))
        })
    }

    /// Create a new temporary file to write an entry into.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        with_parent_dir(&self.tmp_dir, || {
            tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
        })
    }
}

impl DiskCache for FsDiskCache {
    fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let path = self.entry_path(key);
        match self.read_entry(&path) {
            Ok(entry) => {
                let hit = if entry.is_some() { "true" } else { "false" };
                metric!(counter("disk_cache.access") += 1, "hit" => hit);
                entry
            }
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to read cache file",
                );
                None
            }
        }
    }

    fn put(&self, key: &CacheKey, writer: &mut dyn Writer) -> Result<(), FetchError> {
        let mut temp_file = self.tempfile()?;
        writer.write(temp_file.as_file_mut())?;

        let path = self.entry_path(key);
        tracing::trace!(path = %path.display(), "Persisting cache entry");
        persist_tempfile(temp_file, &path)?;

        metric!(counter("disk_cache.write") += 1);
        Ok(())
    }

    fn delete(&self, key: &CacheKey) {
        let path = self.entry_path(key);
        if let Err(e) = catch_not_found(|| fs::remove_file(&path)) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %path.display(),
                "Failed to delete cache file",
            );
        }
    }

    fn clear(&self) {
        tracing::info!(cache_dir = %self.cache_dir.display(), "Clearing disk cache");
        let result = catch_not_found(|| fs::remove_dir_all(&self.cache_dir))
            .and_then(|_| fs::create_dir_all(&self.cache_dir));
        if let Err(e) = result {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                "Failed to clear disk cache",
            );
        }
    }
}

/// Attempts to run `op`, which creates something inside `dir`.
///
/// A concurrent [`cleanup`](FsDiskCache::cleanup) may remove empty directories at any time, so
/// `dir` is (re)created before every attempt.
fn with_parent_dir<T>(dir: &Path, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    const ATTEMPTS: usize = 3;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = fs::create_dir_all(dir).and_then(|_| op());
        match result {
            Ok(value) => return Ok(value),
            Err(error) if attempt >= ATTEMPTS => {
                sentry::with_scope(
                    |scope| scope.set_extra("path", dir.display().to_string().into()),
                    || {
                        tracing::error!(
                            error = &error as &dyn std::error::Error,
                            attempt,
                            "Failed to write into cache directory",
                        )
                    },
                );
                return Err(error);
            }
            Err(error) => {
                tracing::debug!(
                    error = &error as &dyn std::error::Error,
                    dir = %dir.display(),
                    attempt,
                    "Retrying cache write",
                );
            }
        }
    }
}

fn persist_tempfile(temp_file: NamedTempFile, cache_path: &Path) -> io::Result<fs::File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    let mut temp_file = Some(temp_file);
    with_parent_dir(parent, || {
        let file = temp_file
            .take()
            .ok_or_else(|| io::Error::other("temporary file already consumed"))?;
        file.persist(cache_path).map_err(|e| {
            temp_file = Some(e.file);
            e.error
        })
    })
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
