use std::fs::{self, read_dir};
use std::path::Path;

use anyhow::Result;

use super::FsDiskCache;
use super::fs::{CACHE_VERSION, catch_not_found};

/// Totals collected by [`FsDiskCache::cleanup`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_dirs: usize,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl CleanupStats {
    fn report(&self) {
        tracing::info!(
            retained.dirs = self.retained_dirs,
            retained.files = self.retained_files,
            retained.bytes = self.retained_bytes,
            removed.dirs = self.removed_dirs,
            removed.files = self.removed_files,
            removed.bytes = self.removed_bytes,
            "Disk cache cleanup complete",
        );

        metric!(gauge("disk_cache.size.files") = self.retained_files as u64);
        metric!(gauge("disk_cache.size.bytes") = self.retained_bytes);
        metric!(counter("disk_cache.size.files_removed") += self.removed_files as i64);
        metric!(counter("disk_cache.size.bytes_removed") += self.removed_bytes as i64);
    }
}

impl FsDiskCache {
    /// Removes all entries that have not been used within `max_unused_for`.
    ///
    /// Entries written with a different on-disk layout version are removed regardless of their
    /// age. With `dry_run`, nothing is deleted but the stats report what would have been.
    pub fn cleanup(&self, dry_run: bool) -> Result<CleanupStats> {
        tracing::info!(cache_dir = %self.cache_dir.display(), dry_run, "Cleaning up disk cache");

        let mut walker = Walker {
            cache: self,
            dry_run,
            stats: CleanupStats::default(),
        };
        walker.walk_root()?;
        walker.stats.report();

        Ok(walker.stats)
    }
}

/// What to do with the files found below a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    /// Remove files that are past `max_unused_for`.
    Expire,
    /// Remove every file.
    Purge,
}

struct Walker<'a> {
    cache: &'a FsDiskCache,
    dry_run: bool,
    stats: CleanupStats,
}

impl Walker<'_> {
    fn walk_root(&mut self) -> Result<()> {
        let current = format!("v{CACHE_VERSION}");
        let Some(entries) = catch_not_found(|| read_dir(&self.cache.cache_dir))? else {
            tracing::warn!(cache_dir = %self.cache.cache_dir.display(), "Cache directory not found");
            return Ok(());
        };

        for entry in entries {
            let path = entry?.path();
            let policy = match path.file_name().and_then(|name| name.to_str()) {
                Some(name) if name == current => Policy::Expire,
                _ => {
                    tracing::debug!(path = %path.display(), "Purging outdated cache layout");
                    Policy::Purge
                }
            };
            self.visit(&path, policy);
        }
        Ok(())
    }

    /// Visits `path`, returning `true` if nothing is left of it afterwards.
    fn visit(&mut self, path: &Path, policy: Policy) -> bool {
        let result = if path.is_dir() {
            self.visit_dir(path, policy)
        } else {
            self.visit_file(path, policy)
        };
        result.unwrap_or_else(|error| {
            sentry::with_scope(
                |scope| scope.set_extra("path", path.display().to_string().into()),
                || {
                    tracing::error!(
                        error = &*error as &dyn std::error::Error,
                        "Failed to clean up cache path",
                    )
                },
            );
            false
        })
    }

    fn visit_dir(&mut self, dir: &Path, policy: Policy) -> Result<bool> {
        let Some(entries) = catch_not_found(|| read_dir(dir))? else {
            return Ok(true);
        };

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            is_empty &= self.visit(&path, policy);
        }

        if is_empty && !self.dry_run {
            catch_not_found(|| fs::remove_dir(dir))?;
        }
        if is_empty {
            self.stats.removed_dirs += 1;
        } else {
            self.stats.retained_dirs += 1;
        }
        Ok(is_empty)
    }

    fn visit_file(&mut self, path: &Path, policy: Policy) -> Result<bool> {
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            return Ok(true);
        };
        anyhow::ensure!(metadata.is_file(), "not a file");
        let size = metadata.len();

        let expired = match policy {
            Policy::Purge => true,
            Policy::Expire => catch_not_found(|| self.cache.check_expiry(path))?.is_none(),
        };
        if !expired {
            self.stats.retained_bytes += size;
            self.stats.retained_files += 1;
            return Ok(false);
        }

        tracing::trace!(path = %path.display(), size, "Removing cache file");
        if !self.dry_run {
            catch_not_found(|| fs::remove_file(path))?;
        }
        self.stats.removed_bytes += size;
        self.stats.removed_files += 1;
        Ok(true)
    }
}
