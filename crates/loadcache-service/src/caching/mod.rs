//! # Disk caching
//!
//! The engine keeps two kinds of entries on disk, both behind the [`DiskCache`] trait:
//!
//! - **data** entries hold the unmodified bytes a fetcher produced, keyed by
//!   [`CacheKey::data_cache`]. Whether fetched data is written is decided by the request's
//!   [`DiskCacheStrategy`](crate::pipeline::DiskCacheStrategy).
//! - **resource** entries hold decoded and transformed resources, as encoded by the
//!   [`ResourceDecoder`](crate::pipeline::ResourceDecoder), keyed by
//!   [`CacheKey::resource_cache`].
//!
//! A lookup walks the resource entries first, then the data entries, and only then hits the
//! registered fetchers.
//!
//! ## [`CacheKey`]
//!
//! The [`CacheKey`] contains some human-readable (but not necessarily machine-readable)
//! metadata describing what the entry contains and where it came from. This metadata is then
//! SHA256-hashed to form the filename for the file-system cache.
//!
//! **NOTE**: Care must be taken to make sure that this metadata is stable, as it would otherwise
//! lead to bad cache reuse.
//!
//! ## Construction
//!
//! Opening a disk cache may be slow, so the engine only holds a [`LazyDiskCache`] which invokes
//! a [`DiskCacheFactory`] the first time a pipeline needs it. A factory that produces nothing
//! disables disk caching by falling back to the [`NoopDiskCache`].
//!
//! [`FsDiskCache`] is the filesystem implementation. It is gated by the
//! [`Config::cache_dir`](crate::config::Config::cache_dir) option. Entries use a time-to-idle
//! expiry: `mtime` is bumped at most once an hour when an entry is read, and
//! [`FsDiskCache::cleanup`] removes entries unused for longer than
//! [`max_unused_for`](crate::config::DiskCacheConfig::max_unused_for).

mod cache_error;
mod cache_key;
mod cleanup;
mod disk_cache;
mod fs;

pub use cache_error::FetchError;
pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use cleanup::CleanupStats;
pub use disk_cache::{DiskCache, DiskCacheFactory, LazyDiskCache, NoopDiskCache, Writer};
pub use fs::{CACHE_VERSION, FsDiskCache};
