use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// The key of an entry in a [`DiskCache`](super::DiskCache).
///
/// Two kinds of entries exist: the raw bytes a fetcher produced, keyed by
/// [`data_cache`](Self::data_cache), and encoded decoded resources, keyed by
/// [`resource_cache`](Self::resource_cache).
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cache_path(0))
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates the [`CacheKey`] for the unmodified bytes a fetcher produced for `source_key`.
    pub fn data_cache(source_key: &str, signature: &str) -> Self {
        let mut builder = CacheKeyBuilder::new("data");
        builder.write_source(source_key, signature).unwrap();
        builder.build()
    }

    /// Creates the [`CacheKey`] for a decoded and transformed resource.
    ///
    /// Every input that changes the decoded result contributes to the key, so that a resource
    /// decoded at a different size or with other options is cached separately.
    pub fn resource_cache(
        source_key: &str,
        signature: &str,
        width: u32,
        height: u32,
        transformations: &BTreeMap<String, String>,
        resource_class: &str,
        options: &BTreeMap<String, String>,
    ) -> Self {
        let mut builder = CacheKeyBuilder::new("resource");
        builder.write_source(source_key, signature).unwrap();
        writeln!(builder, "size: {width}x{height}").unwrap();
        builder.write_map("transformations", transformations).unwrap();
        writeln!(builder, "resource_class: {resource_class}").unwrap();
        builder.write_map("options", options).unwrap();
        builder.build()
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`
    pub fn cache_path(&self, version: u32) -> String {
        let mut path = format!("v{version}/{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            path.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        path.push('/');
        for b in &self.hash[4..] {
            path.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        path
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<String>) -> Self {
        CacheKeyBuilder {
            metadata: key.into(),
        }
        .build()
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input.
/// This input in then being hashed to form the [`CacheKey`].
pub struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    /// Starts a new key for entries of the given `kind`.
    pub fn new(kind: &str) -> Self {
        Self {
            metadata: format!("kind: {kind}\n\n"),
        }
    }

    /// Writes the source key and signature the entry was produced from.
    pub fn write_source(&mut self, source_key: &str, signature: &str) -> fmt::Result {
        writeln!(self.metadata, "source: {source_key}")?;
        writeln!(self.metadata, "signature: {signature}")
    }

    /// Writes an ordered map, one `key=value` line per entry.
    pub fn write_map(&mut self, name: &str, map: &BTreeMap<String, String>) -> fmt::Result {
        writeln!(self.metadata, "{name}:")?;
        for (key, value) in map {
            writeln!(self.metadata, "  {key}={value}")?;
        }
        Ok(())
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash = Sha256::digest(&self.metadata);

        CacheKey {
            metadata: self.metadata.into(),
            hash: hash.into(),
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}
