use serde::Deserialize;

use super::DataSource;

/// How a decoder wants its decoded resources to be written to the disk cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EncodeStrategy {
    /// The encoded resource is equivalent to the source data and is stored as a data entry.
    Source,
    /// The encoded resource is the transformed resource and is stored as a resource entry.
    Transformed,
    /// Decoded resources are not written.
    #[default]
    None,
}

/// Which data and resources a load reads from and writes to the disk cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskCacheStrategy {
    /// Writes remote data and every decoded resource, reads both.
    All,
    /// Neither reads from nor writes to the disk cache.
    None,
    /// Writes the unmodified data of every fetch that does not come from a cache, reads only data.
    Data,
    /// Writes and reads only decoded resources.
    Resource,
    /// Writes remote data and resources decoded from local data, reads both.
    #[default]
    Automatic,
}

impl DiskCacheStrategy {
    /// Whether fetched data from `source` should be written to the disk cache.
    pub fn is_data_cacheable(&self, source: DataSource) -> bool {
        match self {
            DiskCacheStrategy::All | DiskCacheStrategy::Automatic => source == DataSource::Remote,
            DiskCacheStrategy::Data => {
                source != DataSource::DataDiskCache && source != DataSource::MemoryCache
            }
            DiskCacheStrategy::None | DiskCacheStrategy::Resource => false,
        }
    }

    /// Whether a resource decoded from data of `source` should be written to the disk cache.
    ///
    /// `from_alternate_key` is set when the data was found under one of the alternate keys of a
    /// source rather than its primary key.
    pub fn is_resource_cacheable(
        &self,
        from_alternate_key: bool,
        source: DataSource,
        encode_strategy: EncodeStrategy,
    ) -> bool {
        match self {
            DiskCacheStrategy::All | DiskCacheStrategy::Resource => {
                source != DataSource::ResourceDiskCache && source != DataSource::MemoryCache
            }
            DiskCacheStrategy::Automatic => {
                ((from_alternate_key && source == DataSource::DataDiskCache)
                    || source == DataSource::Local)
                    && encode_strategy == EncodeStrategy::Transformed
            }
            DiskCacheStrategy::None | DiskCacheStrategy::Data => false,
        }
    }

    /// Whether decoded resources are looked up in the disk cache.
    pub fn decode_cached_resource(&self) -> bool {
        matches!(
            self,
            DiskCacheStrategy::All | DiskCacheStrategy::Resource | DiskCacheStrategy::Automatic
        )
    }

    /// Whether unmodified data is looked up in the disk cache.
    pub fn decode_cached_data(&self) -> bool {
        matches!(
            self,
            DiskCacheStrategy::All | DiskCacheStrategy::Data | DiskCacheStrategy::Automatic
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCES: [DataSource; 5] = [
        DataSource::Local,
        DataSource::Remote,
        DataSource::DataDiskCache,
        DataSource::ResourceDiskCache,
        DataSource::MemoryCache,
    ];

    fn cacheable_data(strategy: DiskCacheStrategy) -> Vec<DataSource> {
        SOURCES
            .into_iter()
            .filter(|source| strategy.is_data_cacheable(*source))
            .collect()
    }

    #[test]
    fn test_data_cacheable() {
        use DataSource::*;

        assert_eq!(cacheable_data(DiskCacheStrategy::All), [Remote]);
        assert_eq!(cacheable_data(DiskCacheStrategy::Automatic), [Remote]);
        assert_eq!(
            cacheable_data(DiskCacheStrategy::Data),
            [Local, Remote, ResourceDiskCache]
        );
        assert!(cacheable_data(DiskCacheStrategy::None).is_empty());
        assert!(cacheable_data(DiskCacheStrategy::Resource).is_empty());
    }

    #[test]
    fn test_resource_cacheable() {
        let transformed = EncodeStrategy::Transformed;

        let all = DiskCacheStrategy::All;
        assert!(all.is_resource_cacheable(false, DataSource::Remote, EncodeStrategy::None));
        assert!(!all.is_resource_cacheable(false, DataSource::ResourceDiskCache, transformed));

        let automatic = DiskCacheStrategy::Automatic;
        assert!(automatic.is_resource_cacheable(false, DataSource::Local, transformed));
        assert!(!automatic.is_resource_cacheable(false, DataSource::Local, EncodeStrategy::Source));
        assert!(!automatic.is_resource_cacheable(false, DataSource::Remote, transformed));
        assert!(!automatic.is_resource_cacheable(false, DataSource::DataDiskCache, transformed));
        assert!(automatic.is_resource_cacheable(true, DataSource::DataDiskCache, transformed));

        for source in SOURCES {
            assert!(!DiskCacheStrategy::None.is_resource_cacheable(true, source, transformed));
            assert!(!DiskCacheStrategy::Data.is_resource_cacheable(true, source, transformed));
        }
    }

    #[test]
    fn test_decode_cached() {
        let decodes = |strategy: DiskCacheStrategy| {
            (
                strategy.decode_cached_resource(),
                strategy.decode_cached_data(),
            )
        };
        assert_eq!(decodes(DiskCacheStrategy::All), (true, true));
        assert_eq!(decodes(DiskCacheStrategy::None), (false, false));
        assert_eq!(decodes(DiskCacheStrategy::Data), (false, true));
        assert_eq!(decodes(DiskCacheStrategy::Resource), (true, false));
        assert_eq!(decodes(DiskCacheStrategy::Automatic), (true, true));
    }
}
