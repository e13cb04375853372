use std::fmt;

use thiserror::Error;

use crate::caching::FetchError;
use crate::pipeline::DataSource;

/// Misuse of the acquire/release protocol of an [`EngineResource`](super::EngineResource).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// The resource was already recycled, its payload must no longer be used.
    #[error("resource has already been recycled")]
    Recycled,
    /// Released more often than it was acquired.
    #[error("cannot release a resource that is not acquired")]
    NotAcquired,
    /// Recycled while a consumer still holds it.
    #[error("cannot recycle a resource that is still acquired")]
    StillAcquired,
}

/// A single failed attempt to produce data for a load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub error: FetchError,
    /// Where the failed attempt tried to read from.
    pub data_source: Option<DataSource>,
    /// The source key of the [`LoadData`](crate::pipeline::LoadData) that failed.
    pub source_key: Option<String>,
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.source_key, self.data_source) {
            (Some(key), Some(source)) => write!(f, "fetching `{key}` from {source} failed"),
            (Some(key), None) => write!(f, "fetching `{key}` failed"),
            (None, Some(source)) => write!(f, "fetching from {source} failed"),
            (None, None) => write!(f, "fetching failed"),
        }
    }
}

impl std::error::Error for FetchFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl FetchFailure {
    pub fn new(error: FetchError, data_source: DataSource, source_key: impl Into<String>) -> Self {
        Self {
            error,
            data_source: Some(data_source),
            source_key: Some(source_key.into()),
        }
    }
}

impl From<FetchError> for FetchFailure {
    fn from(error: FetchError) -> Self {
        Self {
            error,
            data_source: None,
            source_key: None,
        }
    }
}

/// A load that exhausted every cache and source without producing a resource.
///
/// Contains every failure recorded along the way, in order. The last one is reported as the
/// [`source`](std::error::Error::source) of this error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadError {
    failures: Vec<FetchFailure>,
}

impl LoadError {
    pub fn new(failures: Vec<FetchFailure>) -> Self {
        Self { failures }
    }

    pub fn failures(&self) -> &[FetchFailure] {
        &self.failures
    }

    /// The error of the last recorded failure.
    pub fn last_error(&self) -> Option<&FetchError> {
        self.failures.last().map(|failure| &failure.error)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failures.len() {
            0 => write!(f, "failed to load resource: no source could provide the data"),
            1 => write!(f, "failed to load resource"),
            n => write!(f, "failed to load resource after {n} failed attempts"),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .last()
            .map(|failure| failure as &(dyn std::error::Error + 'static))
    }
}

impl From<FetchFailure> for LoadError {
    fn from(failure: FetchFailure) -> Self {
        Self::new(vec![failure])
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_load_error_reports_last_failure() {
        let error = LoadError::new(vec![
            FetchFailure::new(FetchError::NotFound, DataSource::Local, "file:///cat.png"),
            FetchFailure::new(
                FetchError::DownloadError("503".into()),
                DataSource::Remote,
                "https://example.com/cat.png",
            ),
        ]);

        assert_eq!(
            error.to_string(),
            "failed to load resource after 2 failed attempts"
        );
        assert_eq!(
            error.source().unwrap().to_string(),
            "fetching `https://example.com/cat.png` from remote failed"
        );
        assert_eq!(
            error.last_error(),
            Some(&FetchError::DownloadError("503".into()))
        );
    }

    #[test]
    fn test_empty_load_error() {
        let error = LoadError::default();
        assert!(error.source().is_none());
        assert!(error.to_string().contains("no source"));
    }
}
