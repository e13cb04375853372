use std::time::Duration;

use thiserror::Error;

/// An error that happens when fetching or decoding the data of a request.
///
/// Fetch errors do not abort a load by themselves, the pipeline records them and falls back to
/// the next candidate source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The data was not found at the source.
    #[error("not found")]
    NotFound,
    /// The data could not be fetched from the source due to missing permissions.
    ///
    /// The attached string contains the source's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The data could not be fetched from the source due to a timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The data could not be fetched from the source due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    ///
    /// The attached string contains the source's response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The data was fetched successfully, but is invalid in some way.
    ///
    /// For example, a decoder rejecting the bytes it was given.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The data is of a class that no registered decoder can handle.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// The fetch was cancelled before it completed.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected error in the engine itself, like failing filesystem access.
    ///
    /// The underlying error has already been logged when this is created.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for FetchError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl FetchError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// The tag value used for this error in metrics.
    pub fn as_tag(&self) -> &'static str {
        match self {
            FetchError::NotFound => "notfound",
            FetchError::PermissionDenied(_) => "permissiondenied",
            FetchError::Timeout(_) => "timeout",
            FetchError::DownloadError(_) => "downloaderror",
            FetchError::Malformed(_) => "malformed",
            FetchError::Unsupported(_) => "unsupported",
            FetchError::Cancelled => "cancelled",
            FetchError::InternalError => "internalerror",
        }
    }
}
