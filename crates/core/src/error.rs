//! Unified error types for the wayback cache.
//!
//! Every variant carries an upper-case code prefix so log lines and callers can
//! match on the failure class without inspecting the variant.

use std::path::PathBuf;

use crate::config::ConfigError;

/// Unified error type for cache construction, storage and fetching.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or missing configuration. Only raised while building a cache.
    #[error("CONFIG_ERROR: {0}")]
    Config(#[from] ConfigError),

    /// A filesystem operation failed.
    #[error("STORAGE_ERROR: {}: {source}", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another writer held the file lock for too long.
    #[error("STORAGE_ERROR: timed out waiting for lock on {}", .0.display())]
    LockTimeout(PathBuf),

    /// Catalog or history metadata could not be serialized.
    #[error("CATALOG_ERROR: {0}")]
    Catalog(#[from] serde_json::Error),

    /// The URL could not be parsed or uses an unsupported scheme.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// Network failure or unreadable response.
    #[error("HTTP_ERROR: {0}")]
    HttpError(String),

    /// The request did not complete in time.
    #[error("FETCH_TIMEOUT: {0}")]
    FetchTimeout(String),

    /// The response body exceeded the configured limit.
    #[error("FETCH_TOO_LARGE: {0}")]
    FetchTooLarge(String),
}

impl Error {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Storage { path: path.into(), source }
    }

    /// Whether this error came from the fetch side and is recoverable by serving
    /// the last known content.
    pub fn is_fetch_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidUrl(_) | Error::HttpError(_) | Error::FetchTimeout(_) | Error::FetchTooLarge(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::HttpError("status 503".to_string());
        assert!(err.to_string().contains("HTTP_ERROR"));
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_storage_error_display_includes_path() {
        let err = Error::storage(
            "/tmp/cache/wx/.catalog",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.starts_with("STORAGE_ERROR"));
        assert!(msg.contains("/tmp/cache/wx/.catalog"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_config_error_conversion() {
        let err: Error = ConfigError::Missing { field: "key".into(), hint: "set key or url".into() }.into();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().starts_with("CONFIG_ERROR"));
    }

    #[test]
    fn test_is_fetch_error() {
        assert!(Error::FetchTimeout("10s".into()).is_fetch_error());
        assert!(!Error::LockTimeout(PathBuf::from("x")).is_fetch_error());
    }
}
