//! The fetch seam between the cache and a data source.
//!
//! The cache never issues requests itself. It hands a URL to a [`Fetcher`] and
//! treats any returned error as a failed cycle. Timeouts are the fetcher's job.

use std::collections::BTreeMap;

use crate::Error;

/// Result of a completed request, successful or not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    /// HTTP status code
    pub status: u16,
    /// Response headers with lowercased names
    pub headers: BTreeMap<String, String>,
    /// Response body
    pub body: String,
}

impl FetchOutcome {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self { status, headers: BTreeMap::new(), body: body.into() }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// 2xx and 3xx responses count as success.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// Performs one GET request.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchOutcome, Error>;
}
