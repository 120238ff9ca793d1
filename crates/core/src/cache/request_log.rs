//! Daily per-domain request budget shared by every cache in a container.
//!
//! The log lives at `<container>/.requestLog` as
//! `{ "YYYY-MM-DD": { "<host>": count } }`. Only the current day is kept.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};

use super::storage::Storage;
use crate::Error;

/// File name of the request log inside the container.
pub const REQUEST_LOG_FILE: &str = ".requestLog";

type DailyCounts = BTreeMap<String, BTreeMap<String, u32>>;

pub struct RequestLog {
    path: PathBuf,
    storage: Arc<dyn Storage>,
}

impl RequestLog {
    pub fn new(container: &Path, storage: Arc<dyn Storage>) -> Self {
        Self { path: container.join(REQUEST_LOG_FILE), storage }
    }

    fn load(&self) -> DailyCounts {
        match self.storage.read(&self.path) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!("corrupt request log treated as empty: {}", e);
                DailyCounts::new()
            }),
            Ok(None) => DailyCounts::new(),
            Err(e) => {
                tracing::warn!("unreadable request log treated as empty: {}", e);
                DailyCounts::new()
            }
        }
    }

    /// Requests recorded today for `host`.
    pub fn count(&self, host: &str, now: DateTime<FixedOffset>) -> u32 {
        let today = now.format("%Y-%m-%d").to_string();
        self.load().get(&today).and_then(|hosts| hosts.get(host)).copied().unwrap_or(0)
    }

    /// Reserve one request to `url`'s host if fewer than `limit` were made today.
    ///
    /// Returns `false` without recording anything once the budget is spent.
    pub fn try_acquire(&self, url: &str, limit: u32, now: DateTime<FixedOffset>) -> Result<bool, Error> {
        let host = host_of(url);
        let today = now.format("%Y-%m-%d").to_string();

        let mut log = self.load();
        log.retain(|day, _| *day == today);

        let count = log.entry(today).or_default().entry(host.clone()).or_insert(0);
        if *count >= limit {
            tracing::warn!(host = %host, limit, "daily request limit reached");
            return Ok(false);
        }
        *count += 1;

        let json = serde_json::to_vec(&log)?;
        self.storage.write(&self.path, &json)?;

        Ok(true)
    }
}

fn host_of(url: &str) -> String {
    super::hash::canonicalize_url(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.trim().to_string())
}
