//! History-aware TTL cache backed by the local filesystem.
//!
//! Each cache key owns one directory:
//!
//! ```text
//! <container>/<key>/.catalog         # JSON metadata and the history index
//! <container>/<key>/<file>           # one file per retained history state
//! ```
//!
//! ### Access
//! - Fresh content (`now < expireTime`) is served without touching the fetcher.
//! - Stale content is re-fetched unless the last response says the source's
//!   rate limit is nearly spent, or the container's daily request budget is used up.
//! - Failed, rejected or skipped fetches never replace known content: the last
//!   state is served and `expireTime` moves to the next boundary ("increment").
//!
//! ### Congruency
//! - The catalog stores a fingerprint of the configuration that built it.
//!   Opening a cache with a different fingerprint rebuilds the catalog with an
//!   empty history instead of serving data accumulated under other settings.
//!
//! ### Pruning
//! - States falling off the end of the history lose their files right after the
//!   catalog is written. A fuller sweep of unreferenced files runs once per
//!   cleanup cycle (daily by default).

pub mod catalog;
pub mod hash;
pub mod history;
pub mod request_log;
pub mod storage;

pub use catalog::{CATALOG_FILE, CATALOG_VERSION, Catalog, CatalogPatch, CatalogRecord};
pub use hash::{canonicalize_url, key_for_url};
pub use history::{HistoryState, StateMeta};
pub use request_log::RequestLog;
pub use storage::{FsStorage, Storage};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::FixedOffset;
use regex::Regex;
use serde_json::{Map, Value, json};

use crate::clock::{Clock, Expire, SystemClock, localize, next_cleanup, next_expire, parse_reset_time};
use crate::config::{CacheConfig, ConfigError, compile_pattern};
use crate::fetch::{FetchOutcome, Fetcher};
use crate::Error;
use catalog::to_object;
use history::{orphaned_files, push_front};

/// Maximum fetch attempts per cycle when `retry` is enabled.
const FETCH_ATTEMPTS: usize = 2;

/// A single cache key and its on-disk history.
pub struct Cache {
    config: CacheConfig,
    key: String,
    path: PathBuf,
    expire: Expire,
    tz: FixedOffset,
    must_match: Option<Regex>,
    must_not_match: Option<Regex>,
    catalog: Catalog,
    request_log: Option<RequestLog>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl Cache {
    /// Open a cache on the local filesystem using the wall clock.
    pub fn open(config: CacheConfig) -> Result<Self, Error> {
        Self::open_with(config, Arc::new(FsStorage), Arc::new(SystemClock))
    }

    /// Open a cache with explicit storage and clock.
    ///
    /// Validates the configuration, clears the directory if asked to, and
    /// rebuilds the catalog when it is missing, corrupt or incongruent.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for invalid configuration and a storage error if
    /// the directory or catalog cannot be written.
    pub fn open_with(config: CacheConfig, storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        config.validate()?;

        let key = match (&config.key, &config.url) {
            (Some(key), _) => key.clone(),
            (None, Some(url)) => key_for_url(url),
            (None, None) => {
                return Err(ConfigError::Missing { field: "key".into(), hint: "set `key`, or `url` to derive one".into() }
                    .into());
            }
        };
        let tz = FixedOffset::east_opt(config.utc_offset_secs).ok_or_else(|| ConfigError::Invalid {
            field: "utc_offset_secs".into(),
            reason: "out of range".into(),
        })?;
        let must_match = compile_pattern("must_match", config.must_match.as_deref())?;
        let must_not_match = compile_pattern("must_not_match", config.must_not_match.as_deref())?;

        let path = config.container.join(&key);
        if config.clear && storage.delete_dir(&path)? {
            tracing::info!(key = %key, "cleared cache directory");
        }

        let catalog = Catalog::new(path.join(CATALOG_FILE), storage.clone());
        let request_log = config.request_limit.map(|_| RequestLog::new(&config.container, storage.clone()));

        let expire = Expire::parse(&config.expire);
        let mut cache = Self {
            config,
            key,
            path,
            expire,
            tz,
            must_match,
            must_not_match,
            catalog,
            request_log,
            storage,
            clock,
        };

        if !cache.is_congruent() {
            cache.init()?;
        }

        Ok(cache)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Directory holding this cache's catalog and history files.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn container_name(&self) -> String {
        self.config.container.to_string_lossy().into_owned()
    }

    /// Configuration fields that must match the stored catalog.
    fn fingerprint(&self) -> Map<String, Value> {
        let mut fingerprint = Map::new();
        fingerprint.insert("version".into(), json!(CATALOG_VERSION));
        fingerprint.insert("key".into(), json!(self.key));
        fingerprint.insert("expire".into(), json!(self.config.expire));
        fingerprint.insert("offset".into(), json!(self.config.offset));
        fingerprint.insert("mustMatch".into(), json!(self.config.must_match));
        fingerprint.insert("mustNotMatch".into(), json!(self.config.must_not_match));
        fingerprint.insert("historyLimit".into(), json!(self.config.history_limit));
        if self.config.fingerprint_container {
            fingerprint.insert("container".into(), json!(self.container_name()));
        }
        fingerprint
    }

    fn is_congruent(&mut self) -> bool {
        let fingerprint = self.fingerprint();
        let stored = self.catalog.read_all();
        let matches = fingerprint.iter().all(|(field, value)| stored.get(field) == Some(value));

        if !matches && !stored.is_empty() {
            tracing::info!(key = %self.key, "cache configuration changed; rebuilding catalog");
        }

        matches && self.catalog.record().is_some()
    }

    /// Write a fresh catalog with an empty history.
    fn init(&mut self) -> Result<CatalogRecord, Error> {
        self.storage.create_dir(&self.path)?;

        let now = self.clock.now();
        let local = localize(now, self.tz);
        let record = CatalogRecord {
            version: CATALOG_VERSION,
            key: self.key.clone(),
            expire: self.config.expire.clone(),
            offset: self.config.offset,
            must_match: self.config.must_match.clone(),
            must_not_match: self.config.must_not_match.clone(),
            history_limit: self.config.history_limit,
            container: self.config.fingerprint_container.then(|| self.container_name()),
            created_time: now,
            expire_time: next_expire(self.expire, self.config.offset, local),
            cleanup_time: next_cleanup(self.config.cleanup_hour, local),
            history: Vec::new(),
        };

        self.catalog.create(to_object(&record)?)?;
        tracing::info!(key = %self.key, path = %self.path.display(), "initialized cache catalog");

        Ok(record)
    }

    /// The current catalog, rebuilt first if it has gone missing or corrupt.
    pub fn record(&mut self) -> Result<CatalogRecord, Error> {
        match self.catalog.record() {
            Some(record) => Ok(record),
            None => {
                tracing::warn!(key = %self.key, "catalog unreadable; reinitializing");
                self.init()
            }
        }
    }

    /// Retained history states, newest first.
    pub fn history(&mut self) -> Result<Vec<HistoryState>, Error> {
        Ok(self.record()?.history)
    }

    pub fn is_expired(&mut self) -> Result<bool, Error> {
        Ok(self.record()?.expire_time <= self.clock.now())
    }

    fn read_state(&self, state: Option<&HistoryState>) -> Result<Option<String>, Error> {
        let Some(state) = state else {
            return Ok(None);
        };

        let bytes = self.storage.read(&self.path.join(&state.file))?;
        if bytes.is_none() {
            tracing::warn!(key = %self.key, file = %state.file, "history file missing");
        }

        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Content of the history state at `index` (0 is the newest).
    pub fn read_history(&mut self, index: usize) -> Result<Option<String>, Error> {
        let record = self.record()?;
        self.read_state(record.history.get(index))
    }

    /// Latest content if it has not expired. Never fetches.
    pub fn get(&mut self) -> Result<Option<String>, Error> {
        let record = self.record()?;
        if record.expire_time <= self.clock.now() {
            return Ok(None);
        }
        self.read_state(record.history.first())
    }

    /// Store `contents` as a new history state if it passes validation.
    ///
    /// Returns whether the content was stored.
    pub fn set(&mut self, contents: &str, meta: StateMeta) -> Result<bool, Error> {
        if !self.accepts(contents) {
            return Ok(false);
        }

        let now = self.clock.now();
        let record = self.record()?;
        self.store(record, contents, meta, now)?;

        Ok(true)
    }

    /// Latest content, re-fetched from the configured `url` when stale.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the cache was configured without a `url`.
    pub async fn get_from_source(&mut self, fetcher: &dyn Fetcher) -> Result<Option<String>, Error> {
        let Some(url) = self.config.url.clone() else {
            return Err(ConfigError::Missing { field: "url".into(), hint: "configure the source URL".into() }.into());
        };
        self.get_by_url(fetcher, &url).await
    }

    /// Latest content, re-fetched from `url` when stale.
    ///
    /// Fetch failures and rejected content are never returned as errors: the
    /// last stored content is served instead and the expiration is pushed to
    /// the next boundary. Only storage failures propagate, plus `InvalidUrl`
    /// when `url` is not the configured source URL.
    pub async fn get_by_url(&mut self, fetcher: &dyn Fetcher, url: &str) -> Result<Option<String>, Error> {
        if let Some(source) = &self.config.url
            && key_for_url(source) != key_for_url(url)
        {
            return Err(Error::InvalidUrl(format!("{} is not this cache's source {}", url, source)));
        }

        let now = self.clock.now();
        let record = self.record()?;
        let last = self.read_state(record.history.first())?;

        if now < record.expire_time && last.is_some() {
            tracing::debug!(key = %self.key, "serving fresh content");
            return Ok(last);
        }

        if self.is_rate_limited(now) {
            tracing::info!(key = %self.key, "source rate limit nearly spent; serving last content");
            self.increment(now)?;
            return Ok(last);
        }

        match self.fetch_fresh(fetcher, url, last.as_deref(), now).await? {
            Some(outcome) => {
                let record = self.record()?;
                let meta = StateMeta { status_code: Some(outcome.status), headers: outcome.headers, extra: Map::new() };
                self.store(record, &outcome.body, meta, now)?;
                Ok(Some(outcome.body))
            }
            None => {
                self.increment(now)?;
                Ok(last)
            }
        }
    }

    /// Fetch with optional retry, returning the outcome worth storing.
    ///
    /// With retry enabled a second attempt is made when the first is empty or
    /// identical to `last`. This is best-effort: a source that returns the same
    /// valid content twice is simply stored again.
    async fn fetch_fresh(
        &self, fetcher: &dyn Fetcher, url: &str, last: Option<&str>, now: i64,
    ) -> Result<Option<FetchOutcome>, Error> {
        let attempts = if self.config.retry { FETCH_ATTEMPTS } else { 1 };
        let mut best: Option<FetchOutcome> = None;

        for attempt in 1..=attempts {
            if !self.acquire_request_slot(url, now)? {
                break;
            }

            match fetcher.fetch(url).await {
                Ok(outcome) if outcome.is_success() => {
                    let changed = !outcome.body.is_empty() && Some(outcome.body.as_str()) != last;
                    tracing::debug!(attempt, status = outcome.status, changed, "fetched {} ({} bytes)", url, outcome.body.len());
                    if best.is_none() || !outcome.body.is_empty() {
                        best = Some(outcome);
                    }
                    if changed {
                        break;
                    }
                }
                Ok(outcome) => {
                    tracing::warn!(attempt, status = outcome.status, "fetch of {} failed", url);
                }
                Err(e) if e.is_fetch_error() => {
                    tracing::warn!(attempt, "fetch of {} failed: {}", url, e);
                }
                Err(e) => {
                    tracing::warn!(attempt, "fetcher for {} reported an unexpected error: {}", url, e);
                }
            }
        }

        Ok(best.filter(|outcome| self.accepts(&outcome.body)))
    }

    fn acquire_request_slot(&self, url: &str, now: i64) -> Result<bool, Error> {
        match (&self.request_log, self.config.request_limit) {
            (Some(log), Some(limit)) => log.try_acquire(url, limit, localize(now, self.tz)),
            _ => Ok(true),
        }
    }

    /// Whether fetched content may be stored.
    fn accepts(&self, body: &str) -> bool {
        if body.is_empty() && !self.config.store_empty {
            tracing::debug!(key = %self.key, "rejecting empty content");
            return false;
        }

        if let Some(pattern) = &self.must_match
            && !pattern.is_match(body)
        {
            tracing::warn!(key = %self.key, "content does not match must_match; discarding");
            return false;
        }

        if let Some(pattern) = &self.must_not_match
            && pattern.is_match(body)
        {
            tracing::warn!(key = %self.key, "content matches must_not_match; discarding");
            return false;
        }

        true
    }

    /// Whether the most recent response reported a nearly spent rate limit that
    /// has not reset yet. Reads the catalog from disk to see other writers.
    fn is_rate_limited(&mut self, now: i64) -> bool {
        let Some(policy) = &self.config.rate_limit else {
            return false;
        };

        self.catalog.refresh();
        let Some(last) = self.catalog.record().and_then(|r| r.history.into_iter().next()) else {
            return false;
        };

        let remaining = last.header(&policy.remaining_header).and_then(|v| v.trim().parse::<i64>().ok());
        let reset = last.header(&policy.reset_header).and_then(|v| parse_reset_time(v, last.time));

        match (remaining, reset) {
            (Some(remaining), Some(reset)) => {
                remaining <= i64::try_from(policy.reserve).unwrap_or(i64::MAX) && now < reset
            }
            _ => {
                tracing::debug!(key = %self.key, "rate-limit headers absent from last state");
                false
            }
        }
    }

    /// Push `expireTime` to the next boundary without recording history.
    fn increment(&mut self, now: i64) -> Result<(), Error> {
        let expire_time = next_expire(self.expire, self.config.offset, localize(now, self.tz));
        tracing::debug!(key = %self.key, expire_time, "incrementing expiration");
        self.catalog.apply(&CatalogPatch { expire_time: Some(expire_time), ..Default::default() })
    }

    /// Write a history file, record it, and prune.
    ///
    /// The catalog is merged once; files are deleted only after that merge
    /// succeeds so the catalog never references a missing file.
    fn store(&mut self, record: CatalogRecord, contents: &str, meta: StateMeta, now: i64) -> Result<(), Error> {
        self.storage.create_dir(&self.path)?;
        let file_path = self.storage.available_path(&self.path);
        let file = file_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        self.storage.write(&file_path, contents.as_bytes())?;

        let mut history = record.history;
        let dropped = push_front(&mut history, meta.into_state(file, now), self.config.history_limit);

        let local = localize(now, self.tz);
        let cleanup_due = now >= record.cleanup_time;
        let patch = CatalogPatch {
            expire_time: Some(next_expire(self.expire, self.config.offset, local)),
            cleanup_time: cleanup_due.then(|| next_cleanup(self.config.cleanup_hour, local)),
            history: Some(history),
        };
        self.catalog.apply(&patch)?;
        tracing::info!(key = %self.key, bytes = contents.len(), "stored new history state");

        for state in &dropped {
            self.storage.delete_file(&self.path.join(&state.file))?;
        }

        if cleanup_due {
            self.cleanup()?;
        }

        Ok(())
    }

    /// Delete every visible file in the cache directory that the retained
    /// history does not reference. Returns the number of files removed.
    pub fn cleanup(&mut self) -> Result<usize, Error> {
        self.catalog.refresh();
        let Some(record) = self.catalog.record() else {
            tracing::warn!(key = %self.key, "skipping cleanup: catalog unreadable");
            return Ok(0);
        };

        let present = self.storage.list_files(&self.path)?;
        let orphans = orphaned_files(&present, &record.history);
        for name in &orphans {
            self.storage.delete_file(&self.path.join(name))?;
        }

        if !orphans.is_empty() {
            tracing::info!(key = %self.key, removed = orphans.len(), "cleaned up unreferenced history files");
        }

        Ok(orphans.len())
    }

    /// Mark the current content as expired.
    pub fn invalidate(&mut self) -> Result<(), Error> {
        self.catalog.set("expireTime", json!(0))
    }

    /// Delete the cache directory, catalog and all history.
    pub fn clear(self) -> Result<bool, Error> {
        self.storage.delete_dir(&self.path)
    }
}
