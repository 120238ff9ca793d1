//! Cache configuration with layered loading.
//!
//! A [`CacheConfig`] is a closed set of typed fields. Unknown keys are rejected
//! when loading through figment, and [`CacheConfig::validate`] runs before any
//! cache touches the filesystem.
//!
//! Loading precedence for [`CacheConfig::load`] (highest wins):
//!
//! 1. Environment variables (WAYBACK_*)
//! 2. TOML config file (if WAYBACK_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;
pub(crate) use validation::compile_pattern;

/// Header names used by the rate-limit guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Response header carrying the number of requests remaining.
    pub remaining_header: String,

    /// Response header carrying the time the limit resets.
    pub reset_header: String,

    /// Stop fetching once remaining drops to this many requests.
    #[serde(default = "default_reserve")]
    pub reserve: u64,
}

impl RateLimitConfig {
    pub fn new(remaining_header: impl Into<String>, reset_header: impl Into<String>) -> Self {
        Self { remaining_header: remaining_header.into(), reset_header: reset_header.into(), reserve: default_reserve() }
    }
}

/// Configuration for one cache instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache identifier, also the directory below `container`.
    #[serde(default)]
    pub key: Option<String>,

    /// Source URL. When `key` is absent the key is derived from this URL.
    #[serde(default)]
    pub url: Option<String>,

    /// Root directory for all caches.
    #[serde(default = "default_container")]
    pub container: PathBuf,

    /// Expiration keyword or a number of seconds.
    #[serde(default = "default_expire")]
    pub expire: String,

    /// Seconds added to every computed expiration.
    #[serde(default)]
    pub offset: i64,

    /// Fetched content must match this pattern to be stored.
    #[serde(default)]
    pub must_match: Option<String>,

    /// Fetched content must not match this pattern to be stored.
    #[serde(default)]
    pub must_not_match: Option<String>,

    /// Number of history states to retain.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Make a second fetch attempt when the first is empty or unchanged.
    #[serde(default)]
    pub retry: bool,

    /// Accept empty bodies as valid content.
    #[serde(default)]
    pub store_empty: bool,

    /// Delete the cache directory before loading.
    #[serde(default)]
    pub clear: bool,

    /// Treat a change of `container` as a configuration change.
    #[serde(default)]
    pub fingerprint_container: bool,

    /// Offset from UTC, in seconds, used for calendar boundaries.
    #[serde(default)]
    pub utc_offset_secs: i32,

    /// Hours past midnight at which history cleanup becomes due.
    #[serde(default)]
    pub cleanup_hour: u32,

    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// Daily request budget per domain, shared by the container.
    #[serde(default)]
    pub request_limit: Option<u32>,
}

fn default_container() -> PathBuf {
    PathBuf::from("cache")
}

fn default_expire() -> String {
    "nightly".into()
}

fn default_history_limit() -> usize {
    10
}

fn default_reserve() -> u64 {
    10
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key: None,
            url: None,
            container: default_container(),
            expire: default_expire(),
            offset: 0,
            must_match: None,
            must_not_match: None,
            history_limit: default_history_limit(),
            retry: false,
            store_empty: false,
            clear: false,
            fingerprint_container: false,
            utc_offset_secs: 0,
            cleanup_hour: 0,
            rate_limit: None,
            request_limit: None,
        }
    }
}

impl CacheConfig {
    /// Configuration for an explicitly keyed cache.
    pub fn keyed(key: impl Into<String>) -> Self {
        Self { key: Some(key.into()), ..Default::default() }
    }

    /// Configuration for a cache keyed by its source URL.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self { url: Some(url.into()), ..Default::default() }
    }

    /// Defaults layered under an optional TOML file and `WAYBACK_*` environment variables.
    ///
    /// Reading the environment happens only here; nothing else in the crate
    /// consults process state.
    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("WAYBACK_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment.merge(
            Env::prefixed("WAYBACK_")
                .ignore(&["config_file"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        )
    }

    /// Extract and validate configuration from any figment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::LoadFailed` for unknown keys or mistyped values,
    /// and the validation error otherwise.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from all sources with layered precedence.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }
}
