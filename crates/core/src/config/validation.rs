//! Configuration validation rules.
//!
//! This module provides validation logic for `CacheConfig` values
//! after they have been loaded from environment, files, or defaults.

use std::path::{Component, Path};

use chrono::FixedOffset;
use regex::Regex;
use thiserror::Error;

use crate::clock::Expire;
use crate::config::CacheConfig;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

/// Compile an optional content pattern, naming the field on failure.
pub(crate) fn compile_pattern(field: &str, pattern: Option<&str>) -> Result<Option<Regex>, ConfigError> {
    pattern
        .map(|p| Regex::new(p).map_err(|e| ConfigError::Invalid { field: field.into(), reason: e.to_string() }))
        .transpose()
}

impl CacheConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if neither `key` nor `url` is set, and
    /// `ConfigError::Invalid` if:
    /// - `key` is empty or escapes the container
    /// - `history_limit` is 0
    /// - `expire` is empty
    /// - `must_match` or `must_not_match` is not a valid regular expression
    /// - `utc_offset_secs` is a day or more
    /// - `cleanup_hour` is past 23
    /// - `rate_limit` names an empty header
    /// - `request_limit` is 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.key, &self.url) {
            (None, None) => {
                return Err(ConfigError::Missing {
                    field: "key".into(),
                    hint: "set `key`, or `url` to derive one".into(),
                });
            }
            (Some(key), _) => validate_key(key)?,
            (None, Some(url)) if url.trim().is_empty() => {
                return Err(ConfigError::Invalid { field: "url".into(), reason: "must not be empty".into() });
            }
            _ => {}
        }

        if self.history_limit == 0 {
            return Err(ConfigError::Invalid { field: "history_limit".into(), reason: "must be at least 1".into() });
        }

        if self.expire.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "expire".into(), reason: "must not be empty".into() });
        }
        if !Expire::is_known(&self.expire) {
            tracing::warn!(expire = %self.expire, "Unrecognized expire keyword; falling back to nightly");
        }

        compile_pattern("must_match", self.must_match.as_deref())?;
        compile_pattern("must_not_match", self.must_not_match.as_deref())?;

        if FixedOffset::east_opt(self.utc_offset_secs).is_none() {
            return Err(ConfigError::Invalid {
                field: "utc_offset_secs".into(),
                reason: "must be strictly between -86400 and 86400".into(),
            });
        }

        if self.cleanup_hour > 23 {
            return Err(ConfigError::Invalid { field: "cleanup_hour".into(), reason: "must be 0-23".into() });
        }

        if let Some(rate_limit) = &self.rate_limit
            && (rate_limit.remaining_header.trim().is_empty() || rate_limit.reset_header.trim().is_empty())
        {
            return Err(ConfigError::Invalid {
                field: "rate_limit".into(),
                reason: "header names must not be empty".into(),
            });
        }

        if self.request_limit == Some(0) {
            return Err(ConfigError::Invalid { field: "request_limit".into(), reason: "must be at least 1".into() });
        }

        Ok(())
    }
}

/// A key is a relative path of plain components so it stays inside the container.
fn validate_key(key: &str) -> Result<(), ConfigError> {
    if key.trim().is_empty() {
        return Err(ConfigError::Invalid { field: "key".into(), reason: "must not be empty".into() });
    }

    if !Path::new(key).components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(ConfigError::Invalid {
            field: "key".into(),
            reason: "must be a relative path without `.` or `..` segments".into(),
        });
    }

    Ok(())
}
