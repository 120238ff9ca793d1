//! URL canonicalization and URL-derived cache keys.
//!
//! The same URL always maps to the same directory, and distinct canonical URLs
//! map to distinct SHA-256 digests.

use sha2::{Digest, Sha256};
use url::Url;

use crate::Error;

/// Canonicalize a URL string for consistent keying and fetching.
///
/// Normalization steps:
/// 1. Trim leading/trailing whitespace
/// 2. Default scheme to https:// if missing
/// 3. Lowercase the host
/// 4. Remove fragment (#...)
/// 5. Keep query string intact (do not reorder)
pub fn canonicalize_url(input: &str) -> Result<Url, Error> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidUrl("empty URL".into()));
    }

    let with_scheme = if trimmed.contains("://") { trimmed.to_string() } else { format!("https://{trimmed}") };
    let mut parsed = Url::parse(&with_scheme).map_err(|e| Error::InvalidUrl(e.to_string()))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::InvalidUrl(format!("unsupported scheme: {}", parsed.scheme())));
    }

    if let Some(host) = parsed.host_str().map(str::to_lowercase) {
        parsed.set_host(Some(&host)).map_err(|e| Error::InvalidUrl(e.to_string()))?;
    }
    parsed.set_fragment(None);

    Ok(parsed)
}

/// Compute the cache key for a source URL.
///
/// Unparseable URLs are hashed verbatim (trimmed) so key derivation never fails;
/// the fetch itself reports the bad URL.
pub fn key_for_url(url: &str) -> String {
    let canonical = canonicalize_url(url).map(String::from).unwrap_or_else(|_| url.trim().to_string());

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
