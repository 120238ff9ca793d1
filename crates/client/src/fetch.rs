//! reqwest-backed HTTP fetcher for the wayback cache.
//!
//! ### Requests
//! - URLs are canonicalized the same way cache keys are derived
//! - Max redirects: 5
//! - Max body bytes: 5MB (configurable)
//! - Optional HTTP basic auth
//!
//! ### Outcomes
//! - Any completed response becomes a [`FetchOutcome`], including 4xx/5xx;
//!   the cache decides what counts as success.
//! - Network failures, timeouts and oversized bodies are errors.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::{Client, StatusCode, header};
use url::Url;

use wayback_core::cache::canonicalize_url;
use wayback_core::{Error, FetchOutcome, Fetcher};

/// Configuration for the fetch client.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent string (default: "wayback/0.1")
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 5MB)
    pub max_bytes: usize,

    /// Request timeout (default: 10s)
    pub timeout: Duration,

    /// Maximum number of redirects to follow (default: 5)
    pub max_redirects: usize,

    /// Username and optional password sent as HTTP basic auth.
    pub basic_auth: Option<(String, Option<String>)>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "wayback/0.1".to_string(),
            max_bytes: 5 * 1024 * 1024,
            timeout: Duration::from_millis(10000),
            max_redirects: 5,
            basic_auth: None,
        }
    }
}

/// Raw response from a fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// The canonicalized URL requested
    pub url: Url,
    /// The final URL after redirects
    pub final_url: Url,
    /// HTTP status code
    pub status: StatusCode,
    /// Response headers
    pub headers: header::HeaderMap,
    /// Response body bytes
    pub bytes: Bytes,
    /// Time taken to fetch in milliseconds
    pub fetch_ms: u64,
}

impl FetchResponse {
    /// Flatten into the cache's outcome type. Header names are lowercased and
    /// non-UTF-8 header values are skipped; the body is decoded lossily.
    pub fn into_outcome(self) -> FetchOutcome {
        let headers: BTreeMap<String, String> = self
            .headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_ascii_lowercase(), v.to_string())))
            .collect();

        FetchOutcome { status: self.status.as_u16(), headers, body: String::from_utf8_lossy(&self.bytes).into_owned() }
    }
}

/// HTTP client implementing [`Fetcher`].
pub struct FetchClient {
    http: Client,
    config: FetchConfig,
}

impl FetchClient {
    /// Create a new fetch client with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| Error::HttpError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }

    /// Fetch a URL, returning raw bytes and metadata.
    ///
    /// Non-success statuses are returned, not treated as errors.
    pub async fn fetch_raw(&self, url_str: &str) -> Result<FetchResponse, Error> {
        let start = Instant::now();
        let url = canonicalize_url(url_str)?;

        let mut request = self.http.get(url.as_str());
        if let Some((user, password)) = &self.config.basic_auth {
            request = request.basic_auth(user, password.as_ref());
        }

        let response = request.send().await.map_err(|e| self.request_error(&url, &e))?;
        let status = response.status();

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_bytes
        {
            return Err(Error::FetchTooLarge(format!("{} bytes exceeds {}", len, self.config.max_bytes)));
        }

        let final_url = response.url().clone();
        let headers = response.headers().clone();

        let bytes = response.bytes().await.map_err(|e| self.request_error(&url, &e))?;

        if bytes.len() > self.config.max_bytes {
            return Err(Error::FetchTooLarge(format!("{} bytes exceeds {}", bytes.len(), self.config.max_bytes)));
        }

        let fetch_ms = start.elapsed().as_millis() as u64;

        tracing::debug!(
            "fetched {} -> {} in {}ms (status {}, {} bytes)",
            url,
            final_url,
            fetch_ms,
            status.as_u16(),
            bytes.len()
        );

        Ok(FetchResponse { url, final_url, status, headers, bytes, fetch_ms })
    }

    fn request_error(&self, url: &Url, e: &reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::FetchTimeout(format!("{} after {:?}", url, self.config.timeout))
        } else {
            Error::HttpError(format!("network error: {}", e))
        }
    }

    /// Get reference to the configuration.
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl Fetcher for FetchClient {
    async fn fetch(&self, url: &str) -> Result<FetchOutcome, Error> {
        Ok(self.fetch_raw(url).await?.into_outcome())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response on a local port and return its URL.
    /// The spawned task resolves to the raw request it received.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        (format!("http://{addr}/data#section"), handle)
    }

    #[test]
    fn test_fetch_config_default() {
        let config = FetchConfig::default();
        assert_eq!(config.user_agent, "wayback/0.1");
        assert_eq!(config.max_bytes, 5 * 1024 * 1024);
        assert_eq!(config.timeout, Duration::from_millis(10000));
        assert_eq!(config.max_redirects, 5);
        assert!(config.basic_auth.is_none());
    }

    #[test]
    fn test_into_outcome() {
        let mut headers = header::HeaderMap::new();
        headers.insert("x-ratelimit-remaining", header::HeaderValue::from_static("42"));

        let response = FetchResponse {
            url: Url::parse("https://example.com").unwrap(),
            final_url: Url::parse("https://example.com/").unwrap(),
            status: StatusCode::NOT_FOUND,
            headers,
            bytes: Bytes::from_static(b"missing"),
            fetch_ms: 3,
        };

        let outcome = response.into_outcome();
        assert_eq!(outcome.status, 404);
        assert_eq!(outcome.body, "missing");
        assert_eq!(outcome.headers.get("x-ratelimit-remaining").map(String::as_str), Some("42"));
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_fetch_client_new() {
        assert!(FetchClient::new(FetchConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_fetch_returns_body_and_headers() {
        let (url, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-RateLimit-Remaining: 42\r\nConnection: close\r\n\r\nsunny",
        )
        .await;
        let client = FetchClient::new(FetchConfig::default()).unwrap();

        let outcome = client.fetch(&url).await.unwrap();
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body, "sunny");
        assert_eq!(outcome.headers.get("x-ratelimit-remaining").map(String::as_str), Some("42"));

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /data HTTP/1.1"));
        assert!(request.contains("user-agent: wayback/0.1"));
    }

    #[tokio::test]
    async fn test_fetch_error_status_is_an_outcome() {
        let (url, _server) =
            serve_once("HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbusy").await;
        let client = FetchClient::new(FetchConfig::default()).unwrap();

        let outcome = client.fetch(&url).await.unwrap();
        assert_eq!(outcome.status, 503);
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_fetch_sends_basic_auth() {
        let (url, server) = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await;
        let config = FetchConfig { basic_auth: Some(("user".into(), Some("pass".into()))), ..Default::default() };
        let client = FetchClient::new(config).unwrap();

        client.fetch(&url).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.contains("authorization: Basic dXNlcjpwYXNz"));
    }

    #[tokio::test]
    async fn test_fetch_too_large() {
        let (url, _server) =
            serve_once("HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello world").await;
        let client = FetchClient::new(FetchConfig { max_bytes: 4, ..Default::default() }).unwrap();

        let result = client.fetch(&url).await;
        assert!(matches!(result, Err(Error::FetchTooLarge(_))));
    }

    #[tokio::test]
    async fn test_fetch_invalid_url() {
        let client = FetchClient::new(FetchConfig::default()).unwrap();
        let result = client.fetch("ftp://example.com/file").await;
        assert!(matches!(result, Err(Error::InvalidUrl(_))));
    }
}
