//! Fetch collaborator
//!
//! The orchestrator and leaf updaters never talk to the network directly;
//! they go through a [`Fetcher`]. [`HttpFetcher`] is the production
//! implementation:
//! - per-request timeout
//! - one retry on connection-level failures (connect / timeout), never on
//!   HTTP error statuses
//! - shared [`ResponseCache`] honouring `Cache-Control` and `ETag`

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::FetchConfig;
use crate::error::{Error, Result};

/// A request handed to the fetch collaborator.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    /// Cookie header value, if the source needs one.
    pub cookies: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            headers: BTreeMap::new(),
            body: None,
            cookies: None,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            body: Some(body.into()),
            ..Self::get(url)
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_cookies(mut self, cookies: Option<String>) -> Self {
        self.cookies = cookies;
        self
    }

    fn cacheable(&self) -> bool {
        self.method == Method::GET && self.body.is_none()
    }

    /// URL plus every request header and the cookie string, so requests
    /// that differ in credentials or negotiation never share an entry.
    fn cache_key(&self) -> String {
        let mut headers: Vec<(String, &str)> = self
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
            .collect();
        headers.sort();

        let mut key = self.url.clone();
        for (name, value) in headers {
            key.push_str(&format!("|{name}={value}"));
        }
        if let Some(c) = &self.cookies {
            key.push_str(&format!("|cookie={c}"));
        }
        key
    }
}

/// What came back from a fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
    /// Response headers, names lowercased.
    pub headers: BTreeMap<String, String>,
}

impl FetchResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(self) -> String {
        self.body
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Network access used by the orchestrator and by leaf updaters.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request. HTTP error statuses are returned as responses;
    /// only transport failures are errors.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;
}

#[derive(Debug, Clone)]
struct CachedResponse {
    response: FetchResponse,
    etag: Option<String>,
    fresh_until: Option<Instant>,
}

/// Shared response cache, safe for concurrent readers and writers.
///
/// Entries are fresh for their `max-age`; stale entries with an `ETag` are
/// revalidated with `If-None-Match`. `no-store` responses are never kept.
#[derive(Debug, Clone, Default)]
pub struct ResponseCache {
    entries: Arc<RwLock<HashMap<String, CachedResponse>>>,
    capacity: usize,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    async fn lookup(&self, key: &str) -> Option<CachedResponse> {
        self.entries.read().await.get(key).cloned()
    }

    async fn store(&self, key: String, response: &FetchResponse) {
        if self.capacity == 0 || !response.is_success() {
            return;
        }
        let Some(policy) = CachePolicy::from_response(response) else {
            return;
        };

        let mut entries = self.entries.write().await;
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            // Evict whatever expires first; entries without freshness go first.
            if let Some(victim) = entries
                .iter()
                .min_by_key(|(_, e)| e.fresh_until)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&victim);
            }
        }
        entries.insert(
            key,
            CachedResponse {
                response: response.clone(),
                etag: policy.etag,
                fresh_until: policy.max_age.map(|age| Instant::now() + age),
            },
        );
    }
}

struct CachePolicy {
    max_age: Option<Duration>,
    etag: Option<String>,
}

impl CachePolicy {
    /// `None` when the response must not be stored.
    fn from_response(response: &FetchResponse) -> Option<Self> {
        let cache_control = response.header("cache-control").unwrap_or_default().to_ascii_lowercase();
        let directives: Vec<&str> = cache_control.split(',').map(str::trim).collect();
        if directives.contains(&"no-store") {
            return None;
        }

        let max_age = if directives.contains(&"no-cache") {
            None
        } else {
            directives
                .iter()
                .find_map(|d| d.strip_prefix("max-age="))
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
        };
        let etag = response.header("etag").map(str::to_string);

        if max_age.is_none() && etag.is_none() {
            return None;
        }
        Some(Self { max_age, etag })
    }
}

/// reqwest-backed [`Fetcher`].
pub struct HttpFetcher {
    client: Client,
    cache: ResponseCache,
    retry: bool,
}

impl HttpFetcher {
    /// Create a fetcher from configuration with its own cache.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        Self::with_cache(config, ResponseCache::new(config.cache_capacity))
    }

    /// Create a fetcher that shares `cache` with other fetchers.
    pub fn with_cache(config: &FetchConfig, cache: ResponseCache) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .use_rustls_tls()
            .brotli(true)
            .gzip(true)
            .deflate(true)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(10))
            .cookie_store(true)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            cache,
            retry: config.retry,
        })
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    async fn send(
        &self,
        request: &FetchRequest,
        if_none_match: Option<&str>,
    ) -> std::result::Result<FetchResponse, reqwest::Error> {
        let mut headers = HeaderMap::new();
        for (k, v) in &request.headers {
            if let (Ok(name), Ok(value)) = (HeaderName::try_from(k.as_str()), HeaderValue::try_from(v.as_str())) {
                headers.insert(name, value);
            } else {
                warn!(header = %k, "skipping invalid request header");
            }
        }
        if let Some(cookies) = request.cookies.as_deref().and_then(|c| HeaderValue::try_from(c).ok()) {
            headers.insert(reqwest::header::COOKIE, cookies);
        }
        if let Some(etag) = if_none_match.and_then(|e| HeaderValue::try_from(e).ok()) {
            headers.insert(reqwest::header::IF_NONE_MATCH, etag);
        }

        let mut builder = self.client.request(request.method.clone(), &request.url).headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let response_headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_ascii_lowercase(), v.to_str().ok()?.to_string())))
            .collect();
        let body = response.text().await?;

        Ok(FetchResponse {
            status,
            body,
            headers: response_headers,
        })
    }

    async fn send_with_retry(
        &self,
        request: &FetchRequest,
        if_none_match: Option<&str>,
    ) -> Result<FetchResponse> {
        let attempts = if self.retry { 2 } else { 1 };
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.send(request, if_none_match).await {
                Ok(response) => return Ok(response),
                Err(e) if is_transient(&e) && attempt + 1 < attempts => {
                    warn!(url = %request.url, error = %e, "transient fetch failure, retrying once");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    last_error = Some(e);
                }
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            }
        }

        Err(Error::FetchFailed {
            url: request.url.clone(),
            reason: last_error.map_or_else(|| "unknown fetch error".to_string(), |e| e.to_string()),
        })
    }
}

fn is_transient(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self, request), fields(url = %request.url, method = %request.method))]
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let key = request.cache_key();
        let cached = if request.cacheable() {
            self.cache.lookup(&key).await
        } else {
            None
        };

        if let Some(entry) = &cached {
            if entry.fresh_until.is_some_and(|until| Instant::now() < until) {
                debug!("serving fresh cached response");
                return Ok(entry.response.clone());
            }
        }

        let etag = cached.as_ref().and_then(|e| e.etag.as_deref());
        let response = self.send_with_retry(&request, etag).await?;

        if response.status == 304 {
            if let Some(entry) = cached {
                debug!("cached response revalidated");
                let mut refreshed = entry.response.clone();
                refreshed.headers.extend(response.headers);
                self.cache.store(key, &refreshed).await;
                return Ok(refreshed);
            }
        }

        info!(status = response.status, bytes = response.body.len(), "response received");
        if request.cacheable() {
            self.cache.store(key, &response).await;
        }
        Ok(response)
    }
}

/// Canned-response [`Fetcher`] for replaying recorded pages and for tests.
///
/// Unknown URLs answer 404. Every requested URL is logged in order.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    responses: HashMap<String, FetchResponse>,
    failures: HashMap<String, String>,
    fetch_log: std::sync::Mutex<Vec<String>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_response(mut self, url: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        self.responses.insert(url.into(), FetchResponse::new(status, body));
        self
    }

    /// Make `url` fail at the transport level.
    #[must_use]
    pub fn with_failure(mut self, url: impl Into<String>, reason: impl Into<String>) -> Self {
        self.failures.insert(url.into(), reason.into());
        self
    }

    /// URLs fetched so far.
    pub fn fetch_log(&self) -> Vec<String> {
        self.fetch_log.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        if let Ok(mut log) = self.fetch_log.lock() {
            log.push(request.url.clone());
        }

        if let Some(reason) = self.failures.get(&request.url) {
            return Err(Error::FetchFailed {
                url: request.url,
                reason: reason.clone(),
            });
        }

        Ok(self
            .responses
            .get(&request.url)
            .cloned()
            .unwrap_or_else(|| FetchResponse::new(404, "")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_fetcher_replays_and_logs() {
        let fetcher = MemoryFetcher::new()
            .with_response("https://a/1", 200, "one")
            .with_failure("https://a/down", "connection refused");

        let ok = fetcher.fetch(FetchRequest::get("https://a/1")).await.unwrap();
        assert_eq!(ok.body, "one");
        let missing = fetcher.fetch(FetchRequest::get("https://a/2")).await.unwrap();
        assert_eq!(missing.status, 404);
        let err = fetcher.fetch(FetchRequest::get("https://a/down")).await.unwrap_err();
        assert!(err.is_fetch());

        assert_eq!(fetcher.fetch_log(), vec!["https://a/1", "https://a/2", "https://a/down"]);
    }

    fn response(status: u16, headers: &[(&str, &str)]) -> FetchResponse {
        let mut r = FetchResponse::new(status, "body");
        for (k, v) in headers {
            r.headers.insert((*k).to_string(), (*v).to_string());
        }
        r
    }

    #[test]
    fn request_builders() {
        let req = FetchRequest::get("https://a/b")
            .with_header("Accept", "application/json")
            .with_cookies(Some("sid=1".to_string()));
        assert_eq!(req.method, Method::GET);
        assert!(req.cacheable());
        assert_eq!(req.cache_key(), "https://a/b|accept=application/json|cookie=sid=1");

        let post = FetchRequest::post("https://a/b", "{}");
        assert_eq!(post.method, Method::POST);
        assert!(!post.cacheable());
    }

    #[test]
    fn cache_key_separates_header_sets() {
        let public = FetchRequest::get("https://a/b");
        let authed = FetchRequest::get("https://a/b").with_header("Authorization", "Bearer abc");
        let other = FetchRequest::get("https://a/b").with_header("authorization", "Bearer xyz");
        assert_ne!(public.cache_key(), authed.cache_key());
        assert_ne!(authed.cache_key(), other.cache_key());

        let reordered = FetchRequest::get("https://a/b")
            .with_header("X-Two", "2")
            .with_header("X-One", "1");
        let ordered = FetchRequest::get("https://a/b")
            .with_header("X-One", "1")
            .with_header("X-Two", "2");
        assert_eq!(reordered.cache_key(), ordered.cache_key());
    }

    #[tokio::test]
    async fn cached_entries_are_per_header_set() {
        let cache = ResponseCache::new(8);
        let public = FetchRequest::get("https://a/b");
        let authed = FetchRequest::get("https://a/b").with_header("Authorization", "Bearer abc");

        let mut body = response(200, &[("cache-control", "max-age=60")]);
        body.body = "members only".to_string();
        cache.store(authed.cache_key(), &body).await;

        assert!(cache.lookup(&public.cache_key()).await.is_none());
        let hit = cache.lookup(&authed.cache_key()).await.unwrap();
        assert_eq!(hit.response.body, "members only");
    }

    #[test]
    fn cache_policy_directives() {
        assert!(CachePolicy::from_response(&response(200, &[("cache-control", "no-store")])).is_none());
        assert!(CachePolicy::from_response(&response(200, &[])).is_none());

        let fresh = CachePolicy::from_response(&response(200, &[("cache-control", "public, max-age=60")])).unwrap();
        assert_eq!(fresh.max_age, Some(Duration::from_secs(60)));

        let revalidate = CachePolicy::from_response(&response(
            200,
            &[("cache-control", "no-cache"), ("etag", "\"v1\"")],
        ))
        .unwrap();
        assert_eq!(revalidate.max_age, None);
        assert_eq!(revalidate.etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn cache_stores_and_evicts() {
        let cache = ResponseCache::new(1);
        cache
            .store("a".to_string(), &response(200, &[("cache-control", "max-age=60")]))
            .await;
        assert_eq!(cache.len().await, 1);

        cache
            .store("b".to_string(), &response(200, &[("cache-control", "max-age=120")]))
            .await;
        assert_eq!(cache.len().await, 1);
        assert!(cache.lookup("b").await.is_some());
        assert!(cache.lookup("a").await.is_none());

        cache
            .store("c".to_string(), &response(500, &[("cache-control", "max-age=60")]))
            .await;
        assert!(cache.lookup("c").await.is_none());

        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[test]
    fn response_header_lookup_is_case_insensitive() {
        let r = response(200, &[("content-type", "text/plain")]);
        assert_eq!(r.header("Content-Type"), Some("text/plain"));
        assert!(r.is_success());
        assert!(!FetchResponse::new(404, "").is_success());
    }
}
