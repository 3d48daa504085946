//! Resilient HTTP fetch layer.
//!
//! `FetchClient::fetch` wraps a GET with per-domain circuit breaking,
//! bounded retries with exponential backoff, and two caching modes:
//!
//! - **cached**: replays the last `ETag` as `If-None-Match`; a 304 comes
//!   back as an empty "not modified" response and is not a failure.
//! - **no-cache**: never touches the validator cache, adds a `_ts`
//!   cache-busting query parameter and `Cache-Control: no-cache`, for
//!   feeds that must reflect live state through CDNs.
//!
//! Before the first request to an origin the client reads its
//! `robots.txt` and refuses paths it disallows for our user agent.
//!
//! The client returns raw status, headers and body. Parsing belongs to
//! the source job and its mapper.

pub mod circuit;
pub mod robots;
pub mod validators;

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, ETAG, IF_NONE_MATCH, PRAGMA, USER_AGENT};
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, warn};

pub use circuit::{CircuitBreaker, CircuitConfig};
pub use robots::{RobotsCache, RobotsRules};
pub use validators::ValidatorCache;

use crate::types::LinewatchError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Status codes treated as transient: retried and counted against the breaker.
const TRANSIENT_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// Query parameter used to defeat intermediary caches in no-cache mode.
const CACHE_BUST_PARAM: &str = "_ts";

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    /// Default per-request timeout when the caller passes none.
    pub timeout: Duration,
    /// Total attempts per fetch, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Check each origin's robots.txt before fetching from it.
    pub respect_robots: bool,
    /// How long a fetched robots.txt stays cached.
    pub robots_ttl: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("linewatch/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            respect_robots: true,
            robots_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors and responses
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Network error ({url}): {message}")]
    Network { url: String, message: String },

    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    #[error("Circuit open for {domain}")]
    CircuitOpen { domain: String },

    #[error("Invalid URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("robots.txt disallows {url}")]
    Disallowed { url: String },
}

impl From<FetchError> for LinewatchError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Network { url, message } => LinewatchError::Network { url, message },
            FetchError::Http { url, status } => LinewatchError::Http { url, status },
            FetchError::CircuitOpen { domain } => LinewatchError::CircuitOpen { domain },
            FetchError::InvalidUrl { url, message } => {
                LinewatchError::Config(format!("invalid feed URL {url}: {message}"))
            }
            FetchError::Disallowed { url } => {
                LinewatchError::Config(format!("robots.txt disallows {url}"))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HeaderMap,
    /// Empty when `not_modified` is set.
    pub body: Vec<u8>,
    /// The URL as requested by the caller (without cache-busting params).
    pub url: String,
    pub not_modified: bool,
}

impl FetchResponse {
    /// True when the server confirmed our cached copy is still current.
    pub fn is_unchanged(&self) -> bool {
        self.not_modified
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct FetchClient {
    http: Client,
    breaker: Arc<CircuitBreaker>,
    validators: Arc<ValidatorCache>,
    robots: RobotsCache,
    config: FetchConfig,
}

impl FetchClient {
    pub fn new(
        config: FetchConfig,
        breaker: Arc<CircuitBreaker>,
        validators: Arc<ValidatorCache>,
    ) -> Result<Self, LinewatchError> {
        let mut headers = HeaderMap::new();
        let ua = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| LinewatchError::Config(format!("invalid user agent: {e}")))?;
        headers.insert(USER_AGENT, ua);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, */*;q=0.8"));

        let http = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| LinewatchError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            breaker,
            validators,
            robots: RobotsCache::new(config.robots_ttl),
            config,
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn validators(&self) -> &ValidatorCache {
        &self.validators
    }

    pub fn robots(&self) -> &RobotsCache {
        &self.robots
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// GET `url`. See the module docs for the caching modes.
    pub async fn fetch(
        &self,
        url: &str,
        timeout: Option<Duration>,
        no_cache: bool,
    ) -> Result<FetchResponse, FetchError> {
        self.fetch_with_headers(url, timeout, no_cache, &HeaderMap::new())
            .await
    }

    /// GET `url` with extra request headers (credentials and the like).
    pub async fn fetch_with_headers(
        &self,
        url: &str,
        timeout: Option<Duration>,
        no_cache: bool,
        extra: &HeaderMap,
    ) -> Result<FetchResponse, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let domain = domain_of(&parsed).ok_or_else(|| FetchError::InvalidUrl {
            url: url.to_string(),
            message: "URL has no host".to_string(),
        })?;
        let timeout = timeout.unwrap_or(self.config.timeout);
        let attempts = self.config.max_attempts.max(1);

        if !self.breaker.allow(&domain) {
            debug!(url, domain = %domain, "Circuit open, skipping fetch");
            return Err(FetchError::CircuitOpen { domain });
        }
        if self.config.respect_robots && !self.robots_allow(&parsed, timeout).await {
            warn!(url, "Disallowed by robots.txt");
            return Err(FetchError::Disallowed {
                url: url.to_string(),
            });
        }

        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = self.retry_delay(attempt - 1);
                debug!(url, attempt, delay_ms = delay.as_millis() as u64, "Retrying fetch");
                tokio::time::sleep(delay).await;
            }

            // Checked before every attempt. A circuit that opens mid-retry
            // stops the remaining attempts but surfaces the failure that
            // tripped it; only a fetch that never went out is a skip.
            if !self.breaker.allow(&domain) {
                if let Some(e) = last_error.take() {
                    debug!(url, domain = %domain, attempt, "Circuit opened mid-retry, giving up");
                    return Err(e);
                }
                debug!(url, domain = %domain, "Circuit open, skipping fetch");
                return Err(FetchError::CircuitOpen { domain });
            }

            let request = self.build_request(&parsed, url, timeout, no_cache, extra);
            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(url, attempt, error = %e, "Fetch failed");
                    self.breaker.record_failure(&domain);
                    last_error = Some(FetchError::Network {
                        url: url.to_string(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let status = response.status();

            if status == StatusCode::NOT_MODIFIED && !no_cache {
                debug!(url, "Not modified");
                return Ok(FetchResponse {
                    status: status.as_u16(),
                    headers: response.headers().clone(),
                    body: Vec::new(),
                    url: url.to_string(),
                    not_modified: true,
                });
            }

            if TRANSIENT_STATUSES.contains(&status.as_u16()) {
                warn!(url, attempt, status = status.as_u16(), "Transient HTTP status");
                self.breaker.record_failure(&domain);
                last_error = Some(FetchError::Http {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
                continue;
            }

            if !status.is_success() {
                return Err(FetchError::Http {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }

            let headers = response.headers().clone();
            let body = match response.bytes().await {
                Ok(b) => b.to_vec(),
                Err(e) => {
                    warn!(url, attempt, error = %e, "Failed reading response body");
                    self.breaker.record_failure(&domain);
                    last_error = Some(FetchError::Network {
                        url: url.to_string(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            if !no_cache {
                if let Some(token) = headers.get(ETAG).and_then(|v| v.to_str().ok()) {
                    // A lost validator only costs a full download next time.
                    if let Err(e) = self.validators.store(url, token) {
                        warn!(url, error = %e, "Failed to persist validator cache");
                    }
                }
            }

            debug!(url, status = status.as_u16(), bytes = body.len(), "Fetched");
            return Ok(FetchResponse {
                status: status.as_u16(),
                headers,
                body,
                url: url.to_string(),
                not_modified: false,
            });
        }

        Err(last_error.unwrap_or_else(|| FetchError::Network {
            url: url.to_string(),
            message: "no attempts made".to_string(),
        }))
    }

    /// Whether robots.txt lets us fetch `url`. Fetched once per origin and
    /// cached. 401/403 disallow everything, other 4xx allow everything. An
    /// unreachable robots.txt is not cached and does not block the fetch;
    /// the fetch itself then reports what is wrong with the host.
    async fn robots_allow(&self, url: &Url, timeout: Duration) -> bool {
        let origin = url.origin().ascii_serialization();
        let mut path = url.path().to_string();
        if let Some(q) = url.query() {
            path.push('?');
            path.push_str(q);
        }

        if let Some(rules) = self.robots.get(&origin) {
            return rules.allows(&path);
        }

        let robots_url = format!("{origin}/robots.txt");
        let rules = match self.http.get(&robots_url).timeout(timeout).send().await {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => RobotsRules::parse(&body, &self.config.user_agent),
                Err(e) => {
                    debug!(url = %robots_url, error = %e, "robots.txt body unreadable");
                    return true;
                }
            },
            Ok(resp) if matches!(resp.status().as_u16(), 401 | 403) => RobotsRules::disallow_all(),
            Ok(resp) if resp.status().is_client_error() => RobotsRules::allow_all(),
            Ok(resp) => {
                debug!(url = %robots_url, status = resp.status().as_u16(), "robots.txt unavailable");
                return true;
            }
            Err(e) => {
                debug!(url = %robots_url, error = %e, "robots.txt unreachable");
                return true;
            }
        };
        self.robots.insert(&origin, rules).allows(&path)
    }

    fn build_request(
        &self,
        parsed: &Url,
        url: &str,
        timeout: Duration,
        no_cache: bool,
        extra: &HeaderMap,
    ) -> reqwest::RequestBuilder {
        let mut target = parsed.clone();
        let mut headers = extra.clone();

        if no_cache {
            let ts = chrono::Utc::now().timestamp_millis().to_string();
            target.query_pairs_mut().append_pair(CACHE_BUST_PARAM, &ts);
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        } else if let Some(token) = self.validators.get(url) {
            if let Ok(value) = HeaderValue::from_str(&token) {
                headers.insert(IF_NONE_MATCH, value);
            }
        }

        self.http.get(target).timeout(timeout).headers(headers)
    }

    /// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`
    /// capped at `max_backoff`, plus up to 20% jitter.
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let base = self
            .config
            .base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.config.max_backoff);
        base + Duration::from_millis(jitter_ms(base))
    }
}

/// Up to 20% of `base`, seeded from the clock's sub-second nanos.
fn jitter_ms(base: Duration) -> u64 {
    let range = (base.as_millis() as u64) / 5;
    if range == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos as u64) % (range + 1)
}

/// Breaker key for a URL: host plus explicit port if any.
pub fn domain_of(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
