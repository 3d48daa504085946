//! Source jobs: one per bookmaker.
//!
//! A `FeedJob` walks its feeds, fetches each through the shared
//! `FetchClient`, hands the JSON to its mapper and stores every valid
//! snapshot. Jobs are built once at startup into a `SourceRegistry`
//! keyed by source key; nothing resolves jobs by name after that.

pub mod mappers;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, SourceConfig};
use crate::fetch::FetchClient;
use crate::storage::QuoteStore;
use crate::types::LinewatchError;
use mappers::{build_mapper, FeedContext, Mapper, MapperSettings};

/// Header carrying API credentials.
const API_KEY_HEADER: &str = "x-api-key";

/// Anything the scheduler can run once. Returns the number of items
/// processed; an error marks the run as failed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceJob: Send + Sync {
    async fn run_once(&self) -> Result<usize, LinewatchError>;
}

/// A feed with its URL and league already resolved.
#[derive(Debug, Clone)]
pub struct Feed {
    pub url: String,
    pub sport: String,
    pub league: String,
    pub markets: Vec<String>,
}

/// Per-run outcome across all feeds of a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub feeds_ok: usize,
    pub feeds_unchanged: usize,
    pub feeds_failed: usize,
    pub snapshots_mapped: usize,
    pub snapshots_invalid: usize,
    pub snapshots_stored: usize,
    pub store_errors: usize,
}

pub struct FeedJob {
    key: String,
    feeds: Vec<Feed>,
    no_cache: bool,
    timeout: Option<Duration>,
    api_key: Option<SecretString>,
    client: Arc<FetchClient>,
    mapper: Box<dyn Mapper>,
    store: Arc<dyn QuoteStore>,
}

impl FeedJob {
    pub fn new(
        key: impl Into<String>,
        feeds: Vec<Feed>,
        client: Arc<FetchClient>,
        mapper: Box<dyn Mapper>,
        store: Arc<dyn QuoteStore>,
    ) -> Self {
        Self {
            key: key.into(),
            feeds,
            no_cache: false,
            timeout: None,
            api_key: None,
            client,
            mapper,
            store,
        }
    }

    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_api_key(mut self, api_key: Option<SecretString>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn feeds(&self) -> &[Feed] {
        &self.feeds
    }

    fn request_headers(&self) -> Result<HeaderMap, LinewatchError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &self.api_key {
            let mut value = HeaderValue::from_str(key.expose_secret())
                .map_err(|_| LinewatchError::Config(format!("source {}: API key is not a valid header", self.key)))?;
            value.set_sensitive(true);
            headers.insert(HeaderName::from_static(API_KEY_HEADER), value);
        }
        Ok(headers)
    }

    /// Run every feed once and report what happened. Fails only when every
    /// feed failed at the fetch or parse stage.
    pub async fn run_with_stats(&self) -> Result<RunStats, LinewatchError> {
        let headers = self.request_headers()?;
        let mut stats = RunStats::default();
        let mut first_failure = None;
        let mut first_skip = None;

        for feed in &self.feeds {
            match self.run_feed(feed, &headers, &mut stats).await {
                Ok(()) => {}
                Err(e) if e.is_skip() => {
                    debug!(job = %self.key, url = %feed.url, "Feed skipped: {e}");
                    stats.feeds_failed += 1;
                    first_skip.get_or_insert(e);
                }
                Err(e) => {
                    warn!(job = %self.key, url = %feed.url, error = %e, "Feed failed");
                    stats.feeds_failed += 1;
                    first_failure.get_or_insert(e);
                }
            }
        }

        info!(
            job = %self.key,
            feeds_ok = stats.feeds_ok,
            unchanged = stats.feeds_unchanged,
            failed = stats.feeds_failed,
            stored = stats.snapshots_stored,
            invalid = stats.snapshots_invalid,
            store_errors = stats.store_errors,
            "Source run complete"
        );

        // A run is a skip only when every feed was skipped; one real
        // failure among them makes it a failure.
        if !self.feeds.is_empty() && stats.feeds_failed == self.feeds.len() {
            if let Some(e) = first_failure.or(first_skip) {
                return Err(e);
            }
        }
        Ok(stats)
    }

    async fn run_feed(
        &self,
        feed: &Feed,
        headers: &HeaderMap,
        stats: &mut RunStats,
    ) -> Result<(), LinewatchError> {
        let response = self
            .client
            .fetch_with_headers(&feed.url, self.timeout, self.no_cache, headers)
            .await?;

        if response.is_unchanged() || response.body.is_empty() {
            debug!(job = %self.key, url = %feed.url, "Feed unchanged");
            stats.feeds_unchanged += 1;
            return Ok(());
        }

        let payload: serde_json::Value =
            serde_json::from_slice(&response.body).map_err(|e| LinewatchError::Parse {
                context: feed.url.clone(),
                message: e.to_string(),
            })?;

        let ctx = FeedContext {
            bookmaker: self.key.clone(),
            sport: feed.sport.clone(),
            league: feed.league.clone(),
            source_url: feed.url.clone(),
            spider_version: self.mapper.version().to_string(),
            captured_at: Utc::now(),
            http_status: Some(response.status),
            markets: feed.markets.clone(),
        };

        let snapshots = self.mapper.map(&payload, &ctx);
        stats.feeds_ok += 1;
        stats.snapshots_mapped += snapshots.len();

        for snap in &snapshots {
            if let Err(e) = snap.validate() {
                debug!(job = %self.key, error = %e, "Dropping invalid snapshot");
                stats.snapshots_invalid += 1;
                continue;
            }
            match self.store.insert_snapshot(snap).await {
                Ok(()) => stats.snapshots_stored += 1,
                Err(e) => {
                    warn!(job = %self.key, error = %e, "Failed to store snapshot");
                    stats.store_errors += 1;
                }
            }
        }

        if snapshots.is_empty() {
            info!(job = %self.key, url = %feed.url, sport = %feed.sport, "Feed mapped no snapshots");
        }
        Ok(())
    }
}

#[async_trait]
impl SourceJob for FeedJob {
    async fn run_once(&self) -> Result<usize, LinewatchError> {
        self.run_with_stats().await.map(|s| s.snapshots_stored)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct RegisteredSource {
    pub job: Arc<FeedJob>,
    pub cadence: Duration,
}

/// Jobs constructed at startup, keyed by source key.
#[derive(Default)]
pub struct SourceRegistry {
    pub jobs: BTreeMap<String, RegisteredSource>,
    /// Sources left out, with the reason.
    pub skipped: Vec<(String, String)>,
}

impl SourceRegistry {
    pub fn get(&self, key: &str) -> Option<&RegisteredSource> {
        self.jobs.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }
}

/// Build a job for every enabled source. A source with a configuration
/// problem is skipped with a warning; the rest still run.
pub fn build_registry(
    config: &AppConfig,
    client: Arc<FetchClient>,
    store: Arc<dyn QuoteStore>,
) -> SourceRegistry {
    let mut registry = SourceRegistry::default();
    for source in &config.sources {
        if !source.enabled {
            debug!(source = %source.key, "Source disabled");
            registry.skipped.push((source.key.clone(), "disabled".to_string()));
            continue;
        }
        match build_job(config, source, client.clone(), store.clone()) {
            Ok(job) => {
                let cadence = source.cadence.unwrap_or(config.scheduler.default_cadence);
                info!(
                    source = %source.key,
                    feeds = job.feeds().len(),
                    cadence_s = cadence.as_secs(),
                    no_cache = source.no_cache,
                    "Source registered"
                );
                registry.jobs.insert(
                    source.key.clone(),
                    RegisteredSource {
                        job: Arc::new(job),
                        cadence,
                    },
                );
            }
            Err(e) => {
                warn!(source = %source.key, error = %e, "Source skipped");
                registry.skipped.push((source.key.clone(), e.to_string()));
            }
        }
    }
    registry
}

/// Construct one source's job.
pub fn build_job(
    config: &AppConfig,
    source: &SourceConfig,
    client: Arc<FetchClient>,
    store: Arc<dyn QuoteStore>,
) -> Result<FeedJob, LinewatchError> {
    if source.cadence.is_some_and(|c| c.is_zero()) {
        return Err(LinewatchError::Config(format!(
            "source {}: cadence must be non-zero",
            source.key
        )));
    }
    let mapper = build_mapper(
        source.mapper_name(),
        MapperSettings {
            market_map: source.market_map.clone(),
            unknown_period: config.normalization.unknown_period,
        },
    )?;

    let mut feeds = Vec::with_capacity(source.feeds.len());
    for feed in &source.feeds {
        let (url, league) = feed.resolve(source.api_base.as_deref())?;
        feeds.push(Feed {
            url,
            sport: feed.sport.clone(),
            league,
            markets: feed.markets.clone(),
        });
    }
    if feeds.is_empty() {
        return Err(LinewatchError::Config(format!(
            "source {} has no feeds",
            source.key
        )));
    }

    Ok(FeedJob::new(source.key.clone(), feeds, client, mapper, store)
        .with_no_cache(source.no_cache)
        .with_timeout(source.timeout)
        .with_api_key(source.api_key()?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
