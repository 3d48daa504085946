//! Persistence layer.
//!
//! `QuoteStore` is the document-store seam: append snapshots and hits,
//! range-query recent quotes, and expire old rows. `SqliteStore` is the
//! production backend; `MemoryStore` backs tests and dry runs.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::info;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::sources::SourceJob;
use crate::types::{Hit, LinewatchError, MarketKind, Snapshot};

/// Filter for `recent_snapshots`. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    pub bookmaker: Option<String>,
    pub event_key: Option<String>,
    pub market: Option<MarketKind>,
}

impl SnapshotFilter {
    pub fn matches(&self, s: &Snapshot) -> bool {
        self.bookmaker.as_deref().map_or(true, |b| s.bookmaker == b)
            && self.event_key.as_deref().map_or(true, |e| s.event_key == e)
            && self.market.map_or(true, |m| s.market == m)
    }
}

/// How long rows live before `purge_expired` removes them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    pub quotes_ttl_days: u32,
    pub ev_hits_ttl_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            quotes_ttl_days: 14,
            ev_hits_ttl_days: 14,
        }
    }
}

impl RetentionPolicy {
    pub fn quotes_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.quotes_ttl_days))
    }

    pub fn hits_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.ev_hits_ttl_days))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub snapshots: u64,
    pub hits: u64,
}

impl PurgeReport {
    pub fn total(&self) -> u64 {
        self.snapshots + self.hits
    }
}

#[async_trait]
pub trait QuoteStore: Send + Sync {
    /// Create tables and indexes if missing. Idempotent.
    async fn init(&self) -> Result<(), LinewatchError>;

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), LinewatchError>;

    async fn insert_hit(&self, hit: &Hit) -> Result<(), LinewatchError>;

    /// The latest snapshot per (event, market, selection, bookmaker) for
    /// the given markets, oldest first, optionally only among those
    /// captured at or after `since`. Equal capture times resolve to the
    /// later insert. Rows that fail to decode are skipped.
    async fn latest_quotes(
        &self,
        markets: &[MarketKind],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Snapshot>, LinewatchError>;

    /// Newest first.
    async fn recent_snapshots(
        &self,
        filter: &SnapshotFilter,
        limit: usize,
    ) -> Result<Vec<Snapshot>, LinewatchError>;

    /// Newest first.
    async fn recent_hits(&self, limit: usize) -> Result<Vec<Hit>, LinewatchError>;

    /// Capture times of stored snapshots, optionally for one book.
    async fn capture_times(
        &self,
        bookmaker: Option<&str>,
    ) -> Result<Vec<DateTime<Utc>>, LinewatchError>;

    /// Delete rows older than the retention policy allows.
    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        policy: &RetentionPolicy,
    ) -> Result<PurgeReport, LinewatchError>;
}

// ---------------------------------------------------------------------------
// Age histogram
// ---------------------------------------------------------------------------

/// Bucket labels and their inclusive upper bounds in seconds.
const AGE_BUCKETS: &[(&str, i64)] = &[
    ("0-60s", 60),
    ("1-5m", 300),
    ("5-30m", 1800),
    ("30m-2h", 7200),
    (">2h", i64::MAX),
];

/// Count capture times per age bucket relative to `now`. Every bucket is
/// present in the output, in increasing age order.
pub fn age_histogram(times: &[DateTime<Utc>], now: DateTime<Utc>) -> Vec<(&'static str, usize)> {
    let mut counts = vec![0usize; AGE_BUCKETS.len()];
    for t in times {
        let age_ms = (now - *t).num_milliseconds().max(0);
        let idx = AGE_BUCKETS
            .iter()
            .position(|(_, upper)| age_ms <= upper.saturating_mul(1000))
            .unwrap_or(AGE_BUCKETS.len() - 1);
        counts[idx] += 1;
    }
    AGE_BUCKETS
        .iter()
        .zip(counts)
        .map(|((label, _), n)| (*label, n))
        .collect()
}

// ---------------------------------------------------------------------------
// TTL sweep job
// ---------------------------------------------------------------------------

/// Scheduled job that enforces the retention policy.
pub struct SweepJob {
    store: Arc<dyn QuoteStore>,
    policy: RetentionPolicy,
}

impl SweepJob {
    pub fn new(store: Arc<dyn QuoteStore>, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }
}

#[async_trait]
impl SourceJob for SweepJob {
    async fn run_once(&self) -> Result<usize, LinewatchError> {
        let report = self.store.purge_expired(Utc::now(), &self.policy).await?;
        info!(
            snapshots = report.snapshots,
            hits = report.hits,
            "TTL sweep complete"
        );
        Ok(report.total() as usize)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
