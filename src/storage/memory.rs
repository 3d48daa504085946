//! In-memory `QuoteStore` for tests and dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{PurgeReport, QuoteStore, RetentionPolicy, SnapshotFilter};
use crate::types::{Hit, LinewatchError, MarketKind, Selection, Snapshot};

#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: Mutex<Vec<Snapshot>>,
    hits: Mutex<Vec<Hit>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent insert fail with `StoreError`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn hit_count(&self) -> usize {
        self.hits.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn all_snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn all_hits(&self) -> Vec<Hit> {
        self.hits.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn check_writable(&self) -> Result<(), LinewatchError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LinewatchError::Store("memory store is read-only".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QuoteStore for MemoryStore {
    async fn init(&self) -> Result<(), LinewatchError> {
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), LinewatchError> {
        self.check_writable()?;
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(snapshot.clone());
        Ok(())
    }

    async fn insert_hit(&self, hit: &Hit) -> Result<(), LinewatchError> {
        self.check_writable()?;
        self.hits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hit.clone());
        Ok(())
    }

    async fn latest_quotes(
        &self,
        markets: &[MarketKind],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Snapshot>, LinewatchError> {
        let snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        let mut latest: HashMap<(&str, MarketKind, Selection, &str), &Snapshot> = HashMap::new();
        for s in snapshots
            .iter()
            .filter(|s| markets.contains(&s.market))
            .filter(|s| since.map_or(true, |t| s.captured_at >= t))
        {
            let key = (s.event_key.as_str(), s.market, s.selection, s.bookmaker.as_str());
            match latest.get(&key) {
                Some(existing) if existing.captured_at > s.captured_at => {}
                _ => {
                    latest.insert(key, s);
                }
            }
        }
        let mut out: Vec<Snapshot> = latest.into_values().cloned().collect();
        out.sort_by_key(|s| s.captured_at);
        Ok(out)
    }

    async fn recent_snapshots(
        &self,
        filter: &SnapshotFilter,
        limit: usize,
    ) -> Result<Vec<Snapshot>, LinewatchError> {
        let snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<Snapshot> = snapshots.iter().filter(|s| filter.matches(s)).cloned().collect();
        out.sort_by(|a, b| b.captured_at.cmp(&a.captured_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn recent_hits(&self, limit: usize) -> Result<Vec<Hit>, LinewatchError> {
        let hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = hits.clone();
        out.sort_by(|a, b| b.computed_at.cmp(&a.computed_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn capture_times(
        &self,
        bookmaker: Option<&str>,
    ) -> Result<Vec<DateTime<Utc>>, LinewatchError> {
        let snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(snapshots
            .iter()
            .filter(|s| bookmaker.map_or(true, |b| s.bookmaker == b))
            .map(|s| s.captured_at)
            .collect())
    }

    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        policy: &RetentionPolicy,
    ) -> Result<PurgeReport, LinewatchError> {
        let quotes_cutoff = policy.quotes_cutoff(now);
        let hits_cutoff = policy.hits_cutoff(now);

        let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        let before = snapshots.len();
        snapshots.retain(|s| s.captured_at >= quotes_cutoff);
        let purged_snapshots = (before - snapshots.len()) as u64;
        drop(snapshots);

        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let before = hits.len();
        hits.retain(|h| h.computed_at >= hits_cutoff);
        let purged_hits = (before - hits.len()) as u64;

        Ok(PurgeReport {
            snapshots: purged_snapshots,
            hits: purged_hits,
        })
    }
}
