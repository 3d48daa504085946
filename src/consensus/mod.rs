//! Consensus and arbitrage engine.
//!
//! Reads the stored quotes for full-time 3-way and 2-way moneyline
//! markets, keeps the freshest quote per (event, market, selection,
//! bookmaker), and evaluates each (event, market) group:
//!
//! - arbitrage on the best cross-book price per selection
//! - EV hits under either [`ScanPolicy`]
//!
//! `SingleBook` de-vigs one book's own line and prices that same line.
//! `CrossBook` de-vigs the best cross-book line and prices every book's
//! quote against it.

pub mod devig;

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ConsensusSettings;
use crate::storage::QuoteStore;
use crate::types::{Hit, LinewatchError, MarketKind, ScanPolicy, Selection, Snapshot};

/// Markets the engine evaluates.
pub const SCAN_MARKETS: [MarketKind; 2] = [MarketKind::ThreeWay, MarketKind::Moneyline];

#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusConfig {
    /// Minimum distinct books a cross-book group needs.
    pub min_books: usize,
    /// Quotes older than this are ignored.
    pub max_quote_age: Option<Duration>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_books: 1,
            max_quote_age: None,
        }
    }
}

impl From<&ConsensusSettings> for ConsensusConfig {
    fn from(settings: &ConsensusSettings) -> Self {
        Self {
            min_books: settings.min_books,
            max_quote_age: settings.max_quote_age,
        }
    }
}

// ---------------------------------------------------------------------------
// Scan output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ArbLeg {
    pub selection: Selection,
    pub bookmaker: String,
    pub odds: f64,
}

/// Best-price combination whose implied probabilities sum below 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Arbitrage {
    pub event_key: String,
    pub market: MarketKind,
    pub legs: Vec<ArbLeg>,
    pub implied_sum: f64,
}

impl Arbitrage {
    /// Guaranteed return per unit of total stake, before fees.
    pub fn margin(&self) -> f64 {
        1.0 / self.implied_sum - 1.0
    }
}

impl fmt::Display for Arbitrage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ARB {} {} sum={:.4} margin={:.2}%",
            self.event_key,
            self.market,
            self.implied_sum,
            self.margin() * 100.0
        )?;
        for leg in &self.legs {
            write!(f, " | {} {}@{:.2}", leg.selection, leg.bookmaker, leg.odds)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Sorted by edge, best first.
    pub hits: Vec<Hit>,
    pub arbitrages: Vec<Arbitrage>,
    pub groups_scanned: usize,
    /// Groups missing a required leg or below `min_books`.
    pub groups_skipped: usize,
    /// Groups rejected as malformed.
    pub groups_failed: usize,
}

enum GroupOutcome {
    Skipped(&'static str),
    Evaluated {
        hits: Vec<Hit>,
        arbitrage: Option<Arbitrage>,
    },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ConsensusEngine {
    store: Arc<dyn QuoteStore>,
    config: ConsensusConfig,
}

impl ConsensusEngine {
    pub fn new(store: Arc<dyn QuoteStore>, config: ConsensusConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Evaluate the current quotes. Read-only.
    pub async fn scan(
        &self,
        policy: ScanPolicy,
        edge_threshold: f64,
    ) -> Result<ScanReport, LinewatchError> {
        let now = Utc::now();
        let since = self
            .config
            .max_quote_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .map(|age| now - age);
        let quotes = self.store.latest_quotes(&SCAN_MARKETS, since).await?;
        let report = evaluate(&quotes, policy, edge_threshold, now, &self.config);
        info!(
            policy = policy.as_str(),
            quotes = quotes.len(),
            groups = report.groups_scanned,
            skipped = report.groups_skipped,
            failed = report.groups_failed,
            hits = report.hits.len(),
            arbitrages = report.arbitrages.len(),
            "Consensus scan complete"
        );
        Ok(report)
    }

    /// Persist hits one by one. A failed write drops that hit only.
    /// Returns how many were stored.
    pub async fn store_hits(&self, hits: &[Hit]) -> usize {
        let mut stored = 0;
        for hit in hits {
            match self.store.insert_hit(hit).await {
                Ok(()) => stored += 1,
                Err(e) => warn!(
                    event_key = %hit.event_key,
                    selection = %hit.selection,
                    bookmaker = %hit.bookmaker,
                    error = %e,
                    "Failed to store hit, dropping"
                ),
            }
        }
        stored
    }

    /// Scan, then persist every hit. Returns the number stored.
    pub async fn scan_and_store(
        &self,
        policy: ScanPolicy,
        edge_threshold: f64,
    ) -> Result<usize, LinewatchError> {
        let report = self.scan(policy, edge_threshold).await?;
        let stored = self.store_hits(&report.hits).await;
        if stored < report.hits.len() {
            warn!(stored, total = report.hits.len(), "Some hits were not stored");
        }
        Ok(stored)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate `quotes` as of `now`. Quotes outside [`SCAN_MARKETS`] or older
/// than `max_quote_age` are ignored.
///
/// Same-book duplicates resolve to the latest `captured_at`; equal capture
/// times resolve to the one later in `quotes`. Best-price ties resolve to
/// the bookmaker that sorts first.
pub fn evaluate(
    quotes: &[Snapshot],
    policy: ScanPolicy,
    edge_threshold: f64,
    now: DateTime<Utc>,
    config: &ConsensusConfig,
) -> ScanReport {
    let max_age = config.max_quote_age.map(|d| d.as_secs_f64());

    let mut latest: BTreeMap<(&str, MarketKind, Selection, &str), &Snapshot> = BTreeMap::new();
    for q in quotes {
        if !SCAN_MARKETS.contains(&q.market) {
            continue;
        }
        if max_age.is_some_and(|max| q.age_secs(now) > max) {
            continue;
        }
        let key = (q.event_key.as_str(), q.market, q.selection, q.bookmaker.as_str());
        match latest.get(&key) {
            Some(existing) if existing.captured_at > q.captured_at => {}
            _ => {
                latest.insert(key, q);
            }
        }
    }

    let mut groups: BTreeMap<(&str, MarketKind), Vec<&Snapshot>> = BTreeMap::new();
    for ((event, market, _, _), q) in latest {
        groups.entry((event, market)).or_default().push(q);
    }

    let mut report = ScanReport::default();
    for ((event, market), group) in groups {
        report.groups_scanned += 1;
        match evaluate_group(market, &group, policy, edge_threshold, now, config) {
            Ok(GroupOutcome::Skipped(reason)) => {
                debug!(event_key = event, market = %market, reason, "Group skipped");
                report.groups_skipped += 1;
            }
            Ok(GroupOutcome::Evaluated { hits, arbitrage }) => {
                report.hits.extend(hits);
                if let Some(arb) = arbitrage {
                    info!(
                        event_key = event,
                        market = %market,
                        implied_sum = arb.implied_sum,
                        "Arbitrage detected"
                    );
                    report.arbitrages.push(arb);
                }
            }
            Err(e) => {
                warn!(event_key = event, market = %market, error = %e, "Malformed group, skipping");
                report.groups_failed += 1;
            }
        }
    }

    report
        .hits
        .sort_by(|a, b| b.edge.partial_cmp(&a.edge).unwrap_or(Ordering::Equal));
    report
}

/// `group` holds at most one quote per (selection, bookmaker), ordered by
/// selection then bookmaker.
fn evaluate_group(
    market: MarketKind,
    group: &[&Snapshot],
    policy: ScanPolicy,
    edge_threshold: f64,
    now: DateTime<Utc>,
    config: &ConsensusConfig,
) -> Result<GroupOutcome, LinewatchError> {
    let legs = market.selections();
    for q in group {
        if !q.odds.is_finite() || q.odds <= 1.0 {
            return Err(LinewatchError::InvalidSnapshot(format!("{q}: odds {}", q.odds)));
        }
        if !market.allows(q.selection) {
            return Err(LinewatchError::InvalidSnapshot(format!(
                "{q}: selection not valid for market"
            )));
        }
    }

    if policy == ScanPolicy::CrossBook {
        let books: BTreeSet<&str> = group.iter().map(|q| q.bookmaker.as_str()).collect();
        if books.len() < config.min_books {
            return Ok(GroupOutcome::Skipped("too few books"));
        }
    }

    let mut best: Vec<Option<&Snapshot>> = vec![None; legs.len()];
    for q in group {
        let idx = leg_index(legs, q.selection)?;
        match best[idx] {
            Some(current) if current.odds >= q.odds => {}
            _ => best[idx] = Some(q),
        }
    }
    let Some(best) = best.into_iter().collect::<Option<Vec<&Snapshot>>>() else {
        return Ok(GroupOutcome::Skipped("missing leg"));
    };
    let best_odds: Vec<f64> = best.iter().map(|q| q.odds).collect();

    let arbitrage = devig::is_arbitrage(&best_odds).then(|| Arbitrage {
        event_key: best[0].event_key.clone(),
        market,
        legs: best
            .iter()
            .map(|q| ArbLeg {
                selection: q.selection,
                bookmaker: q.bookmaker.clone(),
                odds: q.odds,
            })
            .collect(),
        implied_sum: devig::overround(&best_odds),
    });

    let hits = match policy {
        ScanPolicy::CrossBook => {
            let fair = fair_probabilities(&best_odds)?;
            let mut hits = Vec::new();
            for q in group {
                let p = fair[leg_index(legs, q.selection)?];
                if let Some(hit) = hit_if_edge(q, p, policy, edge_threshold, now) {
                    hits.push(hit);
                }
            }
            hits
        }
        ScanPolicy::SingleBook => {
            let mut lines: BTreeMap<&str, Vec<Option<&Snapshot>>> = BTreeMap::new();
            for q in group {
                let idx = leg_index(legs, q.selection)?;
                lines.entry(q.bookmaker.as_str()).or_insert_with(|| vec![None; legs.len()])[idx] =
                    Some(q);
            }
            let mut hits = Vec::new();
            for (book, line) in lines {
                let Some(line) = line.into_iter().collect::<Option<Vec<&Snapshot>>>() else {
                    debug!(bookmaker = book, "Incomplete line, skipping book");
                    continue;
                };
                let odds: Vec<f64> = line.iter().map(|q| q.odds).collect();
                let fair = fair_probabilities(&odds)?;
                for (q, p) in line.iter().zip(fair) {
                    if let Some(hit) = hit_if_edge(q, p, policy, edge_threshold, now) {
                        hits.push(hit);
                    }
                }
            }
            hits
        }
    };

    Ok(GroupOutcome::Evaluated { hits, arbitrage })
}

fn leg_index(legs: &[Selection], selection: Selection) -> Result<usize, LinewatchError> {
    legs.iter()
        .position(|s| *s == selection)
        .ok_or_else(|| LinewatchError::InvalidSnapshot(format!("unexpected selection {selection}")))
}

fn fair_probabilities(odds: &[f64]) -> Result<Vec<f64>, LinewatchError> {
    devig::de_vig(odds)
        .ok_or_else(|| LinewatchError::InvalidSnapshot(format!("cannot de-vig {odds:?}")))
}

fn hit_if_edge(
    quote: &Snapshot,
    fair_probability: f64,
    policy: ScanPolicy,
    edge_threshold: f64,
    now: DateTime<Utc>,
) -> Option<Hit> {
    let edge = devig::expected_value(fair_probability, quote.odds);
    if edge < edge_threshold {
        return None;
    }
    Some(Hit {
        event_key: quote.event_key.clone(),
        market: quote.market,
        selection: quote.selection,
        bookmaker: quote.bookmaker.clone(),
        odds: quote.odds,
        fair_probability,
        edge,
        policy,
        captured_at: quote.captured_at,
        quote_age_secs: quote.age_secs(now),
        computed_at: now,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
