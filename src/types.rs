//! Shared types for LINEWATCH.
//!
//! The canonical odds model every module speaks: snapshots produced by
//! the mappers, hits produced by the consensus engine, and the error
//! taxonomy used across the pipeline. Kept free of I/O so fetch,
//! storage, scheduling and consensus code can all depend on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Markets and selections
// ---------------------------------------------------------------------------

/// Canonical market identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MarketKind {
    /// Full-time 3-way result (home / draw / away).
    #[serde(rename = "FT_1X2")]
    ThreeWay,
    /// Full-time 2-way moneyline (home / away).
    #[serde(rename = "FT_ML_2W")]
    Moneyline,
    /// Full-time spread / handicap, carries a line.
    #[serde(rename = "FT_SPREAD")]
    Spread,
    /// Full-time total (over / under), carries a line.
    #[serde(rename = "FT_TOTAL")]
    Total,
}

impl MarketKind {
    pub const ALL: &'static [MarketKind] = &[
        MarketKind::ThreeWay,
        MarketKind::Moneyline,
        MarketKind::Spread,
        MarketKind::Total,
    ];

    /// Stable string id used in storage and on the CLI.
    pub fn id(&self) -> &'static str {
        match self {
            MarketKind::ThreeWay => "FT_1X2",
            MarketKind::Moneyline => "FT_ML_2W",
            MarketKind::Spread => "FT_SPREAD",
            MarketKind::Total => "FT_TOTAL",
        }
    }

    /// Selections a complete market of this kind must quote.
    pub fn selections(&self) -> &'static [Selection] {
        match self {
            MarketKind::ThreeWay => &[Selection::Home, Selection::Draw, Selection::Away],
            MarketKind::Moneyline | MarketKind::Spread => &[Selection::Home, Selection::Away],
            MarketKind::Total => &[Selection::Over, Selection::Under],
        }
    }

    pub fn allows(&self, selection: Selection) -> bool {
        self.selections().contains(&selection)
    }

    /// Whether snapshots of this market carry a line parameter.
    pub fn has_line(&self) -> bool {
        matches!(self, MarketKind::Spread | MarketKind::Total)
    }
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for MarketKind {
    type Err = LinewatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "FT_1X2" | "1X2" | "THREE_WAY" => Ok(MarketKind::ThreeWay),
            "FT_ML_2W" | "ML" | "MONEYLINE" => Ok(MarketKind::Moneyline),
            "FT_SPREAD" | "SPREAD" => Ok(MarketKind::Spread),
            "FT_TOTAL" | "TOTAL" => Ok(MarketKind::Total),
            other => Err(LinewatchError::Parse {
                context: "market".to_string(),
                message: format!("unknown market id: {other}"),
            }),
        }
    }
}

/// Outcome being priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selection {
    Home,
    Draw,
    Away,
    Over,
    Under,
}

impl Selection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Selection::Home => "home",
            Selection::Draw => "draw",
            Selection::Away => "away",
            Selection::Over => "over",
            Selection::Under => "under",
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Selection {
    type Err = LinewatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "home" => Ok(Selection::Home),
            "draw" => Ok(Selection::Draw),
            "away" => Ok(Selection::Away),
            "over" => Ok(Selection::Over),
            "under" => Ok(Selection::Under),
            other => Err(LinewatchError::Parse {
                context: "selection".to_string(),
                message: format!("unknown selection: {other}"),
            }),
        }
    }
}

/// Whether the quote was captured pre-match or in play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LineStatus {
    #[default]
    Open,
    Live,
}

impl LineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineStatus::Open => "open",
            LineStatus::Live => "live",
        }
    }
}

impl FromStr for LineStatus {
    type Err = LinewatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(LineStatus::Open),
            "live" => Ok(LineStatus::Live),
            other => Err(LinewatchError::Parse {
                context: "line_status".to_string(),
                message: format!("unknown line status: {other}"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Where a snapshot came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_url: String,
    pub spider_version: String,
}

/// One normalized price observation at one instant. Never mutated after
/// creation; expires from the store via TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub bookmaker: String,
    /// Opaque cross-book join key.
    pub event_key: String,
    pub sport: String,
    pub league: String,
    pub kickoff: DateTime<Utc>,
    pub market: MarketKind,
    pub period: String,
    pub selection: Selection,
    /// Decimal odds, always > 1.0 once validated.
    pub odds: f64,
    /// Spread or total value for line markets.
    pub line: Option<f64>,
    pub line_status: LineStatus,
    pub captured_at: DateTime<Utc>,
    pub provenance: Provenance,
    pub http_status: Option<u16>,
    /// Small amount of source context for debugging mappers.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl Snapshot {
    /// Check the ingestion invariants. Anything failing here never reaches
    /// the store or the consensus engine.
    pub fn validate(&self) -> Result<(), LinewatchError> {
        if !self.odds.is_finite() || self.odds <= 1.0 {
            return Err(LinewatchError::InvalidSnapshot(format!(
                "odds must be > 1.0, got {} ({} {} {})",
                self.odds, self.event_key, self.market, self.selection
            )));
        }
        if self.event_key.trim().is_empty() {
            return Err(LinewatchError::InvalidSnapshot(
                "event_key is empty".to_string(),
            ));
        }
        if self.bookmaker.trim().is_empty() {
            return Err(LinewatchError::InvalidSnapshot(
                "bookmaker is empty".to_string(),
            ));
        }
        if !self.market.allows(self.selection) {
            return Err(LinewatchError::InvalidSnapshot(format!(
                "selection {} is not valid for {}",
                self.selection, self.market
            )));
        }
        if let Some(line) = self.line {
            if !line.is_finite() {
                return Err(LinewatchError::InvalidSnapshot(format!(
                    "line must be finite, got {line}"
                )));
            }
        }
        Ok(())
    }

    /// Age of the quote relative to `now`, clamped at zero for clock skew.
    pub fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        ((now - self.captured_at).num_milliseconds() as f64 / 1000.0).max(0.0)
    }

    /// Helper to build a snapshot with sensible defaults for tests.
    #[cfg(test)]
    pub fn sample(
        bookmaker: &str,
        event_key: &str,
        market: MarketKind,
        selection: Selection,
        odds: f64,
    ) -> Self {
        Snapshot {
            bookmaker: bookmaker.to_string(),
            event_key: event_key.to_string(),
            sport: "soccer".to_string(),
            league: "EPL".to_string(),
            kickoff: Utc::now() + chrono::Duration::hours(6),
            market,
            period: "FT".to_string(),
            selection,
            odds,
            line: None,
            line_status: LineStatus::Open,
            captured_at: Utc::now(),
            provenance: Provenance {
                source_url: format!("https://{bookmaker}.example.com/feed"),
                spider_version: "test/v1".to_string(),
            },
            http_status: Some(200),
            raw: serde_json::Value::Null,
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} {} @ {:.2}",
            self.bookmaker, self.event_key, self.market, self.selection, self.odds
        )?;
        if let Some(line) = self.line {
            write!(f, " ({line:+})")?;
        }
        write!(f, " captured {}", self.captured_at.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

// ---------------------------------------------------------------------------
// EV hits
// ---------------------------------------------------------------------------

/// Which book supplies the fair probability versus the quoted price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPolicy {
    /// One book's own line provides both the fair probability and the price.
    SingleBook,
    /// Fair probability from the best cross-book line, priced against every book.
    CrossBook,
}

impl ScanPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanPolicy::SingleBook => "single_book",
            ScanPolicy::CrossBook => "cross_book",
        }
    }
}

impl fmt::Display for ScanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanPolicy {
    type Err = LinewatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_book" => Ok(ScanPolicy::SingleBook),
            "cross_book" => Ok(ScanPolicy::CrossBook),
            other => Err(LinewatchError::Parse {
                context: "policy".to_string(),
                message: format!("unknown scan policy: {other}"),
            }),
        }
    }
}

/// A positive-EV price. Append-only; expires via TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub event_key: String,
    pub market: MarketKind,
    pub selection: Selection,
    pub bookmaker: String,
    pub odds: f64,
    pub fair_probability: f64,
    /// Expected value per unit stake.
    pub edge: f64,
    pub policy: ScanPolicy,
    /// Capture time of the priced quote.
    pub captured_at: DateTime<Utc>,
    pub quote_age_secs: f64,
    pub computed_at: DateTime<Utc>,
}

impl fmt::Display for Hit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EV+ [{}] event={} {} sel={} {}@{:.2} p={:.3} EV={:.2}% age={:.0}s",
            self.policy,
            self.event_key,
            self.market,
            self.selection,
            self.bookmaker,
            self.odds,
            self.fair_probability,
            self.edge * 100.0,
            self.quote_age_secs,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Error taxonomy for the ingestion and consensus pipeline.
#[derive(Debug, thiserror::Error)]
pub enum LinewatchError {
    #[error("Network error ({url}): {message}")]
    Network { url: String, message: String },

    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    #[error("Circuit open for {domain}")]
    CircuitOpen { domain: String },

    #[error("Parse error ({context}): {message}")]
    Parse { context: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl LinewatchError {
    /// Circuit-open failures are skips, not faults of the source itself.
    pub fn is_skip(&self) -> bool {
        matches!(self, LinewatchError::CircuitOpen { .. })
    }
}

impl From<sqlx::Error> for LinewatchError {
    fn from(e: sqlx::Error) -> Self {
        LinewatchError::Store(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
