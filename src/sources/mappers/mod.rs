//! Normalization mappers.
//!
//! One `Mapper` per bookmaker payload shape. A mapper turns a parsed JSON
//! payload into canonical snapshots and never touches shared state. The
//! field-hunting heuristics for each shape live inside its own variant;
//! the helpers here only coerce scalar values.

pub mod bovada;
pub mod cloudbet;
pub mod generic;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

use crate::types::{LineStatus, LinewatchError, MarketKind, Provenance, Selection, Snapshot};

pub use bovada::BovadaMapper;
pub use cloudbet::CloudbetMapper;
pub use generic::GenericMapper;

/// Epoch values above this are milliseconds.
const MILLIS_THRESHOLD: f64 = 10_000_000_000.0;

/// Everything a mapper knows about the feed besides the payload.
#[derive(Debug, Clone)]
pub struct FeedContext {
    pub bookmaker: String,
    pub sport: String,
    pub league: String,
    pub source_url: String,
    pub spider_version: String,
    pub captured_at: DateTime<Utc>,
    pub http_status: Option<u16>,
    /// Upstream market keys requested for this feed, when the API needs them.
    pub markets: Vec<String>,
}

/// Per-event facts shared by every snapshot of that event.
#[derive(Debug, Clone)]
pub struct EventInfo {
    pub event_key: String,
    pub kickoff: DateTime<Utc>,
    pub line_status: LineStatus,
}

impl FeedContext {
    /// A full-time snapshot with this feed's provenance. Callers set
    /// `line` and `raw` afterwards where they have them.
    pub fn snapshot(
        &self,
        event: &EventInfo,
        market: MarketKind,
        selection: Selection,
        odds: f64,
    ) -> Snapshot {
        Snapshot {
            bookmaker: self.bookmaker.clone(),
            event_key: event.event_key.clone(),
            sport: self.sport.clone(),
            league: self.league.clone(),
            kickoff: event.kickoff,
            market,
            period: "FT".to_string(),
            selection,
            odds,
            line: None,
            line_status: event.line_status,
            captured_at: self.captured_at,
            provenance: Provenance {
                source_url: self.source_url.clone(),
                spider_version: self.spider_version.clone(),
            },
            http_status: self.http_status,
            raw: Value::Null,
        }
    }
}

pub trait Mapper: Send + Sync {
    fn name(&self) -> &'static str;

    /// Version tag recorded in snapshot provenance.
    fn version(&self) -> &'static str;

    /// Map a payload to snapshots. A malformed event is skipped; the rest
    /// of the payload is still mapped.
    fn map(&self, payload: &Value, ctx: &FeedContext) -> Vec<Snapshot>;
}

/// What to do with a market whose period label is not recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPeriod {
    /// Treat it as full time (keeps more markets, may admit partial-game lines).
    #[default]
    AssumeFullTime,
    /// Drop the market.
    Skip,
}

/// Mapper tuning taken from the source's configuration.
#[derive(Debug, Clone, Default)]
pub struct MapperSettings {
    /// Keyword overrides per market kind; kinds not listed keep defaults.
    pub market_map: BTreeMap<MarketKind, Vec<String>>,
    pub unknown_period: UnknownPeriod,
}

/// Construct the mapper registered under `name`.
pub fn build_mapper(name: &str, settings: MapperSettings) -> Result<Box<dyn Mapper>, LinewatchError> {
    match name {
        "bovada" => Ok(Box::new(BovadaMapper::new(settings))),
        "cloudbet" => Ok(Box::new(CloudbetMapper::new())),
        "generic" => Ok(Box::new(GenericMapper::new())),
        other => Err(LinewatchError::Config(format!("unknown mapper: {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Value coercion
// ---------------------------------------------------------------------------

/// American odds to decimal. Zero has no decimal equivalent.
pub fn american_to_decimal(american: f64) -> Option<f64> {
    if !american.is_finite() || american == 0.0 {
        return None;
    }
    if american > 0.0 {
        Some(1.0 + american / 100.0)
    } else {
        Some(1.0 + 100.0 / american.abs())
    }
}

/// Number, or a numeric string such as `"+1.5"`.
pub fn lenient_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_start_matches('+').parse().ok(),
        _ => None,
    }
}

/// American price from a number or string; `"EVEN"` is +100.
pub fn american_price(v: &Value) -> Option<f64> {
    if let Value::String(s) = v {
        if s.trim().eq_ignore_ascii_case("even") {
            return Some(2.0);
        }
    }
    lenient_f64(v).and_then(american_to_decimal)
}

/// First present, non-empty value under any of `keys`, rendered as a string.
pub fn string_field(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.get(*k) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn epoch_to_utc(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let millis = if value > MILLIS_THRESHOLD {
        value
    } else {
        value * 1000.0
    };
    DateTime::from_timestamp_millis(millis as i64)
}

/// Kickoff from ISO-8601, epoch seconds or millis (numeric or string), or
/// an object carrying one of those.
pub fn coerce_kickoff(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
                return Some(naive.and_utc());
            }
            s.parse::<f64>().ok().and_then(epoch_to_utc)
        }
        Value::Number(n) => n.as_f64().and_then(epoch_to_utc),
        Value::Object(map) => {
            for k in ["epoch", "seconds", "millis", "ms"] {
                if let Some(inner) = map.get(k) {
                    return coerce_kickoff(inner);
                }
            }
            map.values().find_map(coerce_kickoff)
        }
        _ => None,
    }
}

/// Breadth-first search of `root` for the first of `keys` whose value
/// coerces to a kickoff time.
pub fn find_kickoff(root: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    let mut queue = VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        match node {
            Value::Object(map) => {
                for k in keys {
                    if let Some(dt) = map.get(*k).filter(|v| !v.is_null()).and_then(coerce_kickoff) {
                        return Some(dt);
                    }
                }
                queue.extend(map.values());
            }
            Value::Array(items) => queue.extend(items.iter()),
            _ => {}
        }
    }
    None
}

/// True when `keyword` occurs in `text`. Keywords of two characters or
/// fewer must match a whole word so `ml` does not hit `html`.
pub fn keyword_matches(text: &str, keyword: &str) -> bool {
    if keyword.chars().count() <= 2 {
        text.split(|c: char| !c.is_alphanumeric())
            .any(|word| word == keyword)
    } else {
        text.contains(keyword)
    }
}

/// Array under the first present key.
pub fn array_field<'a>(obj: &'a Value, keys: &[&str]) -> &'a [Value] {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
