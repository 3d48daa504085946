//! Bovada coupon feed mapper.
//!
//! Payload: a list of category blocks (or a single block), each with
//! `events[]`. An event carries `competitors[]` and
//! `displayGroups[].markets[].outcomes[]`; prices sit under
//! `outcome.price` as `decimal` and/or `american`, lines as `handicap`.

use serde_json::{json, Value};
use tracing::debug;

use super::{
    american_price, array_field, coerce_kickoff, keyword_matches, lenient_f64, string_field,
    EventInfo, FeedContext, Mapper, MapperSettings, UnknownPeriod,
};
use crate::types::{LineStatus, LinewatchError, MarketKind, Selection, Snapshot};

/// Classification order matters: "3-way moneyline" is a 3-way market and
/// "moneyline" must win before the spread keywords see "line".
const CLASSIFY_ORDER: [MarketKind; 4] = [
    MarketKind::ThreeWay,
    MarketKind::Moneyline,
    MarketKind::Spread,
    MarketKind::Total,
];

fn default_keywords(kind: MarketKind) -> &'static [&'static str] {
    match kind {
        MarketKind::ThreeWay => &["3-way", "3 way", "match result", "regulation"],
        MarketKind::Moneyline => &["moneyline", "money line", "ml"],
        MarketKind::Spread => &["point spread", "puck line", "run line", "spread", "handicap"],
        MarketKind::Total => &["total", "over/under", "o/u"],
    }
}

const FULL_TIME_TOKENS: &[&str] = &[
    "m", "match", "ft", "full time", "g", "game", "reg", "regular", "regulation",
];

const PARTIAL_TOKENS: &[&str] = &[
    "1h", "2h", "q1", "q2", "q3", "q4", "1st", "2nd", "3rd", "1p", "2p", "3p", "set", "map",
    "inning", "period", "half", "quarter",
];

const LINE_KEYS: &[&str] = &["handicap", "hdp", "line", "points", "spread"];

pub struct BovadaMapper {
    keywords: Vec<(MarketKind, Vec<String>)>,
    unknown_period: UnknownPeriod,
}

impl BovadaMapper {
    pub fn new(settings: MapperSettings) -> Self {
        let keywords = CLASSIFY_ORDER
            .iter()
            .map(|kind| {
                let words = match settings.market_map.get(kind) {
                    Some(custom) if !custom.is_empty() => {
                        custom.iter().map(|w| w.to_lowercase()).collect()
                    }
                    _ => default_keywords(*kind).iter().map(|w| w.to_string()).collect(),
                };
                (*kind, words)
            })
            .collect();
        Self {
            keywords,
            unknown_period: settings.unknown_period,
        }
    }

    fn classify(&self, description: &str) -> Option<MarketKind> {
        let desc = description.to_lowercase();
        self.keywords
            .iter()
            .find(|(_, words)| words.iter().any(|w| keyword_matches(&desc, w)))
            .map(|(kind, _)| *kind)
    }

    /// Full time when the label says so, partial when it names a part of
    /// the game, and the configured policy otherwise.
    fn is_full_time(&self, market: &Value) -> bool {
        let period = market.get("period").unwrap_or(&Value::Null);
        let label = string_field(period, &["abbreviation", "description"])
            .unwrap_or_default()
            .to_lowercase();
        if label.is_empty() {
            return true;
        }
        if PARTIAL_TOKENS.iter().any(|t| keyword_matches(&label, t)) {
            return false;
        }
        if FULL_TIME_TOKENS.iter().any(|t| keyword_matches(&label, t)) {
            return true;
        }
        self.unknown_period == UnknownPeriod::AssumeFullTime
    }

    fn map_event(&self, event: &Value, ctx: &FeedContext) -> Result<Vec<Snapshot>, LinewatchError> {
        let event_key = string_field(event, &["id", "eventId", "link", "description"])
            .ok_or_else(|| parse_error("event has no id"))?;
        let kickoff = event
            .get("startTime")
            .and_then(coerce_kickoff)
            .ok_or_else(|| parse_error(&format!("event {event_key} has no startTime")))?;
        let info = EventInfo {
            event_key,
            kickoff,
            line_status: if is_live(event) {
                LineStatus::Live
            } else {
                LineStatus::Open
            },
        };
        let (home, away) = home_away(event);

        let mut out = Vec::new();
        for group in array_field(event, &["displayGroups"]) {
            for market in array_field(group, &["markets"]) {
                let desc = string_field(market, &["description", "shortName"]).unwrap_or_default();
                let Some(kind) = self.classify(&desc) else {
                    continue;
                };
                if !self.is_full_time(market) {
                    continue;
                }
                let outcomes = array_field(market, &["outcomes"]);
                let positional = outcomes.len() == kind.selections().len();

                for (idx, outcome) in outcomes.iter().enumerate() {
                    let Some(odds) = outcome_price(outcome) else {
                        continue;
                    };
                    let selection = outcome_selection(outcome, &home, &away)
                        .filter(|s| kind.allows(*s))
                        .or_else(|| positional.then(|| kind.selections()[idx]));
                    let Some(selection) = selection else {
                        continue;
                    };
                    let line = if kind.has_line() {
                        match line_from(outcome, market) {
                            Some(l) => Some(l),
                            None => continue,
                        }
                    } else {
                        None
                    };

                    let mut snap = ctx.snapshot(&info, kind, selection, odds);
                    snap.line = line;
                    snap.raw = json!({
                        "event_id": event.get("id"),
                        "market": desc,
                        "outcome": outcome.get("description"),
                    });
                    out.push(snap);
                }
            }
        }
        Ok(out)
    }
}

impl Mapper for BovadaMapper {
    fn name(&self) -> &'static str {
        "bovada"
    }

    fn version(&self) -> &'static str {
        "bovada_v2"
    }

    fn map(&self, payload: &Value, ctx: &FeedContext) -> Vec<Snapshot> {
        let blocks: Vec<&Value> = match payload {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };

        let mut out = Vec::new();
        for block in blocks {
            for event in array_field(block, &["events"]) {
                match self.map_event(event, ctx) {
                    Ok(snaps) => out.extend(snaps),
                    Err(e) => debug!(book = %ctx.bookmaker, error = %e, "Skipping event"),
                }
            }
        }
        out
    }
}

fn parse_error(message: &str) -> LinewatchError {
    LinewatchError::Parse {
        context: "bovada".to_string(),
        message: message.to_string(),
    }
}

fn is_live(event: &Value) -> bool {
    if event.get("live").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    let status = string_field(event, &["status"]).unwrap_or_default().to_lowercase();
    status.contains("live") || status.contains("inplay") || status.contains("in-play")
}

/// Home and away names from the competitor flags, else "A vs B".
fn home_away(event: &Value) -> (String, String) {
    let mut home = String::new();
    let mut away = String::new();
    for comp in array_field(event, &["competitors"]) {
        let name = string_field(comp, &["name", "description", "shortName"]).unwrap_or_default();
        if comp.get("home").and_then(Value::as_bool) == Some(true) {
            home = name;
        } else {
            away = name;
        }
    }
    if home.is_empty() || away.is_empty() {
        let desc = string_field(event, &["description"]).unwrap_or_default();
        // ASCII lowercasing keeps byte offsets valid for the split.
        if let Some(pos) = desc.to_ascii_lowercase().find(" vs ") {
            if home.is_empty() {
                home = desc[..pos].trim().to_string();
            }
            if away.is_empty() {
                away = desc[pos + 4..].trim().to_string();
            }
        }
    }
    (home, away)
}

fn outcome_price(outcome: &Value) -> Option<f64> {
    let price = outcome.get("price")?;
    price
        .get("decimal")
        .and_then(lenient_f64)
        .filter(|d| *d > 0.0)
        .or_else(|| price.get("american").and_then(american_price))
}

fn outcome_selection(outcome: &Value, home: &str, away: &str) -> Option<Selection> {
    let kind = string_field(outcome, &["type"]).unwrap_or_default().to_uppercase();
    match kind.as_str() {
        "H" | "HOME" => return Some(Selection::Home),
        "A" | "AWAY" => return Some(Selection::Away),
        "D" | "DRAW" | "X" => return Some(Selection::Draw),
        "O" | "OVER" => return Some(Selection::Over),
        "U" | "UNDER" => return Some(Selection::Under),
        _ => {}
    }

    let desc = string_field(outcome, &["description"]).unwrap_or_default().to_lowercase();
    match desc.as_str() {
        "over" | "o" => return Some(Selection::Over),
        "under" | "u" => return Some(Selection::Under),
        "draw" | "tie" => return Some(Selection::Draw),
        _ => {}
    }
    if desc.starts_with("over ") {
        return Some(Selection::Over);
    }
    if desc.starts_with("under ") {
        return Some(Selection::Under);
    }
    if !home.is_empty() && desc.starts_with(&home.to_lowercase()) {
        return Some(Selection::Home);
    }
    if !away.is_empty() && desc.starts_with(&away.to_lowercase()) {
        return Some(Selection::Away);
    }
    None
}

fn line_from(outcome: &Value, market: &Value) -> Option<f64> {
    let price = outcome.get("price").unwrap_or(&Value::Null);
    LINE_KEYS.iter().find_map(|k| {
        price
            .get(*k)
            .or_else(|| outcome.get(*k))
            .or_else(|| market.get(*k))
            .and_then(lenient_f64)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
