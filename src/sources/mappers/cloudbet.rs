//! Cloudbet odds API mapper.
//!
//! `events[]` (or `data[]`, or a bare list) whose `markets` are either a
//! map keyed by market key or a list of `{key, submarkets}` objects.
//! Submarkets may themselves be a map or a list; selections carry an
//! `outcome` label and a price. Only complete markets are emitted.

use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

use super::{
    american_price, array_field, find_kickoff, lenient_f64, string_field, EventInfo, FeedContext,
    Mapper,
};
use crate::types::{LineStatus, LinewatchError, MarketKind, Selection, Snapshot};

const KICKOFF_KEYS: &[&str] = &[
    "startTime",
    "start_time",
    "startsAt",
    "start",
    "kickoff",
    "kickOff",
    "kickoffTime",
    "scheduledStartTime",
    "startTimestamp",
    "startTimeUnix",
    "fixtureStartTime",
    "eventStart",
    "startDate",
    "cutoffTime",
];

const DECIMAL_KEYS: &[&str] = &["price", "decimalOdds", "oddsDecimal", "odds", "d"];

/// Canonical market for an upstream market key.
pub fn market_for_key(key: &str) -> Option<MarketKind> {
    match key {
        "soccer.matchOdds" => Some(MarketKind::ThreeWay),
        "tennis.winner" => Some(MarketKind::Moneyline),
        k if k.ends_with(".moneyline") => Some(MarketKind::Moneyline),
        _ => None,
    }
}

fn selection_alias(label: &str) -> Option<Selection> {
    match label {
        "home" | "1" | "team1" | "player1" | "hometeam" => Some(Selection::Home),
        "away" | "2" | "team2" | "player2" | "awayteam" => Some(Selection::Away),
        "draw" | "x" | "tie" => Some(Selection::Draw),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct CloudbetMapper;

impl CloudbetMapper {
    pub fn new() -> Self {
        Self
    }

    fn map_event(&self, event: &Value, ctx: &FeedContext) -> Result<Vec<Snapshot>, LinewatchError> {
        let event_key = string_field(event, &["id", "eventId", "key"]).ok_or_else(|| LinewatchError::Parse {
            context: "cloudbet".to_string(),
            message: "event has no id".to_string(),
        })?;
        let kickoff = find_kickoff(event, KICKOFF_KEYS).ok_or_else(|| LinewatchError::Parse {
            context: "cloudbet".to_string(),
            message: format!("event {event_key} has no kickoff"),
        })?;
        let live = string_field(event, &["status"])
            .map(|s| s.to_ascii_uppercase() == "TRADING_LIVE")
            .unwrap_or(false);
        let info = EventInfo {
            event_key,
            kickoff,
            line_status: if live { LineStatus::Live } else { LineStatus::Open },
        };

        let keys = if ctx.markets.is_empty() {
            market_keys(event)
        } else {
            ctx.markets.clone()
        };

        let mut out = Vec::new();
        for key in keys {
            let Some(kind) = market_for_key(&key) else {
                continue;
            };

            // Last quote wins per canonical outcome.
            let mut prices: HashMap<Selection, f64> = HashMap::new();
            for sel in selections(event, &key) {
                let label = string_field(sel, &["outcome", "name"])
                    .unwrap_or_default()
                    .to_lowercase();
                let (Some(selection), Some(price)) = (selection_alias(&label), selection_price(sel)) else {
                    continue;
                };
                prices.insert(selection, price);
            }

            let wanted = kind.selections();
            if !wanted.iter().all(|s| prices.contains_key(s)) {
                debug!(
                    event = %info.event_key,
                    market = %key,
                    have = prices.len(),
                    want = wanted.len(),
                    "Incomplete market"
                );
                continue;
            }

            for selection in wanted {
                let mut snap = ctx.snapshot(&info, kind, *selection, prices[selection]);
                snap.raw = json!({"event_id": info.event_key, "market_key": key});
                out.push(snap);
            }
        }
        Ok(out)
    }
}

impl Mapper for CloudbetMapper {
    fn name(&self) -> &'static str {
        "cloudbet"
    }

    fn version(&self) -> &'static str {
        "cloudbet_v2"
    }

    fn map(&self, payload: &Value, ctx: &FeedContext) -> Vec<Snapshot> {
        let events: &[Value] = match payload {
            Value::Array(items) => items,
            other => array_field(other, &["events", "data"]),
        };

        let mut out = Vec::new();
        for event in events {
            match self.map_event(event, ctx) {
                Ok(snaps) => out.extend(snaps),
                Err(e) => debug!(book = %ctx.bookmaker, error = %e, "Skipping event"),
            }
        }
        out
    }
}

/// Market keys present on an event, in payload order.
fn market_keys(event: &Value) -> Vec<String> {
    match event.get("markets") {
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(|m| string_field(m, &["key", "marketKey"]))
            .collect(),
        _ => Vec::new(),
    }
}

/// Every selection under market `key`, whatever the nesting shape.
fn selections<'a>(event: &'a Value, key: &str) -> Vec<&'a Value> {
    let market = match event.get("markets") {
        Some(Value::Object(map)) => map.get(key),
        Some(Value::Array(list)) => list.iter().find(|m| {
            string_field(m, &["key", "marketKey"])
                .map(|k| k.eq_ignore_ascii_case(key))
                .unwrap_or(false)
        }),
        _ => None,
    };
    let Some(market) = market else {
        return Vec::new();
    };

    let submarkets: Vec<&Value> = match market.get("submarkets").or_else(|| market.get("subMarkets")) {
        Some(Value::Object(map)) => map.values().collect(),
        Some(Value::Array(list)) => list.iter().collect(),
        _ => vec![market],
    };

    submarkets
        .into_iter()
        .flat_map(|s| array_field(s, &["selections", "outcomes"]).iter())
        .collect()
}

fn selection_price(sel: &Value) -> Option<f64> {
    DECIMAL_KEYS
        .iter()
        .find_map(|k| sel.get(*k).and_then(lenient_f64))
        .or_else(|| {
            sel.get("americanOdds")
                .or_else(|| sel.get("american"))
                .and_then(american_price)
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
