//! Minimal moneyline mapper for simple JSON feeds.
//!
//! Accepts `{events|data: [...]}` or a list of such blocks. Each event has
//! `markets` or `lines`, each with `outcomes` or `selections`; the first
//! two outcomes of a moneyline market are taken as home and away.

use serde_json::{json, Value};
use tracing::debug;

use super::{
    array_field, find_kickoff, keyword_matches, lenient_f64, string_field, EventInfo, FeedContext,
    Mapper,
};
use crate::types::{LineStatus, MarketKind, Selection, Snapshot};

const MONEYLINE_KEYWORDS: &[&str] = &["moneyline", "money line", "ml"];
const KICKOFF_KEYS: &[&str] = &["startTime", "start_time", "startsAt", "kickoff", "start"];

#[derive(Debug, Default)]
pub struct GenericMapper;

impl GenericMapper {
    pub fn new() -> Self {
        Self
    }
}

impl Mapper for GenericMapper {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn version(&self) -> &'static str {
        "generic_v1"
    }

    fn map(&self, payload: &Value, ctx: &FeedContext) -> Vec<Snapshot> {
        let mut out = Vec::new();
        for event in collect_events(payload) {
            let Some(event_key) = string_field(event, &["id", "eventId", "gameId"]) else {
                debug!(book = %ctx.bookmaker, "Skipping event without id");
                continue;
            };
            // Feeds without a start time fall back to capture time.
            let info = EventInfo {
                event_key,
                kickoff: find_kickoff(event, KICKOFF_KEYS).unwrap_or(ctx.captured_at),
                line_status: LineStatus::Open,
            };

            for market in array_field(event, &["markets", "lines"]) {
                let desc = string_field(market, &["description", "name"])
                    .unwrap_or_default()
                    .to_lowercase();
                if !MONEYLINE_KEYWORDS.iter().any(|k| keyword_matches(&desc, k)) {
                    continue;
                }
                let outcomes = array_field(market, &["outcomes", "selections"]);
                if outcomes.len() < 2 {
                    continue;
                }
                for (selection, outcome) in [Selection::Home, Selection::Away].into_iter().zip(outcomes) {
                    let Some(odds) = outcome_decimal(outcome) else {
                        continue;
                    };
                    let mut snap = ctx.snapshot(&info, MarketKind::Moneyline, selection, odds);
                    snap.raw = json!({"market": desc});
                    out.push(snap);
                }
            }
        }
        out
    }
}

fn collect_events(payload: &Value) -> Vec<&Value> {
    match payload {
        Value::Array(items) => items.iter().flat_map(collect_events).collect(),
        Value::Object(_) => array_field(payload, &["events", "data"]).iter().collect(),
        _ => Vec::new(),
    }
}

fn outcome_decimal(outcome: &Value) -> Option<f64> {
    for key in ["price", "odds"] {
        match outcome.get(key) {
            Some(obj @ Value::Object(_)) => {
                if let Some(d) = obj.get("decimal").and_then(lenient_f64) {
                    return Some(d);
                }
            }
            Some(v) => {
                if let Some(d) = lenient_f64(v) {
                    return Some(d);
                }
            }
            None => {}
        }
    }
    None
}
