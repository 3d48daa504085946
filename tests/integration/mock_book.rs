//! Mock bookmaker HTTP server.
//!
//! Serves a handful of deterministic routes on `127.0.0.1:0` and counts
//! every request so tests can assert on retries and cache behaviour.
//!
//! - `/etag`: 200 with an `ETag`, 304 when the client replays it
//! - `/flaky`: 503 for the first `flaky_failures` requests, then 200
//! - `/down`: always 503
//! - `/missing`: always 404
//! - `/echo`: 200, records the request's query and cache headers
//! - `/feeds/:book`: the payload installed for `book`, 404 otherwise
//! - `/robots.txt`: the installed status and body, 404 otherwise

use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const ETAG_VALUE: &str = "\"v1\"";
pub const ECHO_ETAG: &str = "\"echo\"";

/// What `/echo` saw on its last request.
#[derive(Debug, Clone, Default)]
pub struct EchoRecord {
    pub query: Option<String>,
    pub if_none_match: Option<String>,
    pub cache_control: Option<String>,
    pub pragma: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Default)]
pub struct BookState {
    pub etag_hits: AtomicUsize,
    pub etag_conditional: AtomicUsize,
    pub flaky_hits: AtomicUsize,
    pub flaky_failures: usize,
    pub down_hits: AtomicUsize,
    pub missing_hits: AtomicUsize,
    pub echo_hits: AtomicUsize,
    pub echo_last: Mutex<Option<EchoRecord>>,
    pub feeds: Mutex<HashMap<String, Value>>,
    pub robots_hits: AtomicUsize,
    pub robots: Mutex<Option<(u16, String)>>,
}

pub struct MockBook {
    pub base: String,
    pub state: Arc<BookState>,
}

impl MockBook {
    pub async fn start() -> Self {
        Self::with_flaky_failures(0).await
    }

    pub async fn with_flaky_failures(flaky_failures: usize) -> Self {
        let state = Arc::new(BookState {
            flaky_failures,
            ..Default::default()
        });
        let app = Router::new()
            .route("/etag", get(etag))
            .route("/flaky", get(flaky))
            .route("/down", get(down))
            .route("/missing", get(missing))
            .route("/echo", get(echo))
            .route("/feeds/:book", get(feed))
            .route("/robots.txt", get(robots))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            state,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn set_feed(&self, book: &str, payload: Value) {
        self.state
            .feeds
            .lock()
            .unwrap()
            .insert(book.to_string(), payload);
    }

    pub fn set_robots(&self, status: u16, body: &str) {
        *self.state.robots.lock().unwrap() = Some((status, body.to_string()));
    }

    pub fn echo_last(&self) -> EchoRecord {
        self.state.echo_last.lock().unwrap().clone().unwrap_or_default()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// A Bovada-shaped coupon with one full-time 3-way market.
pub fn bovada_three_way(event_id: &str, home: f64, draw: f64, away: f64) -> Value {
    json!([{
        "path": [{"description": "EPL"}],
        "events": [{
            "id": event_id,
            "description": "Arsenal vs Chelsea",
            "startTime": 1740841200000u64,
            "live": false,
            "competitors": [
                {"name": "Arsenal", "home": true},
                {"name": "Chelsea", "home": false}
            ],
            "displayGroups": [{
                "markets": [{
                    "description": "3-Way Moneyline",
                    "period": {"abbreviation": "M"},
                    "outcomes": [
                        {"description": "Arsenal", "type": "H", "price": {"decimal": format!("{home:.2}")}},
                        {"description": "Draw", "type": "D", "price": {"decimal": format!("{draw:.2}")}},
                        {"description": "Chelsea", "type": "A", "price": {"decimal": format!("{away:.2}")}}
                    ]
                }]
            }]
        }]
    }])
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn etag(State(state): State<Arc<BookState>>, headers: HeaderMap) -> Response {
    state.etag_hits.fetch_add(1, Ordering::SeqCst);
    if header_string(&headers, header::IF_NONE_MATCH).as_deref() == Some(ETAG_VALUE) {
        state.etag_conditional.fetch_add(1, Ordering::SeqCst);
        return StatusCode::NOT_MODIFIED.into_response();
    }
    (
        StatusCode::OK,
        [(header::ETAG, ETAG_VALUE)],
        Json(json!({"events": []})),
    )
        .into_response()
}

async fn flaky(State(state): State<Arc<BookState>>) -> Response {
    let n = state.flaky_hits.fetch_add(1, Ordering::SeqCst) + 1;
    if n <= state.flaky_failures {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    Json(json!({"ok": true, "attempt": n})).into_response()
}

async fn down(State(state): State<Arc<BookState>>) -> Response {
    state.down_hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::SERVICE_UNAVAILABLE.into_response()
}

async fn missing(State(state): State<Arc<BookState>>) -> Response {
    state.missing_hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::NOT_FOUND.into_response()
}

async fn echo(
    State(state): State<Arc<BookState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    state.echo_hits.fetch_add(1, Ordering::SeqCst);
    let record = EchoRecord {
        query,
        if_none_match: header_string(&headers, header::IF_NONE_MATCH),
        cache_control: header_string(&headers, header::CACHE_CONTROL),
        pragma: header_string(&headers, header::PRAGMA),
        api_key: headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };
    *state.echo_last.lock().unwrap() = Some(record);
    (
        StatusCode::OK,
        [(header::ETAG, ECHO_ETAG)],
        Json(json!({"events": []})),
    )
        .into_response()
}

async fn feed(State(state): State<Arc<BookState>>, Path(book): Path<String>) -> Response {
    match state.feeds.lock().unwrap().get(&book) {
        Some(payload) => Json(payload.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn robots(State(state): State<Arc<BookState>>) -> Response {
    state.robots_hits.fetch_add(1, Ordering::SeqCst);
    match state.robots.lock().unwrap().clone() {
        Some((status, body)) => {
            let status = StatusCode::from_u16(status).unwrap();
            (status, body).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
