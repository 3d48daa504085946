//! SQLite-backed `QuoteStore`.
//!
//! Two append-only tables, `quotes_snapshots` and `ev_hits`. Times are
//! UTC epoch milliseconds. SQLite has no TTL index, so expiry is the
//! scheduled `purge_expired` sweep.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::{PurgeReport, QuoteStore, RetentionPolicy, SnapshotFilter};
use crate::types::{Hit, LineStatus, LinewatchError, MarketKind, Provenance, Snapshot};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS quotes_snapshots (
        id              TEXT PRIMARY KEY,
        bookmaker       TEXT NOT NULL,
        event_key       TEXT NOT NULL,
        sport           TEXT NOT NULL,
        league          TEXT NOT NULL,
        kickoff_ms      INTEGER NOT NULL,
        market          TEXT NOT NULL,
        period          TEXT NOT NULL,
        selection       TEXT NOT NULL,
        odds            REAL NOT NULL,
        line            REAL,
        line_status     TEXT NOT NULL,
        captured_at_ms  INTEGER NOT NULL,
        source_url      TEXT NOT NULL,
        spider_version  TEXT NOT NULL,
        http_status     INTEGER,
        raw             TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_quotes_book_market_time
        ON quotes_snapshots (bookmaker, market, captured_at_ms DESC)",
    "CREATE INDEX IF NOT EXISTS idx_quotes_event_time
        ON quotes_snapshots (event_key, captured_at_ms DESC)",
    "CREATE INDEX IF NOT EXISTS idx_quotes_ttl ON quotes_snapshots (captured_at_ms)",
    r#"
    CREATE TABLE IF NOT EXISTS ev_hits (
        id                TEXT PRIMARY KEY,
        event_key         TEXT NOT NULL,
        market            TEXT NOT NULL,
        selection         TEXT NOT NULL,
        bookmaker         TEXT NOT NULL,
        odds              REAL NOT NULL,
        fair_probability  REAL NOT NULL,
        edge              REAL NOT NULL,
        policy            TEXT NOT NULL,
        captured_at_ms    INTEGER NOT NULL,
        quote_age_secs    REAL NOT NULL,
        computed_at_ms    INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_hits_event_market_sel_time
        ON ev_hits (event_key, market, selection, computed_at_ms DESC)",
    "CREATE INDEX IF NOT EXISTS idx_hits_ttl ON ev_hits (computed_at_ms)",
];

const SNAPSHOT_COLUMNS: &str = "bookmaker, event_key, sport, league, kickoff_ms, market, period, \
     selection, odds, line, line_status, captured_at_ms, source_url, spider_version, http_status, raw";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database file at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, LinewatchError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        info!(path = %path.display(), "SQLite store opened");
        Ok(Self { pool })
    }

    /// Private in-memory database. A single long-lived connection keeps
    /// the data alive for the store's lifetime.
    pub async fn in_memory() -> Result<Self, LinewatchError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl QuoteStore for SqliteStore {
    async fn init(&self) -> Result<(), LinewatchError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        debug!("Schema ensured");
        Ok(())
    }

    async fn insert_snapshot(&self, s: &Snapshot) -> Result<(), LinewatchError> {
        let raw = serde_json::to_string(&s.raw).unwrap_or_else(|_| "null".to_string());
        sqlx::query(
            r#"
            INSERT INTO quotes_snapshots (
                id, bookmaker, event_key, sport, league, kickoff_ms, market, period,
                selection, odds, line, line_status, captured_at_ms, source_url,
                spider_version, http_status, raw
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&s.bookmaker)
        .bind(&s.event_key)
        .bind(&s.sport)
        .bind(&s.league)
        .bind(s.kickoff.timestamp_millis())
        .bind(s.market.id())
        .bind(&s.period)
        .bind(s.selection.as_str())
        .bind(s.odds)
        .bind(s.line)
        .bind(s.line_status.as_str())
        .bind(s.captured_at.timestamp_millis())
        .bind(&s.provenance.source_url)
        .bind(&s.provenance.spider_version)
        .bind(s.http_status.map(i64::from))
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_hit(&self, h: &Hit) -> Result<(), LinewatchError> {
        sqlx::query(
            r#"
            INSERT INTO ev_hits (
                id, event_key, market, selection, bookmaker, odds, fair_probability,
                edge, policy, captured_at_ms, quote_age_secs, computed_at_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&h.event_key)
        .bind(h.market.id())
        .bind(h.selection.as_str())
        .bind(&h.bookmaker)
        .bind(h.odds)
        .bind(h.fair_probability)
        .bind(h.edge)
        .bind(h.policy.as_str())
        .bind(h.captured_at.timestamp_millis())
        .bind(h.quote_age_secs)
        .bind(h.computed_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_quotes(
        &self,
        markets: &[MarketKind],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Snapshot>, LinewatchError> {
        if markets.is_empty() {
            return Ok(Vec::new());
        }
        // Latest row per key inside SQL; ties on capture time go to the
        // later insert.
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM (\
             SELECT {SNAPSHOT_COLUMNS}, ROW_NUMBER() OVER (\
             PARTITION BY event_key, market, selection, bookmaker \
             ORDER BY captured_at_ms DESC, rowid DESC) AS rn \
             FROM quotes_snapshots WHERE market IN ("
        ));
        let mut ids = qb.separated(", ");
        for m in markets {
            ids.push_bind(m.id());
        }
        ids.push_unseparated(")");
        if let Some(since) = since {
            qb.push(" AND captured_at_ms >= ").push_bind(since.timestamp_millis());
        }
        qb.push(") WHERE rn = 1 ORDER BY captured_at_ms ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(decode_rows(&rows, snapshot_from_row))
    }

    async fn recent_snapshots(
        &self,
        filter: &SnapshotFilter,
        limit: usize,
    ) -> Result<Vec<Snapshot>, LinewatchError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM quotes_snapshots WHERE 1 = 1"
        ));
        if let Some(book) = &filter.bookmaker {
            qb.push(" AND bookmaker = ").push_bind(book.clone());
        }
        if let Some(event) = &filter.event_key {
            qb.push(" AND event_key = ").push_bind(event.clone());
        }
        if let Some(market) = filter.market {
            qb.push(" AND market = ").push_bind(market.id());
        }
        qb.push(" ORDER BY captured_at_ms DESC LIMIT ")
            .push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(decode_rows(&rows, snapshot_from_row))
    }

    async fn recent_hits(&self, limit: usize) -> Result<Vec<Hit>, LinewatchError> {
        let rows = sqlx::query(
            r#"
            SELECT event_key, market, selection, bookmaker, odds, fair_probability, edge,
                   policy, captured_at_ms, quote_age_secs, computed_at_ms
            FROM ev_hits ORDER BY computed_at_ms DESC LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(decode_rows(&rows, hit_from_row))
    }

    async fn capture_times(
        &self,
        bookmaker: Option<&str>,
    ) -> Result<Vec<DateTime<Utc>>, LinewatchError> {
        let rows = match bookmaker {
            Some(book) => {
                sqlx::query("SELECT captured_at_ms FROM quotes_snapshots WHERE bookmaker = ?")
                    .bind(book)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT captured_at_ms FROM quotes_snapshots")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter()
            .map(|r| millis_to_utc(r.try_get("captured_at_ms")?))
            .collect()
    }

    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        policy: &RetentionPolicy,
    ) -> Result<PurgeReport, LinewatchError> {
        let snapshots = sqlx::query("DELETE FROM quotes_snapshots WHERE captured_at_ms < ?")
            .bind(policy.quotes_cutoff(now).timestamp_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();
        let hits = sqlx::query("DELETE FROM ev_hits WHERE computed_at_ms < ?")
            .bind(policy.hits_cutoff(now).timestamp_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(PurgeReport { snapshots, hits })
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

/// Decode every row, skipping the ones that fail with a warning.
fn decode_rows<T>(
    rows: &[SqliteRow],
    from_row: impl Fn(&SqliteRow) -> Result<T, LinewatchError>,
) -> Vec<T> {
    let mut out = Vec::with_capacity(rows.len());
    let mut skipped = 0usize;
    for row in rows {
        match from_row(row) {
            Ok(item) => out.push(item),
            Err(e) => {
                skipped += 1;
                warn!(error = %e, "Skipping undecodable row");
            }
        }
    }
    if skipped > 0 {
        warn!(skipped, decoded = out.len(), "Rows skipped while decoding");
    }
    out
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, LinewatchError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| LinewatchError::Store(format!("timestamp out of range: {ms}")))
}

fn decode<T: FromStr<Err = LinewatchError>>(row: &SqliteRow, column: &str) -> Result<T, LinewatchError> {
    let value: String = row.try_get(column)?;
    value.parse()
}

fn snapshot_from_row(row: &SqliteRow) -> Result<Snapshot, LinewatchError> {
    let raw: String = row.try_get("raw")?;
    let http_status: Option<i64> = row.try_get("http_status")?;
    Ok(Snapshot {
        bookmaker: row.try_get("bookmaker")?,
        event_key: row.try_get("event_key")?,
        sport: row.try_get("sport")?,
        league: row.try_get("league")?,
        kickoff: millis_to_utc(row.try_get("kickoff_ms")?)?,
        market: decode(row, "market")?,
        period: row.try_get("period")?,
        selection: decode(row, "selection")?,
        odds: row.try_get("odds")?,
        line: row.try_get("line")?,
        line_status: decode::<LineStatus>(row, "line_status")?,
        captured_at: millis_to_utc(row.try_get("captured_at_ms")?)?,
        provenance: Provenance {
            source_url: row.try_get("source_url")?,
            spider_version: row.try_get("spider_version")?,
        },
        http_status: http_status.and_then(|s| u16::try_from(s).ok()),
        raw: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
    })
}

fn hit_from_row(row: &SqliteRow) -> Result<Hit, LinewatchError> {
    Ok(Hit {
        event_key: row.try_get("event_key")?,
        market: decode(row, "market")?,
        selection: decode(row, "selection")?,
        bookmaker: row.try_get("bookmaker")?,
        odds: row.try_get("odds")?,
        fair_probability: row.try_get("fair_probability")?,
        edge: row.try_get("edge")?,
        policy: decode(row, "policy")?,
        captured_at: millis_to_utc(row.try_get("captured_at_ms")?)?,
        quote_age_secs: row.try_get("quote_age_secs")?,
        computed_at: millis_to_utc(row.try_get("computed_at_ms")?)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
