//! End-to-end: mock bookmaker feeds → `FeedJob` → `MemoryStore` →
//! `ConsensusEngine`.

use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;

use linewatch::consensus::{ConsensusConfig, ConsensusEngine};
use linewatch::fetch::{CircuitBreaker, FetchClient, FetchConfig, ValidatorCache};
use linewatch::sources::mappers::{build_mapper, MapperSettings};
use linewatch::sources::{Feed, FeedJob, SourceJob};
use linewatch::storage::{MemoryStore, QuoteStore, SnapshotFilter};
use linewatch::types::{LinewatchError, MarketKind, ScanPolicy, Selection};

use crate::mock_book::{bovada_three_way, MockBook};

fn fetch_client() -> Arc<FetchClient> {
    let config = FetchConfig {
        max_attempts: 1,
        timeout: Duration::from_secs(5),
        ..FetchConfig::default()
    };
    Arc::new(
        FetchClient::new(
            config,
            Arc::new(CircuitBreaker::default()),
            Arc::new(ValidatorCache::in_memory()),
        )
        .unwrap(),
    )
}

fn feed(url: String) -> Feed {
    Feed {
        url,
        sport: "soccer".to_string(),
        league: "EPL".to_string(),
        markets: Vec::new(),
    }
}

fn job(key: &str, urls: Vec<String>, client: &Arc<FetchClient>, store: &Arc<MemoryStore>) -> FeedJob {
    let mapper = build_mapper("bovada", MapperSettings::default()).unwrap();
    FeedJob::new(
        key,
        urls.into_iter().map(feed).collect(),
        client.clone(),
        mapper,
        store.clone(),
    )
}

/// Three books quoting one 3-way market, already ingested.
async fn three_books() -> (MockBook, Arc<FetchClient>, Arc<MemoryStore>) {
    let book = MockBook::start().await;
    book.set_feed("alpha", bovada_three_way("9001", 2.10, 3.40, 3.60));
    book.set_feed("bravo", bovada_three_way("9001", 2.05, 3.50, 3.80));
    book.set_feed("charlie", bovada_three_way("9001", 2.20, 3.30, 3.50));

    let client = fetch_client();
    let store = Arc::new(MemoryStore::new());
    for key in ["alpha", "bravo", "charlie"] {
        let job = job(key, vec![book.url(&format!("/feeds/{key}"))], &client, &store);
        let stats = job.run_with_stats().await.unwrap();
        assert_eq!(stats.snapshots_stored, 3, "{key}");
    }
    (book, client, store)
}

// ---------------------------------------------------------------------------
// Ingest → consensus
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_three_books_no_arbitrage() {
    let (_book, _client, store) = three_books().await;
    assert_eq!(store.snapshot_count(), 9);

    let engine = ConsensusEngine::new(store.clone(), ConsensusConfig::default());
    let report = engine.scan(ScanPolicy::CrossBook, 0.02).await.unwrap();
    assert_eq!(report.groups_scanned, 1);
    assert!(report.arbitrages.is_empty());
    assert!(report.hits.is_empty());

    let single = engine.scan(ScanPolicy::SingleBook, 0.02).await.unwrap();
    assert!(single.hits.is_empty());
}

#[tokio::test]
async fn test_best_prices_picked_across_books() {
    let (_book, _client, store) = three_books().await;
    let engine = ConsensusEngine::new(store, ConsensusConfig::default());

    let report = engine.scan(ScanPolicy::CrossBook, -0.01).await.unwrap();
    let mut picks: Vec<(Selection, String)> = report
        .hits
        .iter()
        .map(|h| (h.selection, h.bookmaker.clone()))
        .collect();
    picks.sort();
    assert_eq!(
        picks,
        vec![
            (Selection::Home, "charlie".to_string()),
            (Selection::Draw, "bravo".to_string()),
            (Selection::Away, "bravo".to_string()),
        ]
    );
    assert!(report.hits.iter().all(|h| h.event_key == "9001"));
}

#[tokio::test]
async fn test_price_move_creates_arbitrage_and_hits_are_stored() {
    let (book, client, store) = three_books().await;

    book.set_feed("charlie", bovada_three_way("9001", 2.60, 3.90, 4.20));
    let charlie = job("charlie", vec![book.url("/feeds/charlie")], &client, &store);
    assert_eq!(charlie.run_once().await.unwrap(), 3);

    let engine = ConsensusEngine::new(store.clone(), ConsensusConfig::default());
    let report = engine.scan(ScanPolicy::CrossBook, 0.02).await.unwrap();
    assert_eq!(report.arbitrages.len(), 1);
    let arb = &report.arbitrages[0];
    assert_eq!(arb.market, MarketKind::ThreeWay);
    assert!(arb.legs.iter().all(|l| l.bookmaker == "charlie"));
    assert!(arb.implied_sum < 1.0);

    let stored = engine
        .scan_and_store(ScanPolicy::CrossBook, 0.02)
        .await
        .unwrap();
    assert_eq!(stored, report.hits.len());
    assert_eq!(store.hit_count(), stored);
    // Charlie's line sets the fair price; bravo's draw and away are still
    // above it by more than the threshold.
    let hits = store.recent_hits(10).await.unwrap();
    assert_eq!(hits.len(), 5);
    assert!(hits.iter().all(|h| h.policy == ScanPolicy::CrossBook));
    assert_eq!(hits.iter().filter(|h| h.bookmaker == "charlie").count(), 3);
    assert_eq!(hits.iter().filter(|h| h.bookmaker == "bravo").count(), 2);
}

// ---------------------------------------------------------------------------
// Source job behaviour over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unchanged_feed_is_skipped() {
    let book = MockBook::start().await;
    let client = fetch_client();
    let store = Arc::new(MemoryStore::new());
    let job = job("alpha", vec![book.url("/etag")], &client, &store);

    let first = job.run_with_stats().await.unwrap();
    assert_eq!(first.feeds_ok, 1);
    assert_eq!(first.feeds_unchanged, 0);

    let second = job.run_with_stats().await.unwrap();
    assert_eq!(second.feeds_ok, 0);
    assert_eq!(second.feeds_unchanged, 1);
    assert_eq!(store.snapshot_count(), 0);
}

#[tokio::test]
async fn test_partial_feed_failure_is_success() {
    let book = MockBook::start().await;
    book.set_feed("alpha", bovada_three_way("9001", 2.10, 3.40, 3.60));
    let client = fetch_client();
    let store = Arc::new(MemoryStore::new());

    let mixed = job(
        "alpha",
        vec![book.url("/missing"), book.url("/feeds/alpha")],
        &client,
        &store,
    );
    let stats = mixed.run_with_stats().await.unwrap();
    assert_eq!(stats.feeds_failed, 1);
    assert_eq!(stats.feeds_ok, 1);
    assert_eq!(stats.snapshots_stored, 3);

    let broken = job("alpha", vec![book.url("/missing")], &client, &store);
    let err = broken.run_once().await.unwrap_err();
    assert!(matches!(err, LinewatchError::Http { status: 404, .. }));
}

#[tokio::test]
async fn test_feed_disallowed_by_robots_fails_the_run() {
    let book = MockBook::start().await;
    book.set_feed("alpha", bovada_three_way("9001", 2.10, 3.40, 3.60));
    book.set_robots(200, "User-agent: *\nDisallow: /feeds/\n");
    let client = fetch_client();
    let store = Arc::new(MemoryStore::new());

    let job = job("alpha", vec![book.url("/feeds/alpha")], &client, &store);
    let err = job.run_once().await.unwrap_err();
    assert!(matches!(err, LinewatchError::Config(_)));
    assert!(!err.is_skip());
    assert_eq!(store.snapshot_count(), 0);
}

#[tokio::test]
async fn test_store_failure_drops_items_only() {
    let book = MockBook::start().await;
    book.set_feed("alpha", bovada_three_way("9001", 2.10, 3.40, 3.60));
    let client = fetch_client();
    let store = Arc::new(MemoryStore::new());
    store.set_fail_writes(true);

    let job = job("alpha", vec![book.url("/feeds/alpha")], &client, &store);
    let stats = job.run_with_stats().await.unwrap();
    assert_eq!(stats.snapshots_mapped, 3);
    assert_eq!(stats.store_errors, 3);
    assert_eq!(stats.snapshots_stored, 0);
}

#[tokio::test]
async fn test_api_key_sent_and_snapshots_carry_provenance() {
    let book = MockBook::start().await;
    book.set_feed("alpha", bovada_three_way("9001", 2.10, 3.40, 3.60));
    let client = fetch_client();
    let store = Arc::new(MemoryStore::new());

    let keyed = job("alpha", vec![book.url("/echo")], &client, &store)
        .with_api_key(Some(SecretString::new("k-123".to_string())));
    keyed.run_with_stats().await.unwrap();
    assert_eq!(book.echo_last().api_key.as_deref(), Some("k-123"));

    let plain = job("alpha", vec![book.url("/feeds/alpha")], &client, &store);
    plain.run_with_stats().await.unwrap();
    let filter = SnapshotFilter {
        bookmaker: Some("alpha".to_string()),
        ..Default::default()
    };
    let snaps = store.recent_snapshots(&filter, 10).await.unwrap();
    assert_eq!(snaps.len(), 3);
    for s in &snaps {
        assert_eq!(s.provenance.source_url, book.url("/feeds/alpha"));
        assert_eq!(s.provenance.spider_version, "bovada_v2");
        assert_eq!(s.http_status, Some(200));
        assert_eq!(s.league, "EPL");
    }
}
