//! `FetchClient` against the mock bookmaker: conditional requests,
//! no-cache mode, retries and circuit breaking.

use std::sync::Arc;
use std::time::{Duration, Instant};

use linewatch::fetch::{
    domain_of, CircuitBreaker, CircuitConfig, FetchClient, FetchConfig, FetchError, ValidatorCache,
};

use crate::mock_book::{MockBook, ECHO_ETAG, ETAG_VALUE};

fn fast_config(max_attempts: u32) -> FetchConfig {
    FetchConfig {
        user_agent: "linewatch-test/0.1".to_string(),
        timeout: Duration::from_secs(5),
        max_attempts,
        base_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        ..FetchConfig::default()
    }
}

fn client_with(max_attempts: u32, circuit: CircuitConfig) -> FetchClient {
    FetchClient::new(
        fast_config(max_attempts),
        Arc::new(CircuitBreaker::new(circuit)),
        Arc::new(ValidatorCache::in_memory()),
    )
    .unwrap()
}

fn client(max_attempts: u32) -> FetchClient {
    client_with(max_attempts, CircuitConfig::default())
}

fn domain(url: &str) -> String {
    domain_of(&reqwest::Url::parse(url).unwrap()).unwrap()
}

// ---------------------------------------------------------------------------
// Conditional requests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_conditional_fetch_returns_not_modified() {
    let book = MockBook::start().await;
    let client = client(3);
    let url = book.url("/etag");

    let first = client.fetch(&url, None, false).await.unwrap();
    assert_eq!(first.status, 200);
    assert!(!first.is_unchanged());
    assert!(!first.body.is_empty());
    assert_eq!(client.validators().get(&url).as_deref(), Some(ETAG_VALUE));

    let second = client.fetch(&url, None, false).await.unwrap();
    assert!(second.is_unchanged());
    assert_eq!(second.status, 304);
    assert!(second.body.is_empty());

    assert_eq!(MockBook::count(&book.state.etag_hits), 2);
    assert_eq!(MockBook::count(&book.state.etag_conditional), 1);
    assert_eq!(client.breaker().failures_in_window(&domain(&url), Instant::now()), 0);
}

#[tokio::test]
async fn test_no_cache_bypasses_validators() {
    let book = MockBook::start().await;
    let client = client(3);
    let url = book.url("/echo");

    // Cached fetch records the validator.
    client.fetch(&url, None, false).await.unwrap();
    assert_eq!(client.validators().get(&url).as_deref(), Some(ECHO_ETAG));

    let response = client.fetch(&url, None, true).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.url, url);

    let seen = book.echo_last();
    assert_eq!(seen.if_none_match, None);
    assert!(seen.query.unwrap_or_default().contains("_ts="));
    assert_eq!(seen.cache_control.as_deref(), Some("no-cache"));
    assert_eq!(seen.pragma.as_deref(), Some("no-cache"));

    // Still the token from the cached fetch, nothing else written.
    assert_eq!(client.validators().len(), 1);
    assert_eq!(client.validators().get(&url).as_deref(), Some(ECHO_ETAG));
}

#[tokio::test]
async fn test_no_cache_never_writes_validator() {
    let book = MockBook::start().await;
    let client = client(3);
    let url = book.url("/echo");

    client.fetch(&url, None, true).await.unwrap();
    client.fetch(&url, None, true).await.unwrap();
    assert!(client.validators().is_empty());
    assert_eq!(MockBook::count(&book.state.echo_hits), 2);
}

#[tokio::test]
async fn test_cached_fetch_replays_validator() {
    let book = MockBook::start().await;
    let client = client(3);
    let url = book.url("/echo");

    client.fetch(&url, None, false).await.unwrap();
    assert_eq!(book.echo_last().if_none_match, None);

    client.fetch(&url, None, false).await.unwrap();
    let seen = book.echo_last();
    assert_eq!(seen.if_none_match.as_deref(), Some(ECHO_ETAG));
    assert_eq!(seen.query, None);
}

// ---------------------------------------------------------------------------
// Retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_transient_status_retried_until_success() {
    let book = MockBook::with_flaky_failures(2).await;
    let client = client(3);
    let url = book.url("/flaky");

    let response = client.fetch(&url, None, false).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(MockBook::count(&book.state.flaky_hits), 3);
    // Both 503s were counted against the domain.
    assert_eq!(client.breaker().failures_in_window(&domain(&url), Instant::now()), 2);
}

#[tokio::test]
async fn test_retries_exhausted_surface_last_status() {
    let book = MockBook::start().await;
    let client = client(2);
    let url = book.url("/down");

    let err = client.fetch(&url, None, false).await.unwrap_err();
    assert!(matches!(err, FetchError::Http { status: 503, .. }));
    assert_eq!(MockBook::count(&book.state.down_hits), 2);
}

#[tokio::test]
async fn test_client_error_not_retried() {
    let book = MockBook::start().await;
    let client = client(3);
    let url = book.url("/missing");

    let err = client.fetch(&url, None, false).await.unwrap_err();
    assert!(matches!(err, FetchError::Http { status: 404, .. }));
    assert_eq!(MockBook::count(&book.state.missing_hits), 1);
    assert_eq!(client.breaker().failures_in_window(&domain(&url), Instant::now()), 0);
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    // Bind then drop to get a port nobody listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client(2);
    let err = client
        .fetch(&format!("http://{addr}/feed"), None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Network { .. }));
}

// ---------------------------------------------------------------------------
// Circuit breaking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_breaker_opens_and_short_circuits() {
    let book = MockBook::start().await;
    let other = MockBook::start().await;
    let client = client_with(
        1,
        CircuitConfig {
            fail_threshold: 3,
            window: Duration::from_secs(60),
            cool_off: Duration::from_secs(120),
        },
    );
    let url = book.url("/down");

    for _ in 0..3 {
        let err = client.fetch(&url, None, false).await.unwrap_err();
        assert!(matches!(err, FetchError::Http { status: 503, .. }));
    }
    let err = client.fetch(&url, None, false).await.unwrap_err();
    assert!(matches!(err, FetchError::CircuitOpen { .. }));
    assert_eq!(MockBook::count(&book.state.down_hits), 3);

    // Same host on another port is another domain.
    let ok = client.fetch(&other.url("/echo"), None, false).await.unwrap();
    assert_eq!(ok.status, 200);
}

#[tokio::test]
async fn test_breaker_opening_mid_retry_surfaces_last_failure() {
    let book = MockBook::start().await;
    let client = client_with(
        5,
        CircuitConfig {
            fail_threshold: 2,
            window: Duration::from_secs(60),
            cool_off: Duration::from_secs(120),
        },
    );
    let url = book.url("/down");

    // The second 503 trips the breaker; the remaining attempts are dropped
    // but the error is the 503, not a skip.
    let err = client.fetch(&url, None, false).await.unwrap_err();
    assert!(matches!(err, FetchError::Http { status: 503, .. }), "{err:?}");
    assert_eq!(MockBook::count(&book.state.down_hits), 2);

    // Nothing goes out once the circuit is already open.
    let err = client.fetch(&url, None, false).await.unwrap_err();
    assert!(matches!(err, FetchError::CircuitOpen { .. }));
    assert_eq!(MockBook::count(&book.state.down_hits), 2);
}

#[tokio::test]
async fn test_dead_domain_fails_until_circuit_is_open() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let url = format!("http://{addr}/feed");

    let client = client_with(
        3,
        CircuitConfig {
            fail_threshold: 5,
            window: Duration::from_secs(60),
            cool_off: Duration::from_secs(120),
        },
    );

    // Three failures, then two more trip the breaker inside the second fetch.
    let first = client.fetch(&url, None, false).await.unwrap_err();
    assert!(matches!(first, FetchError::Network { .. }));
    let second = client.fetch(&url, None, false).await.unwrap_err();
    assert!(matches!(second, FetchError::Network { .. }), "{second:?}");
    assert_eq!(client.breaker().failures_in_window(&domain(&url), Instant::now()), 5);

    let third = client.fetch(&url, None, false).await.unwrap_err();
    assert!(matches!(third, FetchError::CircuitOpen { .. }));
}

// ---------------------------------------------------------------------------
// robots.txt
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_robots_disallowed_path_is_refused() {
    let book = MockBook::start().await;
    book.set_robots(200, "User-agent: *\nDisallow: /down\n");
    let client = client(3);

    let err = client.fetch(&book.url("/down"), None, false).await.unwrap_err();
    assert!(matches!(err, FetchError::Disallowed { .. }));
    assert_eq!(MockBook::count(&book.state.down_hits), 0);

    let ok = client.fetch(&book.url("/echo"), None, false).await.unwrap();
    assert_eq!(ok.status, 200);
    // One robots.txt request per origin.
    assert_eq!(MockBook::count(&book.state.robots_hits), 1);
    assert_eq!(client.robots().len(), 1);
}

#[tokio::test]
async fn test_robots_named_group_applies_to_our_agent() {
    let book = MockBook::start().await;
    book.set_robots(
        200,
        "User-agent: *\nDisallow: /\n\nUser-agent: linewatch-test\nAllow: /\n",
    );
    let client = client(1);

    let ok = client.fetch(&book.url("/echo"), None, false).await.unwrap();
    assert_eq!(ok.status, 200);
}

#[tokio::test]
async fn test_robots_forbidden_blocks_origin() {
    let book = MockBook::start().await;
    book.set_robots(403, "");
    let client = client(1);

    let err = client.fetch(&book.url("/echo"), None, false).await.unwrap_err();
    assert!(matches!(err, FetchError::Disallowed { .. }));
    assert_eq!(MockBook::count(&book.state.echo_hits), 0);
}

#[tokio::test]
async fn test_missing_robots_allows_and_is_cached() {
    let book = MockBook::start().await;
    let client = client(1);

    client.fetch(&book.url("/echo"), None, false).await.unwrap();
    client.fetch(&book.url("/echo"), None, true).await.unwrap();
    assert_eq!(MockBook::count(&book.state.robots_hits), 1);
    assert_eq!(MockBook::count(&book.state.echo_hits), 2);
}

#[tokio::test]
async fn test_unavailable_robots_does_not_block_and_is_retried() {
    let book = MockBook::start().await;
    book.set_robots(503, "");
    let client = client(1);

    client.fetch(&book.url("/echo"), None, false).await.unwrap();
    assert!(client.robots().is_empty());
    client.fetch(&book.url("/echo"), None, false).await.unwrap();
    assert_eq!(MockBook::count(&book.state.robots_hits), 2);
    // robots.txt trouble is not held against the domain.
    assert_eq!(client.breaker().failures_in_window(&domain(&book.url("/echo")), Instant::now()), 0);
}

#[tokio::test]
async fn test_robots_check_can_be_disabled() {
    let book = MockBook::start().await;
    book.set_robots(200, "User-agent: *\nDisallow: /\n");
    let config = FetchConfig {
        respect_robots: false,
        ..fast_config(1)
    };
    let client = FetchClient::new(
        config,
        Arc::new(CircuitBreaker::default()),
        Arc::new(ValidatorCache::in_memory()),
    )
    .unwrap();

    let ok = client.fetch(&book.url("/echo"), None, false).await.unwrap();
    assert_eq!(ok.status, 200);
    assert_eq!(MockBook::count(&book.state.robots_hits), 0);
}

#[tokio::test]
async fn test_invalid_url_rejected() {
    let client = client(1);
    let err = client.fetch("not a url", None, false).await.unwrap_err();
    assert!(matches!(err, FetchError::InvalidUrl { .. }));
}
