//! End-to-end tests for the interception flow: classify, forward, record,
//! then serve from the store.
//!
//! Run with: cargo test --test proxy_flow_test

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use reqwest::Method;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};

use httpstash::config::{Config, DEFAULT_CACHEABLE_STATUS};
use httpstash::fetch::{FetchConfig, Fetcher};
use httpstash::headers::Headers;
use httpstash::proxy::{Interception, RequestInterceptor, ResponseRecorder, Strategy};
use httpstash::store::repository::Repository;
use httpstash::store::{self, CachedResponse};

fn test_config(ttl_seconds: i64, rfc9111: bool, shared_cache: bool) -> Config {
    Config {
        database_urls: Vec::new(),
        response_tables: Vec::new(),
        rfc9111,
        shared_cache,
        read_only: false,
        ttl_seconds,
        cleanup_interval_seconds: 0,
        cacheable_status: DEFAULT_CACHEABLE_STATUS.to_vec(),
        proxy_host: "127.0.0.1".to_string(),
        proxy_port: 0,
        upstream_timeout_ms: 0,
        insecure_skip_verify: false,
        upstream_headers: Vec::new(),
        oauth2_client_id: String::new(),
        oauth2_client_secret: String::new(),
        oauth2_token_url: String::new(),
        tls_cert_file: String::new(),
        tls_cert_key_file: String::new(),
        tls_ca_file: String::new(),
        refresh_interval_seconds: 0,
        refresh_match_url: "%".to_string(),
        refresh_sink_table: "http_request".to_string(),
        refresh_ignore_status_error: false,
    }
}

struct Harness {
    db: DatabaseConnection,
    repository: Arc<Repository>,
    interceptor: RequestInterceptor,
    recorder: ResponseRecorder,
    fetcher: Fetcher,
}

impl Harness {
    async fn new(config: &Config) -> Self {
        let mut options = ConnectOptions::new("sqlite::memory:");
        options.max_connections(1);
        let db = Database::connect(options).await.expect("in-memory database");
        store::create_response_tables(&db, &["http_response".to_string()]).await.unwrap();

        let repository = Arc::new(
            Repository::open(
                vec![(db.clone(), vec!["http_response".to_string()])],
                config.ttl_seconds,
                Duration::ZERO,
            )
            .unwrap(),
        );
        let strategy = if config.rfc9111 { Strategy::Rfc9111 } else { Strategy::Ttl };

        Self {
            db,
            repository: Arc::clone(&repository),
            interceptor: RequestInterceptor::new(strategy, Arc::clone(&repository), config),
            recorder: ResponseRecorder::new(strategy, repository, config),
            fetcher: Fetcher::new(FetchConfig::default()).unwrap(),
        }
    }

    /// One full pass through the proxy hooks. Returns the response the
    /// client would see and whether it came from the store.
    async fn roundtrip(&self, url: &str, request_headers: &Headers) -> (u16, Headers, Bytes, bool) {
        match self.interceptor.on_request(&Method::GET, url, request_headers).await {
            Interception::Serve(found) => (found.status, found.header, found.body, true),
            Interception::Forward(token) => {
                let (status, headers, body) = self
                    .fetcher
                    .forward(Method::GET, url, request_headers, Bytes::new())
                    .await
                    .unwrap();
                self.recorder.on_response(url, status, &headers, &body, token.as_ref());
                (status, headers, body, false)
            }
        }
    }

    /// Wait for the fire-and-forget recorder write to land.
    async fn wait_for_store(&self, url: &str) -> CachedResponse {
        for _ in 0..100 {
            if let Ok(found) = self.repository.find_by_url(url).await {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("response for {url} was never persisted");
    }
}

#[tokio::test]
async fn miss_then_hit_serves_stored_body_with_age() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/x")
        .with_status(200)
        .with_header("Cache-Control", "max-age=60")
        .with_header("Date", &httpstash::headers::fmt_rfc1123(Utc::now()))
        .with_body("A")
        .expect(1)
        .create_async()
        .await;
    let url = format!("{}/x", server.url());

    let config = test_config(0, false, false);
    let harness = Harness::new(&config).await;

    // First request goes upstream and gets recorded.
    let (status, _, body, from_cache) = harness.roundtrip(&url, &Headers::new()).await;
    assert_eq!(status, 200);
    assert_eq!(body, Bytes::from_static(b"A"));
    assert!(!from_cache);

    let stored = harness.wait_for_store(&url).await;
    assert_eq!(stored.status, 200);
    assert_eq!(stored.body, Bytes::from_static(b"A"));
    assert_eq!(stored.header.get("cache-control"), Some("max-age=60"));
    assert!(stored.request_time <= stored.response_time);

    // Second request is answered from the store without contacting upstream.
    let (status, headers, body, from_cache) = harness.roundtrip(&url, &Headers::new()).await;
    assert_eq!(status, 200);
    assert_eq!(body, Bytes::from_static(b"A"));
    assert!(from_cache);
    assert!(headers.get("Date").is_some());
    let age: i64 = headers.get("Age").expect("Age header").parse().unwrap();
    let elapsed = (Utc::now() - stored.response_time).num_seconds();
    assert!(age >= 0 && age <= elapsed + 1, "age {age} vs elapsed {elapsed}");

    mock.assert_async().await;
    harness.repository.close();
}

#[tokio::test]
async fn stale_ttl_hit_forwards_with_overwrite_token() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/x")
        .with_status(200)
        .with_body("B")
        .expect(1)
        .create_async()
        .await;
    let url = format!("{}/x", server.url());

    let config = test_config(1, false, false);
    let harness = Harness::new(&config).await;

    // Seed a row that exceeded the TTL ten seconds ago.
    let mut old = CachedResponse::new(
        200,
        Bytes::from_static(b"A"),
        Headers::new(),
        Utc::now() - chrono::Duration::seconds(10),
        Utc::now() - chrono::Duration::seconds(10),
    );
    old.header.set("Date", httpstash::headers::fmt_rfc1123(old.response_time));
    store::upsert(&harness.db, "http_response", &url, &old).await.unwrap();

    // The interceptor must route the overwrite back to the stale row.
    match harness.interceptor.on_request(&Method::GET, &url, &Headers::new()).await {
        Interception::Forward(Some(token)) => {
            assert_eq!(token.database_id, 0);
            assert_eq!(token.table_name, "http_response");
        }
        other => panic!("expected a forward with token, got {other:?}"),
    }

    let (_, _, body, from_cache) = harness.roundtrip(&url, &Headers::new()).await;
    assert_eq!(body, Bytes::from_static(b"B"));
    assert!(!from_cache);

    for _ in 0..100 {
        let stored = harness.repository.find_by_url(&url).await.unwrap();
        if stored.response_time > old.response_time {
            assert_eq!(stored.body, Bytes::from_static(b"B"));
            mock.assert_async().await;
            harness.repository.close();
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("stale row was never replaced");
}

#[tokio::test]
async fn fresh_ttl_hit_never_goes_upstream_when_ttl_disabled() {
    let config = test_config(0, false, false);
    let harness = Harness::new(&config).await;
    let url = "http://origin.invalid/x";

    let now = Utc::now();
    let mut stored = CachedResponse::new(203, Bytes::from_static(b"payload"), Headers::new(), now, now);
    stored.header.set("Date", httpstash::headers::fmt_rfc1123(now));
    stored.header.set("X-Origin", "seed");
    store::upsert(&harness.db, "http_response", url, &stored).await.unwrap();

    // No upstream exists for this URL; a hit is the only way to answer.
    let (status, headers, body, from_cache) = harness.roundtrip(url, &Headers::new()).await;
    assert_eq!(status, 203);
    assert!(from_cache);
    assert_eq!(body, Bytes::from_static(b"payload"));
    assert_eq!(headers.get("X-Origin"), Some("seed"));

    harness.repository.close();
}

#[tokio::test]
async fn uncacheable_stored_status_bypasses_cache() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/x")
        .with_status(200)
        .with_body("fresh")
        .expect(1)
        .create_async()
        .await;
    let url = format!("{}/x", server.url());

    let config = test_config(0, false, false);
    let harness = Harness::new(&config).await;

    let now = Utc::now();
    let error_row = CachedResponse::new(500, Bytes::from_static(b"boom"), Headers::new(), now, now);
    store::upsert(&harness.db, "http_response", &url, &error_row).await.unwrap();

    match harness.interceptor.on_request(&Method::GET, &url, &Headers::new()).await {
        // Bypass: no synthesized response and no token either.
        Interception::Forward(None) => {}
        other => panic!("expected a bare forward, got {other:?}"),
    }

    let (_, _, body, from_cache) = harness.roundtrip(&url, &Headers::new()).await;
    assert_eq!(body, Bytes::from_static(b"fresh"));
    assert!(!from_cache);

    mock.assert_async().await;
    harness.repository.close();
}

#[tokio::test]
async fn non_get_requests_do_not_participate() {
    let config = test_config(0, false, false);
    let harness = Harness::new(&config).await;

    match harness
        .interceptor
        .on_request(&Method::POST, "http://example.com/x", &Headers::new())
        .await
    {
        Interception::Forward(None) => {}
        other => panic!("expected a bare forward, got {other:?}"),
    }

    harness.repository.close();
}

#[tokio::test]
async fn rfc9111_no_store_response_is_never_persisted() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/x")
        .with_status(200)
        .with_header("Cache-Control", "no-store")
        .with_body("A")
        .expect(2)
        .create_async()
        .await;
    let url = format!("{}/x", server.url());

    let config = test_config(0, true, false);
    let harness = Harness::new(&config).await;

    let (_, _, _, from_cache) = harness.roundtrip(&url, &Headers::new()).await;
    assert!(!from_cache);
    // Leave room for a (wrong) async write to land before checking.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.repository.find_by_url(&url).await.is_err());

    // Second identical request goes upstream again.
    let (_, _, _, from_cache) = harness.roundtrip(&url, &Headers::new()).await;
    assert!(!from_cache);

    mock.assert_async().await;
    harness.repository.close();
}

#[tokio::test]
async fn rfc9111_shared_cache_skips_authorized_requests() {
    let config = test_config(0, true, true);
    let harness = Harness::new(&config).await;
    let url = "http://example.com/x";

    // Even with a perfectly fresh stored row...
    let now = Utc::now();
    let mut stored = CachedResponse::new(200, Bytes::from_static(b"A"), Headers::new(), now, now);
    stored.header.set("Date", httpstash::headers::fmt_rfc1123(now));
    stored.header.set("Cache-Control", "max-age=3600");
    store::upsert(&harness.db, "http_response", url, &stored).await.unwrap();

    let mut request_headers = Headers::new();
    request_headers.set("Authorization", "Bearer secret");

    match harness.interceptor.on_request(&Method::GET, url, &request_headers).await {
        Interception::Forward(None) => {}
        other => panic!("expected a bare forward, got {other:?}"),
    }

    harness.repository.close();
}

#[tokio::test]
async fn rfc9111_uncacheable_request_forwards_without_token() {
    let config = test_config(0, true, false);
    let harness = Harness::new(&config).await;

    let mut request_headers = Headers::new();
    request_headers.set("Cache-Control", "no-store");

    match harness
        .interceptor
        .on_request(&Method::GET, "http://example.com/x", &request_headers)
        .await
    {
        Interception::Forward(None) => {}
        other => panic!("expected a bare forward, got {other:?}"),
    }

    harness.repository.close();
}

#[tokio::test]
async fn rfc9111_fresh_hit_is_served_and_stale_hit_routed_back() {
    let config = test_config(0, true, false);
    let harness = Harness::new(&config).await;
    let url = "http://example.com/x";

    let now = Utc::now();
    let mut stored = CachedResponse::new(200, Bytes::from_static(b"A"), Headers::new(), now, now);
    stored.header.set("Date", httpstash::headers::fmt_rfc1123(now));
    stored.header.set("Cache-Control", "max-age=3600");
    store::upsert(&harness.db, "http_response", url, &stored).await.unwrap();

    let (status, headers, body, from_cache) = harness.roundtrip(url, &Headers::new()).await;
    assert_eq!(status, 200);
    assert!(from_cache);
    assert_eq!(body, Bytes::from_static(b"A"));
    assert!(headers.get("Age").is_some());

    // Shrink the lifetime below the row's age: the next request must forward
    // with a token pointing back at the stale row.
    let old = Utc::now() - chrono::Duration::seconds(120);
    let mut stale = CachedResponse::new(200, Bytes::from_static(b"A"), Headers::new(), old, old);
    stale.header.set("Date", httpstash::headers::fmt_rfc1123(old));
    stale.header.set("Cache-Control", "max-age=60");
    store::upsert(&harness.db, "http_response", url, &stale).await.unwrap();

    match harness.interceptor.on_request(&Method::GET, url, &Headers::new()).await {
        Interception::Forward(Some(token)) => {
            assert_eq!(token.database_id, 0);
            assert_eq!(token.table_name, "http_response");
        }
        other => panic!("expected a forward with token, got {other:?}"),
    }

    harness.repository.close();
}

#[tokio::test]
async fn read_only_mode_serves_hits_but_never_records() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/x")
        .with_status(200)
        .with_body("A")
        .expect(1)
        .create_async()
        .await;
    let url = format!("{}/x", server.url());

    let mut config = test_config(0, false, false);
    config.read_only = true;
    let harness = Harness::new(&config).await;

    match harness.interceptor.on_request(&Method::GET, &url, &Headers::new()).await {
        Interception::Forward(None) => {}
        other => panic!("expected a token-free forward, got {other:?}"),
    }

    let (_, _, _, from_cache) = harness.roundtrip(&url, &Headers::new()).await;
    assert!(!from_cache);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.repository.find_by_url(&url).await.is_err());

    mock.assert_async().await;
    harness.repository.close();
}

#[tokio::test]
async fn synthesized_response_preserves_stored_bytes_and_headers() {
    let config = test_config(0, false, false);
    let harness = Harness::new(&config).await;
    let url = "http://example.com/x";

    let now = Utc::now();
    let mut stored = CachedResponse::new(
        200,
        Bytes::from_static(b"\x00\x01binary\xff"),
        Headers::new(),
        now,
        now,
    );
    stored.header.set("Date", httpstash::headers::fmt_rfc1123(now));
    stored.header.set("Content-Type", "application/octet-stream");
    stored.header.append("X-Multi", "1");
    stored.header.append("X-Multi", "2");
    store::upsert(&harness.db, "http_response", url, &stored).await.unwrap();

    let (_, headers, body, from_cache) = harness.roundtrip(url, &Headers::new()).await;
    assert!(from_cache);
    assert_eq!(body, stored.body);
    assert_eq!(headers.get("Content-Type"), Some("application/octet-stream"));
    assert_eq!(
        headers.get_all("X-Multi").unwrap(),
        &vec!["1".to_string(), "2".to_string()]
    );
    // Only Date (already present) and Age may differ from the stored row.
    assert!(headers.get("Age").is_some());
    assert_eq!(headers.get("Date"), stored.header.get("Date"));

    harness.repository.close();
}
