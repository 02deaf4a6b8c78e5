//! Unit tests for the upstream fetcher.
//!
//! Run with: cargo test --test fetch_test

use bytes::Bytes;
use mockito::Matcher;
use reqwest::Method;

use httpstash::fetch::oauth::ClientCredentials;
use httpstash::fetch::{FetchConfig, Fetcher};
use httpstash::headers::Headers;

#[tokio::test]
async fn fetch_records_instants_and_keeps_date() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/data")
        .with_status(200)
        .with_header("Content-Type", "text/plain")
        .with_body("payload")
        .create_async()
        .await;

    let fetcher = Fetcher::new(FetchConfig::default()).unwrap();
    let entry = fetcher.fetch(&format!("{}/data", server.url())).await.unwrap();

    assert_eq!(entry.status, 200);
    assert_eq!(entry.body, Bytes::from_static(b"payload"));
    assert_eq!(entry.header.get("content-type"), Some("text/plain"));
    assert!(entry.request_time <= entry.response_time);
    // Either the origin's Date survived or the fetcher backfilled one.
    let date = entry.header.get("Date").expect("Date header");
    assert!(httpstash::headers::parse_rfc1123(date).is_some());

    mock.assert_async().await;
}

#[tokio::test]
async fn fetch_injects_static_headers() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/data")
        .match_header("x-api-key", "sekret")
        .with_status(200)
        .with_body("ok")
        .create_async()
        .await;

    let fetcher = Fetcher::new(FetchConfig {
        headers: vec![("X-Api-Key".to_string(), "sekret".to_string())],
        ..FetchConfig::default()
    })
    .unwrap();
    let entry = fetcher.fetch(&format!("{}/data", server.url())).await.unwrap();

    assert_eq!(entry.status, 200);
    mock.assert_async().await;
}

#[tokio::test]
async fn fetch_transport_error_is_reported() {
    let fetcher = Fetcher::new(FetchConfig::default()).unwrap();
    let err = fetcher.fetch("http://127.0.0.1:1/unreachable").await.unwrap_err();
    assert!(matches!(err, httpstash::error::AppError::Transport(_)));
}

#[tokio::test]
async fn forward_strips_hop_by_hop_headers() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/relay")
        .match_header("x-keep", "yes")
        .match_header("proxy-authorization", Matcher::Missing)
        .with_status(200)
        .with_body("relayed")
        .create_async()
        .await;

    let fetcher = Fetcher::new(FetchConfig::default()).unwrap();
    let mut headers = Headers::new();
    headers.set("X-Keep", "yes");
    headers.set("Proxy-Authorization", "Basic abc");

    let (status, _, body) = fetcher
        .forward(Method::GET, &format!("{}/relay", server.url()), &headers, Bytes::new())
        .await
        .unwrap();

    assert_eq!(status, 200);
    assert_eq!(body, Bytes::from_static(b"relayed"));
    mock.assert_async().await;
}

#[tokio::test]
async fn oauth_token_is_fetched_once_and_reused() {
    let mut server = mockito::Server::new_async().await;
    let token_mock = server
        .mock("POST", "/token")
        .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
        .match_body(Matcher::UrlEncoded(
            "grant_type".to_string(),
            "client_credentials".to_string(),
        ))
        .with_status(200)
        .with_header("Content-Type", "application/json")
        .with_body(r#"{"access_token":"tok-1","token_type":"Bearer","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;
    let data_mock = server
        .mock("GET", "/data")
        .match_header("authorization", "Bearer tok-1")
        .with_status(200)
        .with_body("ok")
        .expect(2)
        .create_async()
        .await;

    let fetcher = Fetcher::new(FetchConfig {
        credentials: Some(ClientCredentials {
            client_id: "cid".to_string(),
            client_secret: "cs".to_string(),
            token_url: format!("{}/token", server.url()),
        }),
        ..FetchConfig::default()
    })
    .unwrap();

    let url = format!("{}/data", server.url());
    assert_eq!(fetcher.fetch(&url).await.unwrap().status, 200);
    assert_eq!(fetcher.fetch(&url).await.unwrap().status, 200);

    token_mock.assert_async().await;
    data_mock.assert_async().await;
}
