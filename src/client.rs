//! Cache-backed HTTP client.
//!
//! The proxy intercepts traffic; `CachedClient` offers the same engine as a
//! client layer for programs that fetch directly. GETs are answered from the
//! store when fresh and recorded after going upstream, under exactly the
//! interception rules the proxy applies.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use reqwest::Method;

use crate::config::Config;
use crate::error::AppResult;
use crate::fetch::Fetcher;
use crate::headers::Headers;
use crate::proxy::{Interception, RequestInterceptor, ResponseRecorder, Strategy};
use crate::store::repository::Repository;
use crate::store::CachedResponse;

pub struct CachedClient {
    fetcher: Arc<Fetcher>,
    interceptor: RequestInterceptor,
    recorder: ResponseRecorder,
}

impl CachedClient {
    #[must_use]
    pub fn new(
        strategy: Strategy,
        repository: Arc<Repository>,
        fetcher: Arc<Fetcher>,
        config: &Config,
    ) -> Self {
        Self {
            fetcher,
            interceptor: RequestInterceptor::new(strategy, Arc::clone(&repository), config),
            recorder: ResponseRecorder::new(strategy, repository, config),
        }
    }

    /// GET `url`, serving from the store when the cached row is fresh and
    /// recording the upstream response otherwise. Requests the interception
    /// rules exclude go upstream without touching the cache.
    ///
    /// # Errors
    ///
    /// `AppError::Transport` when the request has to go upstream and fails
    /// there.
    pub async fn get(&self, url: &str, headers: &Headers) -> AppResult<CachedResponse> {
        match self.interceptor.on_request(&Method::GET, url, headers).await {
            Interception::Serve(found) => Ok(found),
            Interception::Forward(token) => {
                let request_time = token
                    .as_ref()
                    .map_or_else(Utc::now, |token| token.request_time);

                let (status, response_headers, body) = self
                    .fetcher
                    .forward(Method::GET, url, headers, Bytes::new())
                    .await?;
                let response_time = Utc::now();

                self.recorder
                    .on_response(url, status, &response_headers, &body, token.as_ref());

                Ok(CachedResponse::new(
                    status,
                    body,
                    response_headers,
                    request_time,
                    response_time,
                ))
            }
        }
    }

    /// Relay a non-GET request upstream. Kept on the client so callers need
    /// only one handle; these never participate in the cache.
    ///
    /// # Errors
    ///
    /// `AppError::Transport` on upstream failures.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &Headers,
        body: Bytes,
    ) -> AppResult<(u16, Headers, Bytes)> {
        self.fetcher.forward(method, url, headers, body).await
    }
}
