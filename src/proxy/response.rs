//! Response-side recording.
//!
//! Runs on every response leaving the proxy. When the request interceptor
//! left a continuation token and the strategy allows storage, the response
//! is persisted on a detached task so the client never waits on the write;
//! storage failures are logged and dropped.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;

use crate::config::Config;
use crate::freshness::CacheControl;
use crate::headers::Headers;
use crate::proxy::{ContinuationToken, Strategy};
use crate::store::repository::Repository;
use crate::store::CachedResponse;

pub struct ResponseRecorder {
    strategy: Strategy,
    repository: Arc<Repository>,
    shared_cache: bool,
    ttl_fallback: i64,
}

impl ResponseRecorder {
    #[must_use]
    pub fn new(strategy: Strategy, repository: Arc<Repository>, config: &Config) -> Self {
        Self {
            strategy,
            repository,
            shared_cache: config.shared_cache,
            ttl_fallback: config.ttl_seconds,
        }
    }

    /// Evaluate store eligibility and hand the entry off for asynchronous
    /// persistence. The caller's response is returned to the client
    /// unmodified either way.
    pub fn on_response(
        &self,
        url: &str,
        status: u16,
        header: &Headers,
        body: &Bytes,
        token: Option<&ContinuationToken>,
    ) {
        let Some(token) = token else {
            return;
        };
        let response_time = Utc::now();

        if self.strategy == Strategy::Rfc9111 {
            let cc = CacheControl::parse(
                header,
                Some(token.request_time),
                Some(response_time),
                self.shared_cache,
                self.ttl_fallback,
            );
            if !cc.cacheable() {
                return;
            }
        }

        let entry = CachedResponse {
            status,
            body: body.clone(),
            header: header.clone(),
            request_time: token.request_time,
            response_time,
            database_id: token.database_id,
            table_name: token.table_name.clone(),
        };

        tracing::debug!(url, status, "recording response");
        let repository = Arc::clone(&self.repository);
        let url = url.to_string();
        // Detached from the request context so a client disconnect cannot
        // cancel the persist mid-write.
        tokio::spawn(async move {
            if let Err(e) = repository.write(&url, &entry).await {
                tracing::error!(error = %e, url = %url, status = entry.status, "recording response failed");
            }
        });
    }
}
