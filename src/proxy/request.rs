//! Request-side interception.
//!
//! Classifies each intercepted GET as bypass, hit, miss or stale. Hits are
//! answered from the store with `Date` backfilled and `Age` added when it
//! can be computed; misses and stale hits forward upstream with a
//! continuation token so the recorder knows where to persist the result.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Method;

use crate::config::Config;
use crate::error::AppError;
use crate::freshness::CacheControl;
use crate::headers::{fmt_rfc1123, Headers};
use crate::proxy::{ContinuationToken, Strategy};
use crate::store::repository::Repository;
use crate::store::CachedResponse;

/// Outcome of intercepting one request.
#[derive(Debug)]
pub enum Interception {
    /// Go upstream. A token means the recorder should persist the response;
    /// `None` means the exchange does not participate in the cache.
    Forward(Option<ContinuationToken>),
    /// Answer from the store without contacting upstream.
    Serve(CachedResponse),
}

pub struct RequestInterceptor {
    strategy: Strategy,
    repository: Arc<Repository>,
    cacheable_status: Vec<u16>,
    ttl_seconds: i64,
    shared_cache: bool,
    read_only: bool,
}

impl RequestInterceptor {
    #[must_use]
    pub fn new(strategy: Strategy, repository: Arc<Repository>, config: &Config) -> Self {
        Self {
            strategy,
            repository,
            cacheable_status: config.cacheable_status.clone(),
            ttl_seconds: config.ttl_seconds,
            shared_cache: config.shared_cache,
            read_only: config.read_only,
        }
    }

    /// Classify one intercepted request. Only GET participates; everything
    /// else forwards untouched.
    pub async fn on_request(&self, method: &Method, url: &str, headers: &Headers) -> Interception {
        if method != Method::GET {
            return Interception::Forward(None);
        }
        match self.strategy {
            Strategy::Ttl => self.classify_ttl(url).await,
            Strategy::Rfc9111 => self.classify_rfc9111(url, headers).await,
        }
    }

    async fn classify_ttl(&self, url: &str) -> Interception {
        let now = Utc::now();
        let Some(found) = self.lookup(url).await else {
            return Interception::Forward(self.token(ContinuationToken::free_choice(now)));
        };

        if !self.cacheable_status.contains(&found.status) {
            return Interception::Forward(None);
        }

        let age_seconds = (now - found.response_time).num_seconds();
        if !self.read_only && self.ttl_seconds > 0 && age_seconds > self.ttl_seconds {
            return Interception::Forward(self.token(ContinuationToken::overwrite(
                now,
                found.database_id,
                found.table_name.clone(),
            )));
        }

        Interception::Serve(self.synthesize(found, now))
    }

    async fn classify_rfc9111(&self, url: &str, headers: &Headers) -> Interception {
        let request_cc = CacheControl::parse(headers, None, None, self.shared_cache, self.ttl_seconds);
        if !request_cc.cacheable() {
            return Interception::Forward(None);
        }
        // A shared cache must not reuse stored responses for credentialed
        // requests (RFC 9111 §3.5).
        if self.shared_cache && headers.get("Authorization").is_some() {
            return Interception::Forward(None);
        }

        let now = Utc::now();
        let Some(found) = self.lookup(url).await else {
            return Interception::Forward(self.token(ContinuationToken::free_choice(now)));
        };

        if !self.cacheable_status.contains(&found.status) {
            return Interception::Forward(None);
        }

        let response_cc = CacheControl::parse(
            &found.header,
            Some(found.request_time),
            Some(found.response_time),
            self.shared_cache,
            self.ttl_seconds,
        );
        if response_cc.expired(now) {
            return Interception::Forward(self.token(ContinuationToken::overwrite(
                now,
                found.database_id,
                found.table_name.clone(),
            )));
        }

        Interception::Serve(self.synthesize(found, now))
    }

    async fn lookup(&self, url: &str) -> Option<CachedResponse> {
        match self.repository.find_by_url(url).await {
            Ok(found) => Some(found),
            Err(AppError::NotFound) => None,
            Err(e) => {
                tracing::error!(error = %e, url, "cache lookup failed");
                None
            }
        }
    }

    fn token(&self, token: ContinuationToken) -> Option<ContinuationToken> {
        (!self.read_only).then_some(token)
    }

    fn synthesize(&self, mut found: CachedResponse, now: DateTime<Utc>) -> CachedResponse {
        tracing::debug!(
            status = found.status,
            table = %found.table_name,
            database_id = found.database_id,
            "serving from cache"
        );

        // Age comes from the stored header's own Date; rows stored without
        // one get a Date backfill but no Age.
        let age = CacheControl::parse(
            &found.header,
            Some(found.request_time),
            Some(found.response_time),
            self.shared_cache,
            self.ttl_seconds,
        )
        .current_age(now);

        if found.header.get("Date").is_none() {
            found.header.set("Date", fmt_rfc1123(now));
        }
        if let Some(age) = age {
            found.header.set("Age", age.to_string());
        }
        found
    }
}
