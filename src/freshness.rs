//! RFC 9111 freshness evaluation.
//!
//! `CacheControl` is a parsed view of one message's caching metadata: the
//! `Cache-Control` directive set plus the `Date`, `Expires` and `Age` headers
//! and the instants at which the upstream exchange happened. Parsing never
//! fails; malformed directives are ignored and unparsable numeric values
//! collapse to zero.
//!
//! The free functions at the bottom evaluate the same logic over raw column
//! values (header JSON text, RFC 3339 timestamps) and back the refresh
//! daemon's staleness predicate.

use chrono::{DateTime, Utc};

use crate::headers::{parse_rfc1123, Headers};

const DIRECTIVE_MAX_AGE: &str = "max-age";
const DIRECTIVE_MAX_STALE: &str = "max-stale";
const DIRECTIVE_MIN_FRESH: &str = "min-fresh";
const DIRECTIVE_NO_CACHE: &str = "no-cache";
const DIRECTIVE_NO_STORE: &str = "no-store";
const DIRECTIVE_NO_TRANSFORM: &str = "no-transform";
const DIRECTIVE_ONLY_IF_CACHED: &str = "only-if-cached";
const DIRECTIVE_MUST_REVALIDATE: &str = "must-revalidate";
const DIRECTIVE_MUST_UNDERSTAND: &str = "must-understand";
const DIRECTIVE_PRIVATE: &str = "private";
const DIRECTIVE_PROXY_REVALIDATE: &str = "proxy-revalidate";
const DIRECTIVE_PUBLIC: &str = "public";
const DIRECTIVE_S_MAXAGE: &str = "s-maxage";

/// Parsed caching metadata for one request or response.
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    max_age: Option<i64>,
    max_stale: Option<i64>,
    min_fresh: Option<i64>,
    s_maxage: Option<i64>,
    no_cache: bool,
    no_store: bool,
    no_transform: bool,
    only_if_cached: bool,
    must_revalidate: bool,
    must_understand: bool,
    private: bool,
    proxy_revalidate: bool,
    public: bool,

    shared_cache: bool,
    ttl_fallback: i64,

    date: Option<DateTime<Utc>>,
    expires: Option<DateTime<Utc>>,
    age_header: Option<i64>,

    request_time: Option<DateTime<Utc>>,
    response_time: Option<DateTime<Utc>>,
}

impl CacheControl {
    /// Parse the caching metadata out of `headers`.
    ///
    /// `request_time`/`response_time` are the instants the upstream exchange
    /// started and finished (absent when evaluating a request). `shared`
    /// selects shared-cache semantics (`private` uncacheable, `s-maxage`
    /// honored). `ttl_fallback` is the heuristic lifetime used when the
    /// message carries no explicit freshness information.
    #[must_use]
    pub fn parse(
        headers: &Headers,
        request_time: Option<DateTime<Utc>>,
        response_time: Option<DateTime<Utc>>,
        shared: bool,
        ttl_fallback: i64,
    ) -> Self {
        let mut cc = CacheControl {
            shared_cache: shared,
            ttl_fallback,
            request_time,
            response_time,
            ..CacheControl::default()
        };

        let raw = headers
            .get("Cache-Control")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .replace(' ', "");

        for directive in raw.split(',').filter(|d| !d.is_empty()) {
            match directive.split_once('=') {
                None => match directive {
                    DIRECTIVE_NO_CACHE => cc.no_cache = true,
                    DIRECTIVE_NO_STORE => cc.no_store = true,
                    DIRECTIVE_NO_TRANSFORM => cc.no_transform = true,
                    DIRECTIVE_ONLY_IF_CACHED => cc.only_if_cached = true,
                    DIRECTIVE_MUST_REVALIDATE => cc.must_revalidate = true,
                    DIRECTIVE_MUST_UNDERSTAND => cc.must_understand = true,
                    DIRECTIVE_PRIVATE => cc.private = true,
                    DIRECTIVE_PROXY_REVALIDATE => cc.proxy_revalidate = true,
                    DIRECTIVE_PUBLIC => cc.public = true,
                    _ => {}
                },
                Some((name, value)) => {
                    let value: i64 = value.parse().unwrap_or(0);
                    match name {
                        DIRECTIVE_MAX_AGE => cc.max_age = Some(value),
                        DIRECTIVE_MAX_STALE => cc.max_stale = Some(value),
                        DIRECTIVE_MIN_FRESH => cc.min_fresh = Some(value),
                        DIRECTIVE_S_MAXAGE => cc.s_maxage = Some(value),
                        _ => {}
                    }
                }
            }
        }

        cc.date = headers.get("Date").and_then(parse_rfc1123);
        cc.expires = headers.get("Expires").and_then(parse_rfc1123);
        cc.age_header = headers.get("Age").and_then(|v| v.trim().parse().ok());

        cc
    }

    /// Whether a cache may store or reuse this message at all.
    #[must_use]
    pub fn cacheable(&self) -> bool {
        if self.no_cache || self.no_store {
            return false;
        }
        if self.private {
            return !self.shared_cache;
        }
        true
    }

    /// Freshness lifetime in seconds.
    ///
    /// Precedence: `s-maxage` in shared mode, `max-age`, a positive
    /// `Expires − Date` (or `Expires − response_time` when `Date` is
    /// missing), then the configured fallback. `Expires` at or before the
    /// reference instant carries no information and falls through.
    #[must_use]
    pub fn freshness_lifetime(&self) -> i64 {
        if self.shared_cache {
            if let Some(s_maxage) = self.s_maxage {
                return s_maxage;
            }
        }
        if let Some(max_age) = self.max_age {
            return max_age;
        }
        if let Some(expires) = self.expires {
            let reference = match (self.date, self.response_time) {
                (Some(date), _) => Some(date),
                (None, Some(response_time)) => Some(response_time),
                (None, None) => None,
            };
            if let Some(reference) = reference {
                let lifetime = (expires - reference).num_seconds();
                if lifetime > 0 {
                    return lifetime;
                }
            }
        }
        self.ttl_fallback
    }

    /// Current age in whole seconds per the RFC 9111 algorithm, or `None`
    /// when the stored response carries no usable `Date` or the exchange
    /// instants are unknown.
    #[must_use]
    pub fn current_age(&self, now: DateTime<Utc>) -> Option<i64> {
        let date = self.date?;
        self.age_at(date, now)
    }

    /// True when the message may not be served from cache at `now`: missing
    /// exchange instants, an uncacheable directive set, or an age past the
    /// freshness lifetime.
    #[must_use]
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        if !self.cacheable() {
            return true;
        }
        let response_time = match (self.request_time, self.response_time) {
            (Some(_), Some(response_time)) => response_time,
            _ => return true,
        };
        // A missing Date yields no Age header, but expiry still needs an age;
        // the response's own arrival instant stands in for the origin clock.
        let age = self
            .age_at(self.date.unwrap_or(response_time), now)
            .unwrap_or(i64::MAX);
        age > self.freshness_lifetime()
    }

    fn age_at(&self, date: DateTime<Utc>, now: DateTime<Utc>) -> Option<i64> {
        let request_time = self.request_time?;
        let response_time = self.response_time?;

        let apparent_age = (response_time - date).num_seconds().max(0);
        let response_delay = (response_time - request_time).num_seconds();
        let corrected_age_value = self.age_header.unwrap_or(0) + response_delay;
        let corrected_initial_age = apparent_age.max(corrected_age_value);
        Some(corrected_initial_age + (now - response_time).num_seconds())
    }

    #[must_use]
    pub fn max_age(&self) -> Option<i64> {
        self.max_age
    }

    #[must_use]
    pub fn max_stale(&self) -> Option<i64> {
        self.max_stale
    }

    #[must_use]
    pub fn min_fresh(&self) -> Option<i64> {
        self.min_fresh
    }

    #[must_use]
    pub fn s_maxage(&self) -> Option<i64> {
        self.s_maxage
    }

    #[must_use]
    pub fn no_cache(&self) -> bool {
        self.no_cache
    }

    #[must_use]
    pub fn no_store(&self) -> bool {
        self.no_store
    }

    #[must_use]
    pub fn no_transform(&self) -> bool {
        self.no_transform
    }

    #[must_use]
    pub fn only_if_cached(&self) -> bool {
        self.only_if_cached
    }

    #[must_use]
    pub fn must_revalidate(&self) -> bool {
        self.must_revalidate
    }

    #[must_use]
    pub fn must_understand(&self) -> bool {
        self.must_understand
    }

    #[must_use]
    pub fn private(&self) -> bool {
        self.private
    }

    #[must_use]
    pub fn proxy_revalidate(&self) -> bool {
        self.proxy_revalidate
    }

    #[must_use]
    pub fn public(&self) -> bool {
        self.public
    }
}

fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|instant| instant.with_timezone(&Utc))
}

fn parse_columns(
    header_json: &str,
    request_time: &str,
    response_time: &str,
    shared: bool,
    ttl_fallback: i64,
) -> CacheControl {
    let headers = Headers::from_json(header_json).unwrap_or_default();
    CacheControl::parse(
        &headers,
        parse_instant(request_time),
        parse_instant(response_time),
        shared,
        ttl_fallback,
    )
}

/// Current age of a stored row, or `None` when it cannot be computed.
#[must_use]
pub fn cache_age(header_json: &str, request_time: &str, response_time: &str) -> Option<i64> {
    parse_columns(header_json, request_time, response_time, false, 0).current_age(Utc::now())
}

/// Freshness lifetime of a stored row with no heuristic fallback.
#[must_use]
pub fn cache_lifetime(header_json: &str, response_time: &str, shared: bool) -> i64 {
    let headers = Headers::from_json(header_json).unwrap_or_default();
    CacheControl::parse(&headers, None, parse_instant(response_time), shared, 0)
        .freshness_lifetime()
}

/// Whether a stored row is expired under pure RFC 9111 rules.
#[must_use]
pub fn cache_expired(
    header_json: &str,
    request_time: &str,
    response_time: &str,
    shared: bool,
) -> bool {
    cache_expired_ttl(header_json, request_time, response_time, shared, 0)
}

/// Whether a stored row is expired, falling back to `ttl_fallback` seconds
/// when the row carries no explicit freshness information. This is the
/// staleness predicate the refresh daemon applies per row.
#[must_use]
pub fn cache_expired_ttl(
    header_json: &str,
    request_time: &str,
    response_time: &str,
    shared: bool,
    ttl_fallback: i64,
) -> bool {
    parse_columns(header_json, request_time, response_time, shared, ttl_fallback)
        .expired(Utc::now())
}
