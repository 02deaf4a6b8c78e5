//! HTTP header model shared by the store, the fetcher and the proxy hooks.
//!
//! Cached rows persist their headers as a JSON object mapping each name to an
//! ordered list of values, so the in-memory representation is a plain
//! multimap rather than a typed header map. Lookups are case-insensitive;
//! names keep the form they arrived with so the JSON column round-trips
//! byte-for-byte.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Connection-scoped headers that must not travel through the proxy.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Case-insensitive header multimap with per-name value order preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(HashMap<String, Vec<String>>);

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, matched case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).and_then(|values| values.first()).map(String::as_str)
    }

    /// All values for `name` in insertion order, matched case-insensitively.
    #[must_use]
    pub fn get_all(&self, name: &str) -> Option<&Vec<String>> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values)
    }

    /// Replace every case-variant of `name` with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.retain(|key, _| !key.eq_ignore_ascii_case(&name));
        self.0.insert(name, vec![value.into()]);
    }

    /// Add a value, keeping any existing ones for the same name.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        match self.0.iter_mut().find(|(key, _)| key.eq_ignore_ascii_case(name)) {
            Some((_, values)) => values.push(value.into()),
            None => {
                self.0.insert(name.to_string(), vec![value.into()]);
            }
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|key, _| !key.eq_ignore_ascii_case(name));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    /// Drop headers that only make sense on a single connection.
    pub fn strip_hop_by_hop(&mut self) {
        self.0
            .retain(|key, _| !HOP_BY_HOP_HEADERS.iter().any(|h| key.eq_ignore_ascii_case(h)));
    }

    /// Serialize for the `header` column. The trailing newline matches the
    /// line-delimited encoder convention of the persisted format.
    #[must_use]
    pub fn to_json(&self) -> String {
        let mut text = serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string());
        text.push('\n');
        text
    }

    /// Parse the `header` column, tolerating a missing trailing newline.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Decode` when the text is not a JSON object of
    /// string lists.
    pub fn from_json(text: &str) -> AppResult<Self> {
        serde_json::from_str(text.trim_end())
            .map(Headers)
            .map_err(|e| AppError::Decode(format!("header column: {e}")))
    }

    /// Copy out of an `http` header map, grouping repeated names.
    #[must_use]
    pub fn from_http(map: &axum::http::HeaderMap) -> Self {
        let mut headers = Headers::new();
        for (name, value) in map {
            if let Ok(value) = value.to_str() {
                headers.append(name.as_str(), value);
            }
        }
        headers
    }

    /// Convert back into an `http` header map, skipping invalid entries.
    #[must_use]
    pub fn to_http(&self) -> axum::http::HeaderMap {
        use axum::http::header::{HeaderName, HeaderValue};

        let mut map = axum::http::HeaderMap::new();
        for (name, values) in &self.0 {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    map.append(name.clone(), value);
                }
            }
        }
        map
    }
}

impl FromIterator<(String, Vec<String>)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, Vec<String>)>>(iter: T) -> Self {
        Headers(iter.into_iter().collect())
    }
}

/// Format an instant the way the `Date`/`Expires` headers expect it.
#[must_use]
pub fn fmt_rfc1123(instant: DateTime<Utc>) -> String {
    instant.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an RFC 1123 header date. `None` on any parse failure.
#[must_use]
pub fn parse_rfc1123(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(text)
        .ok()
        .map(|instant| instant.with_timezone(&Utc))
}
