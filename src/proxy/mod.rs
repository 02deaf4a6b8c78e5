//! Interception hooks.
//!
//! The front-end (whatever terminates the client connection) calls
//! `RequestInterceptor::on_request` for every intercepted request and
//! `ResponseRecorder::on_response` for every response flowing back. The
//! continuation token is the only state carried between the two: it tells
//! the recorder when the upstream exchange started and where to persist the
//! result.

pub mod request;
pub mod response;

use chrono::{DateTime, Utc};

pub use request::{Interception, RequestInterceptor};
pub use response::ResponseRecorder;

use crate::store::FREE_CHOICE;

/// Cache evaluation strategy, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Entries stay valid for a fixed number of seconds after storage.
    Ttl,
    /// Freshness follows the RFC 9111 directive set.
    Rfc9111,
}

/// Routing metadata handed from the request interceptor to the response
/// recorder within one proxied exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken {
    /// Instant the proxy decided to go upstream.
    pub request_time: DateTime<Utc>,
    /// Database to persist into; `FREE_CHOICE` lets the repository rotate.
    pub database_id: i32,
    /// Table holding the stale row to replace, empty for first-time stores.
    pub table_name: String,
}

impl ContinuationToken {
    /// Token for a miss: record wherever the repository chooses.
    #[must_use]
    pub fn free_choice(request_time: DateTime<Utc>) -> Self {
        Self {
            request_time,
            database_id: FREE_CHOICE,
            table_name: String::new(),
        }
    }

    /// Token for a stale hit: overwrite in the database that produced it.
    #[must_use]
    pub fn overwrite(request_time: DateTime<Utc>, database_id: i32, table_name: String) -> Self {
        Self {
            request_time,
            database_id,
            table_name,
        }
    }
}
