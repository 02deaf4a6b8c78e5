//! OAuth2 client-credentials token source.
//!
//! Tokens are fetched from the configured token endpoint and cached until
//! shortly before they expire; concurrent callers share one refresh under
//! the lock.

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::AppResult;

/// Seconds a token is considered expired ahead of its advertised lifetime.
const EXPIRY_SKEW_SECONDS: i64 = 30;

#[derive(Debug, Clone, Default)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

impl ClientCredentials {
    /// The flow is active only when both a token endpoint and a client id
    /// are present.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.token_url.is_empty() && !self.client_id.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct TokenSource {
    credentials: ClientCredentials,
    client: Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    #[must_use]
    pub fn new(credentials: ClientCredentials, client: Client) -> Self {
        Self {
            credentials,
            client,
            cached: Mutex::new(None),
        }
    }

    /// A valid bearer token, refreshed from the token endpoint when the
    /// cached one is missing or about to expire.
    ///
    /// # Errors
    ///
    /// `AppError::Transport` when the token endpoint is unreachable or
    /// answers with an error status or an unreadable body.
    pub async fn bearer(&self) -> AppResult<String> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.expires_at.is_none_or(|at| Utc::now() < at) {
                return Ok(token.access_token.clone());
            }
        }

        tracing::debug!(token_url = %self.credentials.token_url, "requesting access token");
        let response = self
            .client
            .post(&self.credentials.token_url)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?
            .error_for_status()?;

        let token: TokenResponse = response.json().await?;
        let expires_at = token
            .expires_in
            .map(|seconds| Utc::now() + Duration::seconds((seconds - EXPIRY_SKEW_SECONDS).max(0)));

        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            expires_at,
        });
        Ok(access_token)
    }
}
