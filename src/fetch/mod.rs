//! Upstream HTTP client.
//!
//! One `Fetcher` serves both traffic directions of the system: `fetch` is
//! the cache-fill GET used by the refresh daemon, `forward` relays an
//! intercepted client request through the proxy. The underlying client is
//! built once from configuration: TLS verification toggle, optional mTLS
//! identity, optional extra root CA, optional overall timeout. A static
//! header map is applied to every outbound request, and an OAuth2
//! client-credentials token can be layered on top.

pub mod oauth;

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use reqwest::{Certificate, Client, Identity, Method};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::fetch::oauth::{ClientCredentials, TokenSource};
use crate::headers::{fmt_rfc1123, Headers};
use crate::store::CachedResponse;

#[derive(Debug, Clone, Default)]
pub struct FetchConfig {
    pub timeout: Option<Duration>,
    pub insecure_skip_verify: bool,
    pub headers: Vec<(String, String)>,
    pub cert_file: Option<String>,
    pub cert_key_file: Option<String>,
    pub ca_file: Option<String>,
    pub credentials: Option<ClientCredentials>,
}

impl FetchConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let some_path = |path: &String| (!path.is_empty()).then(|| path.clone());
        Self {
            timeout: (config.upstream_timeout_ms > 0)
                .then(|| Duration::from_millis(config.upstream_timeout_ms)),
            insecure_skip_verify: config.insecure_skip_verify,
            headers: config.upstream_headers.clone(),
            cert_file: some_path(&config.tls_cert_file),
            cert_key_file: some_path(&config.tls_cert_key_file),
            ca_file: some_path(&config.tls_ca_file),
            credentials: Some(ClientCredentials {
                client_id: config.oauth2_client_id.clone(),
                client_secret: config.oauth2_client_secret.clone(),
                token_url: config.oauth2_token_url.clone(),
            }),
        }
    }
}

#[derive(Debug)]
pub struct Fetcher {
    client: Client,
    inject: Vec<(String, String)>,
    token_source: Option<TokenSource>,
}

impl Fetcher {
    /// Build the client once from `config`.
    ///
    /// # Errors
    ///
    /// `AppError::Config` when a certificate file cannot be read or parsed,
    /// `AppError::Transport` when the client cannot be constructed.
    pub fn new(config: FetchConfig) -> AppResult<Self> {
        let mut builder = Client::builder()
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .use_rustls_tls();

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        if let (Some(cert_file), Some(key_file)) = (&config.cert_file, &config.cert_key_file) {
            let mut pem = read_pem(cert_file)?;
            pem.extend_from_slice(&read_pem(key_file)?);
            let identity = Identity::from_pem(&pem)
                .map_err(|e| AppError::Config(format!("client certificate: {e}")))?;
            builder = builder.identity(identity);
        }

        if let Some(ca_file) = &config.ca_file {
            let ca = Certificate::from_pem(&read_pem(ca_file)?)
                .map_err(|e| AppError::Config(format!("CA certificate: {e}")))?;
            builder = builder.add_root_certificate(ca);
        }

        let client = builder.build()?;

        let token_source = config
            .credentials
            .filter(ClientCredentials::is_configured)
            .map(|credentials| TokenSource::new(credentials, client.clone()));

        Ok(Self {
            client,
            inject: config.headers,
            token_source,
        })
    }

    /// GET `url` and buffer the whole body, recording the exchange instants
    /// around the call. A missing `Date` header is backfilled with the
    /// response instant so age math stays possible.
    ///
    /// # Errors
    ///
    /// `AppError::Transport` on DNS/TLS/connection/read failures.
    pub async fn fetch(&self, url: &str) -> AppResult<CachedResponse> {
        let request_time = Utc::now();

        let mut request = self.client.get(url);
        for (name, value) in &self.inject {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(token_source) = &self.token_source {
            request = request.bearer_auth(token_source.bearer().await?);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let mut header = Headers::from_http(response.headers());
        let body = response.bytes().await?;
        let response_time = Utc::now();

        if header.get("Date").is_none() {
            header.set("Date", fmt_rfc1123(response_time));
        }

        Ok(CachedResponse::new(status, body, header, request_time, response_time))
    }

    /// Relay an intercepted request upstream, stripping hop-by-hop headers
    /// on both legs. The response body is fully buffered.
    ///
    /// # Errors
    ///
    /// `AppError::Transport` on upstream failures.
    pub async fn forward(
        &self,
        method: Method,
        url: &str,
        headers: &Headers,
        body: Bytes,
    ) -> AppResult<(u16, Headers, Bytes)> {
        let mut outbound = headers.clone();
        outbound.strip_hop_by_hop();
        // The client library derives these from the target URL and the body.
        outbound.remove("Host");
        outbound.remove("Content-Length");

        let mut request = self.client.request(method, url);
        for (name, values) in outbound.iter() {
            for value in values {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        for (name, value) in &self.inject {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(token_source) = &self.token_source {
            request = request.bearer_auth(token_source.bearer().await?);
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let mut header = Headers::from_http(response.headers());
        header.strip_hop_by_hop();
        let body = response.bytes().await?;

        Ok((status, header, body))
    }
}

fn read_pem(path: &str) -> AppResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| AppError::Config(format!("reading {path:?}: {e}")))
}
