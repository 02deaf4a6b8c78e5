use std::env;

/// Status codes persisted when no explicit set is configured (RFC 9111 §3,
/// heuristically-cacheable status codes).
pub const DEFAULT_CACHEABLE_STATUS: &[u16] =
    &[200, 203, 204, 206, 300, 301, 308, 404, 405, 410, 414, 501];

/// Default name for the refresh daemon's fetch-and-store sink. Must never
/// collide with a backing table name.
pub const DEFAULT_SINK_TABLE: &str = "http_request";

#[derive(Debug, Clone)]
pub struct Config {
    // Databases
    pub database_urls: Vec<String>,
    /// Backing tables to use. Empty means discover them by introspection.
    pub response_tables: Vec<String>,

    // Cache policy
    pub rfc9111: bool,
    pub shared_cache: bool,
    pub read_only: bool,
    pub ttl_seconds: i64,
    pub cleanup_interval_seconds: u64,
    pub cacheable_status: Vec<u16>,

    // Proxy front-end
    pub proxy_host: String,
    pub proxy_port: u16,

    // Upstream fetches
    pub upstream_timeout_ms: u64,
    pub insecure_skip_verify: bool,
    pub upstream_headers: Vec<(String, String)>,
    pub oauth2_client_id: String,
    pub oauth2_client_secret: String,
    pub oauth2_token_url: String,
    pub tls_cert_file: String,
    pub tls_cert_key_file: String,
    pub tls_ca_file: String,

    // Refresh daemon
    pub refresh_interval_seconds: u64,
    pub refresh_match_url: String,
    pub refresh_sink_table: String,
    pub refresh_ignore_status_error: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` when no database URL is set and
    /// `ConfigError::Invalid` when a value fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let database_urls = csv_list(
            &env::var("DATABASE_URLS")
                .or_else(|_| env::var("DATABASE_URL"))
                .map_err(|_| ConfigError::Missing("DATABASE_URLS"))?,
        );
        if database_urls.is_empty() {
            return Err(ConfigError::Missing("DATABASE_URLS"));
        }

        Ok(Self {
            database_urls,
            response_tables: env::var("RESPONSE_TABLES")
                .map(|v| csv_list(&v))
                .unwrap_or_default(),

            rfc9111: env::var("CACHE_RFC9111")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            shared_cache: env::var("CACHE_SHARED")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            read_only: env::var("CACHE_READ_ONLY")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            ttl_seconds: env::var("CACHE_TTL_SECONDS")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .unwrap_or(0),
            cleanup_interval_seconds: env::var("CACHE_CLEANUP_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .unwrap_or(0),
            cacheable_status: match env::var("CACHEABLE_STATUS") {
                Ok(v) => parse_status_codes(&v)?,
                Err(_) => DEFAULT_CACHEABLE_STATUS.to_vec(),
            },

            proxy_host: env::var("PROXY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            proxy_port: env::var("PROXY_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),

            upstream_timeout_ms: env::var("UPSTREAM_TIMEOUT_MS")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .unwrap_or(0),
            insecure_skip_verify: env::var("UPSTREAM_INSECURE")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            upstream_headers: match env::var("UPSTREAM_HEADERS") {
                Ok(v) => parse_header_pairs(&v)?,
                Err(_) => Vec::new(),
            },
            oauth2_client_id: env::var("OAUTH2_CLIENT_ID").unwrap_or_default(),
            oauth2_client_secret: env::var("OAUTH2_CLIENT_SECRET").unwrap_or_default(),
            oauth2_token_url: env::var("OAUTH2_TOKEN_URL").unwrap_or_default(),
            tls_cert_file: env::var("TLS_CERT_FILE").unwrap_or_default(),
            tls_cert_key_file: env::var("TLS_CERT_KEY_FILE").unwrap_or_default(),
            tls_ca_file: env::var("TLS_CA_FILE").unwrap_or_default(),

            refresh_interval_seconds: env::var("REFRESH_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            refresh_match_url: env::var("REFRESH_MATCH_URL").unwrap_or_else(|_| "%".to_string()),
            refresh_sink_table: env::var("REFRESH_SINK_TABLE")
                .unwrap_or_else(|_| DEFAULT_SINK_TABLE.to_string()),
            refresh_ignore_status_error: env::var("REFRESH_IGNORE_STATUS_ERROR")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
        })
    }

    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.proxy_host, self.proxy_port)
    }
}

fn csv_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_status_codes(value: &str) -> Result<Vec<u16>, ConfigError> {
    let codes = csv_list(value)
        .iter()
        .map(|code| {
            code.parse::<u16>()
                .map_err(|_| ConfigError::Invalid("CACHEABLE_STATUS", code.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if codes.is_empty() {
        Ok(DEFAULT_CACHEABLE_STATUS.to_vec())
    } else {
        Ok(codes)
    }
}

fn parse_header_pairs(value: &str) -> Result<Vec<(String, String)>, ConfigError> {
    csv_list(value)
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(name, v)| (name.trim().to_string(), v.trim().to_string()))
                .filter(|(name, _)| !name.is_empty())
                .ok_or_else(|| ConfigError::Invalid("UPSTREAM_HEADERS", pair.clone()))
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}
