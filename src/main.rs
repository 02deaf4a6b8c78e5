use axum::{
    body::Body,
    extract::{Request, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::{Database, DatabaseConnection};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use httpstash::common::AppState;
use httpstash::config::Config;
use httpstash::error::{AppError, AppResult};
use httpstash::fetch::{FetchConfig, Fetcher};
use httpstash::headers::Headers;
use httpstash::proxy::Interception;
use httpstash::store::{self, repository::Repository};

use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,httpstash=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting httpstash proxy...");

    // Load configuration (fail-fast)
    let config = Config::from_env()?;
    tracing::info!(
        databases = config.database_urls.len(),
        rfc9111 = config.rfc9111,
        shared = config.shared_cache,
        read_only = config.read_only,
        ttl_seconds = config.ttl_seconds,
        "Configuration loaded"
    );

    // Connect to the databases and resolve backing tables (fail-fast)
    let sources = open_databases(&config).await?;
    let repository = Arc::new(Repository::open(
        sources,
        config.ttl_seconds,
        Duration::from_secs(config.cleanup_interval_seconds),
    )?);
    tracing::info!("Repository initialized");

    // Upstream HTTP client
    let fetcher = Arc::new(Fetcher::new(FetchConfig::from_config(&config))?);

    let state = AppState::new(config.clone(), Arc::clone(&repository), fetcher);

    let app = axum::Router::new()
        .fallback(proxy_handler)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    // Start the proxy with graceful shutdown
    let addr = config.bind_address();
    tracing::info!(address = %addr, "Starting proxy");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    repository.close();
    tracing::info!("Proxy shut down gracefully");
    Ok(())
}

/// Connect every configured database and resolve its backing tables, either
/// from configuration (creating missing tables) or by introspection.
async fn open_databases(config: &Config) -> AppResult<Vec<(DatabaseConnection, Vec<String>)>> {
    let mut sources = Vec::new();
    for url in &config.database_urls {
        let db = Database::connect(url.as_str()).await?;

        let tables = if config.response_tables.is_empty() {
            store::discovery::response_tables(&db).await?
        } else {
            store::create_response_tables(&db, &config.response_tables).await?;
            config.response_tables.clone()
        };
        if tables.is_empty() {
            return Err(AppError::Config(format!("no response tables found in {url:?}")));
        }

        tracing::info!(database = %url, tables = ?tables, "Database connected");
        sources.push((db, tables));
    }
    Ok(sources)
}

async fn proxy_handler(State(state): State<AppState>, request: Request) -> Response {
    match handle(&state, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle(state: &AppState, request: Request) -> AppResult<Response> {
    let (parts, body) = request.into_parts();

    // Origin-form requests address the proxy itself, not an upstream.
    if parts.uri.scheme().is_none() {
        return Ok(local_endpoint(parts.uri.path()));
    }
    if parts.method == Method::CONNECT {
        return Ok((
            StatusCode::NOT_IMPLEMENTED,
            "TLS interception is not enabled",
        )
            .into_response());
    }

    let url = parts.uri.to_string();
    let headers = Headers::from_http(&parts.headers);

    match state.interceptor.on_request(&parts.method, &url, &headers).await {
        Interception::Serve(found) => Ok(stored_response(found)),
        Interception::Forward(token) => {
            let body = axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(|e| AppError::Decode(format!("request body: {e}")))?;

            let (status, response_headers, response_body) = state
                .fetcher
                .forward(parts.method.clone(), &url, &headers, body)
                .await?;

            state
                .recorder
                .on_response(&url, status, &response_headers, &response_body, token.as_ref());

            Ok(upstream_response(status, &response_headers, response_body))
        }
    }
}

fn local_endpoint(path: &str) -> Response {
    match path {
        "/healthz" => Json(serde_json::json!({ "status": "ok" })).into_response(),
        _ => (StatusCode::NOT_FOUND, "not a proxy request").into_response(),
    }
}

fn stored_response(found: store::CachedResponse) -> Response {
    upstream_response(found.status, &found.header, found.body)
}

fn upstream_response(status: u16, headers: &Headers, body: bytes::Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    *response.headers_mut() = headers.to_http();
    response
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        },
    }
}
