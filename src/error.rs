use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("response not found")]
    NotFound,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sea_orm::DbErr),

    #[error("decode error: {0}")]
    Decode(String),
}

impl AppError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl From<crate::config::ConfigError> for AppError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            Self::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            Self::Config(msg) => {
                tracing::error!("Configuration error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "configuration error".to_string(),
                )
            }
            Self::Transport(e) => {
                tracing::error!("Upstream transport error: {e}");
                (StatusCode::BAD_GATEWAY, format!("upstream error: {e}"))
            }
            Self::Storage(e) => {
                tracing::error!("Storage error: {e:?}");
                (StatusCode::INTERNAL_SERVER_ERROR, "storage error".to_string())
            }
            Self::Decode(msg) => {
                tracing::error!("Decode error: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, "decode error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
