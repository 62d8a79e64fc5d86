use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::time::Duration;
use thiserror::Error;

/// The application's error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// The user already holds the maximum number of active VPN sessions.
    #[error("Maximum number of VPN connections reached")]
    ConnectionLimitExceeded,

    /// No address is left in the configured client subnet.
    #[error("VPN subnet is full")]
    PoolExhausted,

    /// The peer-management process rejected the request.
    #[error("Peer registration failed: {0}")]
    RegistrationFailed(String),

    /// The peer-management process did not exit in time and was killed.
    #[error("Peer registration timed out after {0:?}")]
    RegistrationTimeout(Duration),

    /// A stored private key could not be decrypted.
    #[error("Decryption failed")]
    Decryption,

    /// The user has no active VPN session.
    #[error("No active VPN session found")]
    SessionNotFound,

    /// Missing or malformed startup configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A database error.
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// A connection pool error.
    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// A pool construction error.
    #[error("Pool creation error: {0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),

    /// A Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// An I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A row was missing a column or carried an unexpected value.
    #[error("Missing data: {0}")]
    MissingData(String),

    /// An authorization error.
    #[error("Authorization failed")]
    Unauthorized,

    /// A validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An encryption error.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// An internal server error.
    #[error("Internal server error: {0}")]
    Internal(String),

    /// A rate limit exceeded error.
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::ConnectionLimitExceeded => {
                tracing::warn!("VPN connection limit reached");
                (StatusCode::CONFLICT, self.to_string())
            }

            AppError::PoolExhausted => {
                tracing::error!("VPN address pool exhausted");
                (StatusCode::SERVICE_UNAVAILABLE, "No VPN addresses available".to_string())
            }

            AppError::RegistrationFailed(ref diagnostic) => {
                tracing::error!("Peer registration failed: {}", diagnostic);
                (StatusCode::BAD_GATEWAY, "Peer registration failed".to_string())
            }

            AppError::RegistrationTimeout(elapsed) => {
                tracing::error!("Peer registration timed out after {:?}", elapsed);
                (StatusCode::GATEWAY_TIMEOUT, "Peer registration timed out".to_string())
            }

            AppError::Decryption => {
                tracing::error!("Stored private key failed to decrypt");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }

            AppError::SessionNotFound => {
                tracing::debug!("No active VPN session");
                (StatusCode::NOT_FOUND, self.to_string())
            }

            AppError::InvalidConfiguration(ref msg) => {
                tracing::error!("Invalid configuration: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }

            AppError::Database(ref e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }

            AppError::Pool(ref e) => {
                tracing::error!("Pool error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }

            AppError::CreatePool(ref e) => {
                tracing::error!("Pool creation error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }

            AppError::Redis(ref e) => {
                tracing::error!("Redis error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Cache error".to_string())
            }

            AppError::Io(ref e) => {
                tracing::error!("IO error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "File system error".to_string())
            }

            AppError::MissingData(ref column) => {
                tracing::error!("Missing column in row: {}", column);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }

            AppError::Unauthorized => {
                tracing::warn!("Authorization failed");
                (StatusCode::FORBIDDEN, "Forbidden".to_string())
            }

            AppError::Validation(ref msg) => {
                tracing::debug!("Validation error: {}", msg);
                (StatusCode::BAD_REQUEST, msg.clone())
            }

            AppError::Encryption(ref msg) => {
                tracing::error!("Encryption error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Encryption error".to_string())
            }

            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }

            AppError::RateLimitExceeded(ref msg) => {
                tracing::warn!("Rate limit exceeded: {}", msg);
                (StatusCode::TOO_MANY_REQUESTS, msg.clone())
            }
        };

        let body = sonic_rs::to_string(&sonic_rs::json!({
            "status": "error",
            "error": message
        }))
        .unwrap_or_else(|_| r#"{"status":"error","error":"Internal server error"}"#.to_string());

        (status, [(http::header::CONTENT_TYPE, "application/json")], body).into_response()
    }
}
