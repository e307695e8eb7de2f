//! Unified error handling for the server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use innsync_engine::Error as EngineError;
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// The engine error inside, if any.
    pub fn engine(&self) -> Option<&EngineError> {
        match self {
            AppError::Engine(e) => Some(e),
            _ => None,
        }
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

fn engine_status(error: &EngineError) -> StatusCode {
    match error {
        EngineError::MappingGap(_) | EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
        EngineError::SignatureInvalid(_) => StatusCode::UNAUTHORIZED,
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        EngineError::ConnectionPaused(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Credential { .. }
        | EngineError::ChannelApi { .. }
        | EngineError::Network(_)
        | EngineError::RateLimitExceeded { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                    None,
                )
            }
            AppError::Engine(e) => {
                let status = engine_status(e);
                if status.is_server_error() {
                    tracing::warn!("Engine error: {:?}", e);
                }
                // Mapping gaps list every missing pair so the operator can fix them at once.
                let details = match e {
                    EngineError::MappingGap(missing) => Some(serde_json::json!({
                        "missing": missing
                            .pairs()
                            .iter()
                            .map(|p| serde_json::json!({"roomType": p.room_type, "ratePlan": p.rate_plan}))
                            .collect::<Vec<_>>()
                    })),
                    _ => None,
                };
                (status, e.to_string(), details)
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string(), None),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    Some(serde_json::Value::String(msg.clone())),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
