use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::ApiResponse;
use crate::modules::whatsapp::ClientError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Session {0} already exists")]
    SessionExists(String),

    #[error("Maximum number of sessions ({0}) reached")]
    SessionLimit(usize),

    #[error("Session not found")]
    SessionNotFound,

    #[error("Session not ready")]
    SessionNotReady,

    #[error("Failed to initialize session: {0}")]
    ClientInit(ClientError),

    #[error("{0}")]
    Client(#[from] ClientError),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{reason}")]
    RateLimited { reason: String, delay_ms: Option<u64> },

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("File type {0} not allowed")]
    UnsupportedMediaType(String),

    #[error("Route {0} not found")]
    RouteNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::SessionExists(_) => StatusCode::CONFLICT,
            AppError::SessionLimit(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::SessionNotFound | AppError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            AppError::SessionNotReady => StatusCode::CONFLICT,
            AppError::Client(_) => StatusCode::BAD_GATEWAY,
            AppError::Validation(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::ClientInit(_) | AppError::Io(_) | AppError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Error {}: {}", status.as_u16(), self);
        } else {
            tracing::debug!("Error {}: {}", status.as_u16(), self);
        }

        let data = match &self {
            AppError::RateLimited { delay_ms: Some(ms), .. } => Some(json!({ "delayMs": ms })),
            _ => None,
        };

        let body = ApiResponse {
            success: false,
            data,
            error: Some(self.to_string()),
            message: None,
        };
        (status, Json(body)).into_response()
    }
}

// Implement alias for Result to simplify usage
pub type AppResult<T> = Result<T, AppError>;
