use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

use crate::packet::{BackendCode, Command};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Pin not found: {0}")]
    NotFoundPin(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
    #[error("Malformed frame: expected 16 bytes, got {len}")]
    Frame { len: usize },
    #[error("Connect error: {0}")]
    Connect(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Backend refused {command}: {code}")]
    Backend { command: Command, code: BackendCode },
    #[error("Shutdown timeout: {0}")]
    ShutdownTimeout(String),
}

impl AppError {
    /// Map a daemon refusal to the closest service-level error.
    pub fn from_backend(command: Command, code: BackendCode) -> Self {
        match code {
            BackendCode::BAD_USER_GPIO | BackendCode::BAD_GPIO => {
                AppError::NotFoundPin(format!("{code} on {command}"))
            }
            BackendCode::BAD_LEVEL | BackendCode::BAD_MODE | BackendCode::BAD_PUD => {
                AppError::InvalidValue(format!("{code} on {command}"))
            }
            BackendCode::NOT_PERMITTED => {
                AppError::PermissionDenied(format!("{code} on {command}"))
            }
            _ => AppError::Backend { command, code },
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFoundPin(_) => StatusCode::NOT_FOUND,
            AppError::InvalidState(_) | AppError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            AppError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            AppError::Connect(_) | AppError::Transport(_) | AppError::Backend { .. } => {
                StatusCode::BAD_GATEWAY
            }
            AppError::Config(_)
            | AppError::Gpio(_)
            | AppError::Frame { .. }
            | AppError::ShutdownTimeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
