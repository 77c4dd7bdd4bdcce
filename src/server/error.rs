//! HTTP error mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::error::SimError;

/// Errors returned by route handlers.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Sim(#[from] SimError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Sim(e) => match e {
                SimError::TraderNotFound(_) | SimError::PositionNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                SimError::InvalidInput(_) | SimError::InvalidRatio(_) => StatusCode::BAD_REQUEST,
                SimError::InsufficientBalance { .. } | SimError::PositionNotOpen(_) => {
                    StatusCode::CONFLICT
                }
                SimError::PriceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                SimError::Corrupt(_) | SimError::Persistence(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
