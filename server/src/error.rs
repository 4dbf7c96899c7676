use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use odds_contract::Error as ChainError;
use serde::Serialize;
use thiserror::Error;

/// Failure surfaced by a handler or service, rendered as
/// `{statusCode, message, error}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    status_code: u16,
    message: String,
    error: &'static str,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(err) if err.is_unique_violation() => StatusCode::CONFLICT,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Chain(err) => match err {
                ChainError::InvalidInput(_)
                | ChainError::InvalidLotteryId
                | ChainError::InvalidMaxTickets(_)
                | ChainError::LotteryMissing(_)
                | ChainError::LotteryInactive(_)
                | ChainError::LotteryDrawn(_) => StatusCode::BAD_REQUEST,
                ChainError::Provider(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            },
        }
    }

    /// Client-facing message; internal details stay in the logs.
    fn message(&self) -> String {
        match self {
            ApiError::Store(err) if err.is_unique_violation() => {
                "Resource already exists".to_string()
            }
            ApiError::Store(_) => "Internal server error".to_string(),
            ApiError::Chain(ChainError::LotteryMissing(id)) => {
                format!("Lottery {id} does not exist on-chain")
            }
            ApiError::Chain(err) if self.status().is_client_error() => err.to_string(),
            ApiError::Chain(_) => "Lottery contract unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request failed");
        }
        let body = ErrorBody {
            status_code: status.as_u16(),
            message: self.message(),
            error: status.canonical_reason().unwrap_or("Error"),
        };
        (status, Json(body)).into_response()
    }
}
