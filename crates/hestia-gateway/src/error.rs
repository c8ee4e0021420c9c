//! Error types for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hestia_core::HestiaError;
use serde::Serialize;
use tracing::error;

/// Application-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Hestia(#[from] HestiaError),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

/// Status for a set of per-connection failures: their shared class, or 500
/// when they disagree.
pub fn combined_status(errors: &[HestiaError]) -> StatusCode {
    let mut statuses = errors.iter().map(HestiaError::status);
    let first = statuses.next().unwrap_or(500);
    let code = if statuses.all(|s| s == first) { first } else { 500 };
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn code_of(e: &HestiaError) -> &'static str {
    match e {
        HestiaError::NotFound(_) => "NOT_FOUND",
        HestiaError::NotAllowed(_) => "NOT_ALLOWED",
        HestiaError::Malformed(_) => "MALFORMED",
        HestiaError::Auth(_) => "AUTH_FAILED",
        HestiaError::Multi { .. } => "MULTIPLE_ERRORS",
        HestiaError::Driver(_) | HestiaError::Io(_) | HestiaError::Serialization(_) => {
            "INTERNAL_ERROR"
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorBody {
            error: String,
            code: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            errors: Option<Vec<String>>,
        }

        let (status, body) = match &self {
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: msg.clone(),
                    code: "BAD_REQUEST",
                    errors: None,
                },
            ),
            ApiError::Hestia(HestiaError::Multi { message, errors }) => {
                error!("{}: {:?}", message, errors);
                (
                    combined_status(errors),
                    ErrorBody {
                        error: message.clone(),
                        code: "MULTIPLE_ERRORS",
                        errors: Some(errors.iter().map(HestiaError::class).collect()),
                    },
                )
            }
            ApiError::Hestia(e) => {
                let status =
                    StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let message = if status.is_server_error() {
                    error!("Request failed: {}", e);
                    e.class()
                } else {
                    e.to_string()
                };
                (
                    status,
                    ErrorBody {
                        error: message,
                        code: code_of(e),
                        errors: None,
                    },
                )
            }
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
