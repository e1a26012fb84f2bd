use crate::protocol::PayloadError;
use crate::validation::ValidationError;
use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tilerace_db::DbError;

const INTERNAL_ERROR_MESSAGE: &str = "An internal error occurred. Please try again later.";

/// API error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
  pub error: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub details: Option<String>,
}

impl ErrorResponse {
  pub fn new(error: impl Into<String>) -> Self {
    Self {
      error: error.into(),
      details: None,
    }
  }

  pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
    Self {
      error: error.into(),
      details: Some(details.into()),
    }
  }
}

/// Error type of the HTTP routes
#[derive(Debug)]
pub enum AppError {
  DatabaseError(DbError),
  ValidationError(String),
  Unauthorized,
}

impl IntoResponse for AppError {
  fn into_response(self) -> Response {
    match self {
      AppError::DatabaseError(db_err) => {
        let (status, message) = match &db_err {
          DbError::PlayerNotFound => (StatusCode::NOT_FOUND, "Player not found"),
          DbError::TrackNotFound => (StatusCode::NOT_FOUND, "Track not found"),
          DbError::TicketNotFound => (StatusCode::NOT_FOUND, "Ticket not found"),
          DbError::Sqlite(_) | DbError::Connection(_) | DbError::Encoding(_) => {
            // Don't expose internal database errors
            tracing::error!(?db_err, "Internal database error");
            (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE)
          }
        };

        (status, Json(ErrorResponse::new(message))).into_response()
      }
      AppError::ValidationError(msg) => {
        tracing::warn!(validation_error = %msg, "Validation failed");
        let error_response = ErrorResponse::with_details("Invalid request", msg);
        (StatusCode::BAD_REQUEST, Json(error_response)).into_response()
      }
      AppError::Unauthorized => (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new("Missing or invalid ticket")),
      )
        .into_response(),
    }
  }
}

impl From<DbError> for AppError {
  fn from(err: DbError) -> Self {
    AppError::DatabaseError(err)
  }
}

impl From<ValidationError> for AppError {
  fn from(err: ValidationError) -> Self {
    AppError::ValidationError(err.to_string())
  }
}

/// What a WebSocket event handler can fail with.
#[derive(Debug, Error)]
pub enum SessionError {
  #[error("{0}")]
  Validation(String),

  #[error("Track not found")]
  TrackNotFound,

  #[error(transparent)]
  Database(DbError),
}

impl SessionError {
  /// Text for an `_Error` reply. Store failures are logged here and replaced
  /// with a generic message.
  pub fn client_message(&self) -> String {
    match self {
      SessionError::Database(err) if !err.is_not_found() => {
        tracing::error!(?err, "Internal database error while handling event");
        INTERNAL_ERROR_MESSAGE.to_string()
      }
      other => other.to_string(),
    }
  }
}

impl From<DbError> for SessionError {
  fn from(err: DbError) -> Self {
    match err {
      DbError::TrackNotFound => SessionError::TrackNotFound,
      other => SessionError::Database(other),
    }
  }
}

impl From<ValidationError> for SessionError {
  fn from(err: ValidationError) -> Self {
    SessionError::Validation(err.to_string())
  }
}

impl From<PayloadError> for SessionError {
  fn from(err: PayloadError) -> Self {
    SessionError::Validation(err.to_string())
  }
}
