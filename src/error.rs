use axum::{http::StatusCode, response::{IntoResponse, Response}};
use thiserror::Error;

use crate::engine::EngineError;
use crate::launch::LaunchError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Persistence(String),
    #[error("{0}")]
    Measurement(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::AlreadyProvisioned { .. } => AppError::Conflict(error.to_string()),
            StoreError::TooLarge { .. } => AppError::BadRequest(error.to_string()),
            StoreError::Io { .. } => AppError::Persistence(error.to_string()),
            StoreError::Measurement { .. } => AppError::Measurement(error.to_string()),
        }
    }
}

impl From<LaunchError> for AppError {
    fn from(error: LaunchError) -> Self {
        match error {
            LaunchError::MissingSpec => AppError::NotFound(error.to_string()),
            LaunchError::AlreadyLaunched => AppError::Conflict(error.to_string()),
            LaunchError::Engine(engine) => AppError::Engine(engine),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Persistence(_) | AppError::Measurement(_) | AppError::Engine(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
