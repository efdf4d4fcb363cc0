//! Errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use index_cache::CoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = match &self {
            Self::Core(CoreError::NotFound) => StatusCode::NOT_FOUND,
            Self::Core(CoreError::UpstreamUnavailable(_)) => StatusCode::BAD_GATEWAY,
            Self::Core(CoreError::UpstreamProtocol(_)) => StatusCode::BAD_GATEWAY,
            Self::Core(CoreError::StorageFailure(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Core(CoreError::CapacityExceeded) => StatusCode::INSUFFICIENT_STORAGE,
            Self::Core(CoreError::Cancelled) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Http(_) => StatusCode::BAD_GATEWAY,
        };

        (code, format!("{self}")).into_response()
    }
}
