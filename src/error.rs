//! Error taxonomy for the sandbox service.
//!
//! Only precondition failures (missing session, ownership mismatch, empty
//! command) and workspace I/O failures surface as [`Error`]. A command that
//! fails, times out, or is rejected by the sanitizer is normal output and is
//! reported inside the execution result's stderr, never through this type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("session not found")]
    SessionNotFound,

    #[error("session does not belong to the requesting user")]
    NotOwner,

    #[error("missing or empty x-user-id header")]
    Unauthenticated,

    #[error("command must not be empty")]
    EmptyCommand,

    #[error("workspace I/O error: {0}")]
    Workspace(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::SessionNotFound => StatusCode::NOT_FOUND,
            Error::NotOwner => StatusCode::FORBIDDEN,
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::EmptyCommand => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Workspace(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
