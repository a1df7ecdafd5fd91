//! Error types for vidgate

use std::io;

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for vidgate
pub type Result<T> = std::result::Result<T, Error>;

/// Vidgate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catalog load or invariant error
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// No valid caller identity on the request
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Caller identity present but lacks viewing or key rights.
    ///
    /// Deliberately carries no detail: the same response covers unknown
    /// video ids and known-but-forbidden ones, so callers cannot probe
    /// the catalog.
    #[error("Unauthorized")]
    Unauthorized,

    /// Unknown video id (public catalog variants only)
    #[error("Not found")]
    NotFound,

    /// Malformed PlayReady license challenge
    #[error("Bad challenge: {0}")]
    BadChallenge(String),

    /// Service credential could not be acquired
    #[error("Credential error: {0}")]
    Credential(String),

    /// A downstream call failed; the status code is passed through verbatim
    #[error("Upstream returned HTTP {status}")]
    Upstream {
        /// HTTP status code returned by the downstream service
        status: u16,
    },

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error maps to.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Authentication(_) | Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::BadChallenge(_) => StatusCode::BAD_REQUEST,
            Self::Upstream { status } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Credential(_) | Self::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        match self {
            Self::Authentication(detail) => (
                status,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                Json(json!({ "error": "invalid_token", "error_description": detail })),
            )
                .into_response(),
            // Opaque by design: no body that distinguishes "unknown id"
            // from "known but forbidden".
            Self::Unauthorized | Self::NotFound | Self::Upstream { .. } => status.into_response(),
            Self::BadChallenge(detail) => (
                status,
                Json(json!({ "error": "bad_request", "error_description": detail })),
            )
                .into_response(),
            other => {
                tracing::error!(error = %other, "Request failed");
                (status, Json(json!({ "error": "internal_error" }))).into_response()
            }
        }
    }
}
