//! Error taxonomy for the relay (spec §7).
//!
//! Every variant here is externally visible through one specific HTTP
//! behavior; none of them are fatal to the process and none of them ever
//! touch a request other than the one that raised them.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid hostname")]
    InvalidHostname,

    #[error("invalid subdomain")]
    InvalidSubdomain,

    #[error("{0} is currently unregistered or offline.")]
    Unregistered(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream error: {0}")]
    Stream(String),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match &self {
            RelayError::InvalidHostname | RelayError::InvalidSubdomain => {
                (StatusCode::BAD_GATEWAY, self.to_string()).into_response()
            }
            RelayError::Unregistered(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string()).into_response()
            }
            RelayError::Transport(_) | RelayError::Stream(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string()).into_response()
            }
        }
    }
}
