//! Error types for the qBittorrent Web API client.

use thiserror::Error;

/// Errors returned by [`crate::Client`].
#[derive(Error, Debug)]
pub enum Error {
    /// Login was rejected by the daemon (bad credentials or banned IP).
    #[error("authentication failed for {url}")]
    AuthFailed { url: String },

    /// Transport-level failure (connect, timeout, body read).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The configured base URL could not be parsed or joined.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The daemon answered with a non-success status code.
    #[error("qBittorrent returned {status} for {endpoint}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
