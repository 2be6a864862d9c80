//! Error types for the collector client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("collector rejected the request ({status}): {detail}")]
    Api { status: u16, detail: String },

    #[error("unexpected response from the collector: {0}")]
    UnexpectedResponse(String),
}

pub type Result<T> = std::result::Result<T, CollectorError>;
