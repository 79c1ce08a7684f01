use std::path::PathBuf;

use reqwest::StatusCode;

use crate::backend::source::SourceKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} responded with {status}")]
    Status { status: StatusCode, url: String },

    #[error("{url} is still rate limited after retrying")]
    RateLimited { url: String },

    #[error("malformed response payload: {0}")]
    Payload(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("page file not found: {}", .0.display())]
    PageNotFound(PathBuf),

    #[error("source {0} is not registered")]
    SourceUnavailable(SourceKind),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("invalid configuration value for {key}: {value}")]
    Config { key: String, value: String },

    #[error("could not parse {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub fn payload(msg: impl Into<String>) -> Self {
        Self::Payload(msg.into())
    }
}
