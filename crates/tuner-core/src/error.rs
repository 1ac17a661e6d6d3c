use thiserror::Error;

/// Failures on the registry / now-playing transports.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {0}")]
    Status(u16),
    #[error("undecodable message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid url '{0}'")]
    InvalidUrl(String),
    #[error("stream ended")]
    Ended,
}

/// Failures reported by the audio output.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlaybackError {
    #[error("audio backend unavailable: {0}")]
    Unavailable(String),
    #[error("audio device error: {0}")]
    Device(String),
    #[error("source rejected: {0}")]
    Rejected(String),
}
