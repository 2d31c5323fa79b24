//! Crate-wide error type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response from the aggregator, with the human-readable
    /// message extracted from the JSON body when one is present.
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("json decode failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The server closed a live stream without a transport-level error.
    /// The synchronizer treats this the same as an error: reconnect.
    #[error("event stream closed by server")]
    StreamClosed,
}

impl Error {
    /// Status code for API errors, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}
