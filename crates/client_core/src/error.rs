use shared::error::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("realtime transport failure: {0}")]
    Transport(String),
    #[error("history unavailable for {self_identity}<->{peer}: {reason}")]
    HistoryFetch {
        self_identity: String,
        peer: String,
        reason: String,
    },
    #[error("failed to send message: {0}")]
    Send(String),
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("backend rejected request: {0}")]
    Api(#[from] ApiError),
    #[error("chat session is no longer running")]
    SessionClosed,
}
