use push_channel::PushError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("malformed response body: {0}")]
    Decode(String),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("connection lost: {0}")]
    Transport(String),
    #[error("failed to establish realtime connection: {0}")]
    Identity(String),
    #[error("failed to establish realtime connection: {0}")]
    Channel(#[from] PushError),
    #[error("identity cache error: {0}")]
    Cache(String),
    #[error("config error: {0}")]
    Config(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// True when the request never produced an HTTP response.
    pub fn is_transport(&self) -> bool {
        match self {
            SyncError::Http(err) => !err.is_status() && !err.is_decode(),
            SyncError::Transport(_) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(value: std::io::Error) -> Self {
        SyncError::Cache(value.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        SyncError::Decode(value.to_string())
    }
}
