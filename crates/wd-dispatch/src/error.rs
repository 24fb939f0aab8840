use thiserror::Error;

/// Failures talking to the queue, instance or confirmation endpoints
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Unexpected response body: {0}")]
    UnexpectedBody(String),
}

impl UpstreamError {
    pub fn is_not_found(&self) -> bool {
        match self {
            UpstreamError::Status { status, .. } => *status == 404,
            UpstreamError::Http(e) => e.status().map(|s| s.as_u16() == 404).unwrap_or(false),
            UpstreamError::Decode(_) | UpstreamError::UnexpectedBody(_) => false,
        }
    }
}

/// Failures reading or writing the sent-message ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}
