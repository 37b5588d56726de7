use thiserror::Error;

/// Failures of a single fetch attempt after the retry policy is exhausted.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication expired and re-login failed")]
    AuthExpired,

    #[error("content did not appear within {0} seconds")]
    ContentTimeout(u64),

    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),

    #[error("response body exceeds {limit} bytes (got {got})")]
    TooLarge { limit: u64, got: u64 },

    #[error("browser error: {0}")]
    Browser(String),
}

impl FetchError {
    /// Transient failures are retried by the session; everything else
    /// surfaces to the caller immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::ContentTimeout(_) => true,
            FetchError::HttpStatus(code) => *code >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("job lock is held by another process")]
    Contested,

    #[error("lock file I/O error: {0}")]
    Io(#[from] std::io::Error),
}
