use async_trait::async_trait;
use thiserror::Error;

use crate::error::Error;

/// Failure of a single batch upload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    /// The endpoint answered with a non-2xx status
    #[error("HTTP {status}")]
    Http {
        status: u16,
        /// `Retry-After` in whole seconds, when present and numeric
        retry_after: Option<u64>,
    },

    /// No usable response (connect failure, timeout, reset)
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<UploadError> for Error {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::Http {
                status,
                retry_after,
            } => Error::Http {
                status,
                retry_after,
            },
            UploadError::Transport(msg) => Error::Transport(msg),
        }
    }
}

/// Sends one finished batch body to the collection endpoint.
#[async_trait]
pub trait BatchUploader: Send + Sync {
    async fn upload(&self, api_host: &str, body: Vec<u8>) -> Result<(), UploadError>;
}
