use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("storage API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("storage misconfigured: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
