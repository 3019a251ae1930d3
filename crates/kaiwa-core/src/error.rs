use thiserror::Error;

#[derive(Debug, Error)]
pub enum KaiwaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Session busy: {thread_id}")]
    SessionBusy { thread_id: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KaiwaError {
    /// Short error code string sent to clients in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            KaiwaError::Config(_) => "CONFIG_ERROR",
            KaiwaError::AuthFailed(_) => "AUTH_FAILED",
            KaiwaError::PermissionDenied { .. } => "PERMISSION_DENIED",
            KaiwaError::NotFound { .. } => "NOT_FOUND",
            KaiwaError::SessionBusy { .. } => "SESSION_BUSY",
            KaiwaError::Database(_) => "DATABASE_ERROR",
            KaiwaError::LlmProvider(_) => "LLM_PROVIDER_ERROR",
            KaiwaError::Storage(_) => "STORAGE_ERROR",
            KaiwaError::BadRequest(_) => "BAD_REQUEST",
            KaiwaError::Serialization(_) => "SERIALIZATION_ERROR",
            KaiwaError::Io(_) => "IO_ERROR",
            KaiwaError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            KaiwaError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, KaiwaError>;
