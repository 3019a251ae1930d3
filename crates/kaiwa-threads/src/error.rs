use thiserror::Error;

/// Errors raised by the thread store.
#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored tool-call JSON that no longer parses.
    #[error("corrupt step {step_id}: {source}")]
    CorruptStep {
        step_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid feedback value {0}, expected -1, 0 or 1")]
    InvalidFeedback(i64),
}

pub type Result<T> = std::result::Result<T, ThreadError>;
