use thiserror::Error;

/// All user-layer errors. Kept separate from `KaiwaError` so the gateway can
/// map them to HTTP status codes without coupling layers.
#[derive(Debug, Error)]
pub enum UserError {
    #[error("User not found: {0}")]
    NotFound(String),

    #[error("User already exists: {0}")]
    AlreadyExists(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    /// Unknown identifier or wrong password. Deliberately the same error for both.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// An OAuth identity named an account that signs in with a password.
    #[error("account {0} is not linked to single sign-on")]
    NotOauthAccount(String),

    #[error("password hashing failed: {0}")]
    Hashing(String),
}

pub type Result<T> = std::result::Result<T, UserError>;
