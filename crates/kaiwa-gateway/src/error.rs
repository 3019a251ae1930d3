//! HTTP error mapping. Every handler error ends up as
//! `{"error": message, "code": CODE}` with a matching status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kaiwa_agent::assistants::AssistantsError;
use kaiwa_agent::provider::ProviderError;
use kaiwa_core::error::KaiwaError;
use kaiwa_storage::StorageError;
use kaiwa_threads::ThreadError;
use kaiwa_users::UserError;
use serde::Serialize;
use tracing::warn;

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

/// Newtype so the shared error can be turned into a response here.
#[derive(Debug)]
pub struct ApiError(pub KaiwaError);

pub type ApiResult<T> = Result<T, ApiError>;

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self(KaiwaError::AuthFailed(
            "set 'Authorization: Bearer <token>' header".to_string(),
        ))
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self(KaiwaError::NotFound { what: what.into() })
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(KaiwaError::BadRequest(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            KaiwaError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            KaiwaError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            KaiwaError::NotFound { .. } => StatusCode::NOT_FOUND,
            KaiwaError::SessionBusy { .. } => StatusCode::CONFLICT,
            KaiwaError::BadRequest(_) | KaiwaError::Serialization(_) => StatusCode::BAD_REQUEST,
            KaiwaError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            KaiwaError::LlmProvider(_) | KaiwaError::Storage(_) => StatusCode::BAD_GATEWAY,
            KaiwaError::Config(_)
            | KaiwaError::Database(_)
            | KaiwaError::Io(_)
            | KaiwaError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(code = self.0.code(), error = %self.0, "request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<KaiwaError> for ApiError {
    fn from(e: KaiwaError) -> Self {
        Self(e)
    }
}

impl From<ThreadError> for ApiError {
    fn from(e: ThreadError) -> Self {
        match e {
            ThreadError::NotFound { what, id } => Self::not_found(format!("{what} {id}")),
            ThreadError::InvalidFeedback(v) => {
                Self::bad_request(format!("feedback value must be -1, 0 or 1, got {v}"))
            }
            other => Self(KaiwaError::Database(other.to_string())),
        }
    }
}

impl From<UserError> for ApiError {
    fn from(e: UserError) -> Self {
        match e {
            UserError::InvalidCredentials => {
                Self(KaiwaError::AuthFailed("invalid identifier or password".to_string()))
            }
            UserError::NotFound(id) => Self::not_found(format!("user {id}")),
            UserError::AlreadyExists(id) => Self::bad_request(format!("user {id} already exists")),
            UserError::NotOauthAccount(id) => Self(KaiwaError::PermissionDenied {
                reason: format!("account {id} signs in with a password"),
            }),
            other => Self(KaiwaError::Database(other.to_string())),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidKey(key) => Self::bad_request(format!("invalid file name: {key}")),
            other => Self(KaiwaError::Storage(other.to_string())),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        Self(KaiwaError::LlmProvider(e.to_string()))
    }
}

impl From<AssistantsError> for ApiError {
    fn from(e: AssistantsError) -> Self {
        Self(KaiwaError::LlmProvider(e.to_string()))
    }
}
