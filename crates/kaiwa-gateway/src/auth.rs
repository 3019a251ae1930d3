//! Bearer-token authentication shared by every `/api/*` handler.

use axum::http::HeaderMap;
use kaiwa_core::config::AuthMode;
use kaiwa_core::error::KaiwaError;
use kaiwa_core::types::UserRole;
use kaiwa_threads::Thread;
use kaiwa_users::{User, UserError};
use tracing::info;

use crate::app::AppState;
use crate::error::{ApiError, ApiResult};

pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// The user behind the request. With `auth.mode = "none"` every request
/// runs as the default admin.
pub fn authenticate(state: &AppState, headers: &HeaderMap) -> ApiResult<User> {
    if state.config.auth.mode == AuthMode::None {
        return local_admin(state);
    }
    let token = extract_bearer(headers).ok_or_else(ApiError::unauthorized)?;
    state
        .users
        .resolve_token(token)?
        .ok_or_else(ApiError::unauthorized)
}

fn local_admin(state: &AppState) -> ApiResult<User> {
    let email = &state.config.auth.default_admin_email;
    if let Some(user) = state.users.find_by_identifier(email)? {
        return Ok(user);
    }
    // nobody can log in with this password; auth is off anyway
    let password = uuid::Uuid::new_v4().to_string();
    match state.users.create(email, &password, UserRole::Admin) {
        Ok(user) => {
            info!(identifier = %email, "created local admin");
            Ok(user)
        }
        // lost a race with a concurrent request
        Err(UserError::AlreadyExists(_)) => state
            .users
            .find_by_identifier(email)?
            .ok_or_else(|| ApiError::not_found(format!("user {email}"))),
        Err(e) => Err(e.into()),
    }
}

/// Load a thread the user owns. Threads of other users look missing.
pub fn owned_thread(state: &AppState, user: &User, thread_id: &str) -> ApiResult<Thread> {
    match state.threads.get(thread_id)? {
        Some(thread) if thread.user_id == user.id => Ok(thread),
        _ => Err(ApiError(KaiwaError::NotFound {
            what: format!("thread {thread_id}"),
        })),
    }
}
