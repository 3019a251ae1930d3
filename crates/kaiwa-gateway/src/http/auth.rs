//! Login endpoints.
//!
//! Password login:  `POST /auth/login {"identifier", "password"}` -> `{"token", "user"}`
//! Logout:          `POST /auth/logout` with the bearer token to revoke
//! OAuth:           `GET /auth/oauth/login` redirects to the identity provider,
//!                  which sends the browser back to `GET /auth/oauth/callback`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::Redirect,
    Json,
};
use kaiwa_core::config::OAuthConfig;
use kaiwa_core::error::KaiwaError;
use kaiwa_users::User;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app::AppState;
use crate::auth::extract_bearer;
use crate::error::{ApiError, ApiResult};

/// How long an OAuth `state` value stays redeemable.
const OAUTH_STATE_TTL: Duration = Duration::from_secs(600);

#[derive(Deserialize)]
pub struct LoginRequest {
    pub identifier: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginReply {
    pub token: String,
    pub user: User,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginReply>> {
    let user = state
        .users
        .verify_credentials(req.identifier.trim(), &req.password)?;
    let token = issue(&state, &user)?;
    info!(user = %user.id, "password login");
    Ok(Json(LoginReply { token, user }))
}

pub async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<StatusCode> {
    let token = extract_bearer(&headers).ok_or_else(ApiError::unauthorized)?;
    if !state.users.revoke_token(token)? {
        return Err(ApiError::unauthorized());
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn oauth_login(State(state): State<Arc<AppState>>) -> ApiResult<Redirect> {
    let oauth = oauth_config(&state)?;

    state
        .oauth_states
        .retain(|_, issued| issued.elapsed() < OAUTH_STATE_TTL);
    let csrf = uuid::Uuid::new_v4().simple().to_string();
    state.oauth_states.insert(csrf.clone(), Instant::now());

    Ok(Redirect::to(&authorize_url(oauth, &csrf)))
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> ApiResult<Json<LoginReply>> {
    let oauth = oauth_config(&state)?;

    if let Some(error) = query.error {
        return Err(auth_failed(format!("identity provider returned '{error}'")));
    }
    let csrf = query.state.unwrap_or_default();
    match state.oauth_states.remove(&csrf) {
        Some((_, issued)) if issued.elapsed() < OAUTH_STATE_TTL => {}
        _ => return Err(auth_failed("unknown or expired oauth state")),
    }
    let code = query
        .code
        .ok_or_else(|| ApiError::bad_request("missing authorization code"))?;

    let resp = state
        .http
        .post(&oauth.token_url)
        .header("accept", "application/json")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", oauth.redirect_url.as_str()),
            ("client_id", oauth.client_id.as_str()),
            ("client_secret", oauth.client_secret.as_str()),
        ])
        .send()
        .await
        .map_err(|e| auth_failed(format!("token exchange failed: {e}")))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        warn!(%status, body = %body, "oauth token exchange rejected");
        return Err(auth_failed(format!("token exchange rejected ({status})")));
    }
    let token: TokenResponse = resp
        .json()
        .await
        .map_err(|e| auth_failed(format!("bad token response: {e}")))?;

    let profile: Value = state
        .http
        .get(&oauth.userinfo_url)
        .bearer_auth(&token.access_token)
        .header("accept", "application/json")
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| auth_failed(format!("userinfo request failed: {e}")))?
        .json()
        .await
        .map_err(|e| auth_failed(format!("bad userinfo response: {e}")))?;

    let identity = Identity::from_userinfo(&profile)
        .ok_or_else(|| auth_failed("userinfo has no email or username"))?;
    let metadata = json!({
        "provider": oauth.provider,
        "image": identity.image,
    });
    let user = state.users.find_or_create_oauth(
        &identity.identifier,
        identity.display_name.as_deref(),
        metadata,
    )?;
    let token = issue(&state, &user)?;
    info!(user = %user.id, provider = %oauth.provider, "oauth login");
    Ok(Json(LoginReply { token, user }))
}

fn issue(state: &AppState, user: &User) -> ApiResult<String> {
    let ttl = chrono::Duration::hours(state.config.auth.token_ttl_hours);
    Ok(state.users.issue_token(&user.id, ttl)?)
}

fn oauth_config(state: &AppState) -> ApiResult<&OAuthConfig> {
    state
        .config
        .auth
        .oauth
        .as_ref()
        .ok_or_else(|| ApiError::not_found("oauth is not configured"))
}

fn auth_failed(message: impl Into<String>) -> ApiError {
    ApiError(KaiwaError::AuthFailed(message.into()))
}

fn authorize_url(oauth: &OAuthConfig, csrf: &str) -> String {
    let sep = if oauth.authorize_url.contains('?') { '&' } else { '?' };
    format!(
        "{}{sep}response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
        oauth.authorize_url,
        urlencoding::encode(&oauth.client_id),
        urlencoding::encode(&oauth.redirect_url),
        urlencoding::encode(&oauth.scopes.join(" ")),
        csrf,
    )
}

/// The parts of a userinfo document we keep.
#[derive(Debug, PartialEq)]
struct Identity {
    identifier: String,
    display_name: Option<String>,
    image: Option<String>,
}

impl Identity {
    /// OIDC providers send `email`; Azure AD may only send
    /// `preferred_username`/`upn`; GitHub sends `login`.
    fn from_userinfo(profile: &Value) -> Option<Self> {
        let field = |key: &str| {
            profile
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let identifier = field("email")
            .or_else(|| field("preferred_username"))
            .or_else(|| field("upn"))
            .or_else(|| field("login"))?;
        Some(Self {
            identifier,
            display_name: field("name"),
            image: field("picture").or_else(|| field("avatar_url")),
        })
    }
}
