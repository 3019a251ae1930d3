use kaiwa_core::types::UserRole;
use serde::{Deserialize, Serialize};

/// How a user authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthProvider {
    #[default]
    Credentials,
    Oauth,
}

impl AuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthProvider::Credentials => "credentials",
            AuthProvider::Oauth => "oauth",
        }
    }
}

impl std::fmt::Display for AuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuthProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "credentials" => Ok(AuthProvider::Credentials),
            "oauth" => Ok(AuthProvider::Oauth),
            other => Err(format!("unknown auth provider: {}", other)),
        }
    }
}

/// A user record. The password hash never leaves the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// UUIDv7.
    pub id: String,
    /// Login identifier, unique. An email for both password and OAuth users.
    pub identifier: String,
    pub display_name: String,
    pub role: UserRole,
    pub provider: AuthProvider,
    /// Free-form profile data, e.g. the OAuth provider name and image.
    pub metadata: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
    pub last_login_at: Option<String>,
}
