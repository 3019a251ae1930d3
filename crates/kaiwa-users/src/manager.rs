use std::sync::Mutex;

use chrono::{Duration, Utc};
use kaiwa_core::types::UserRole;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::{row_to_user, USER_COLUMNS};
use crate::error::{Result, UserError};
use crate::password::{hash_password, verify_password};
use crate::types::{AuthProvider, User};

/// Users, their password hashes and their login tokens.
pub struct UserManager {
    db: Mutex<Connection>,
}

/// Login tokens are random; only their digest is stored.
fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl UserManager {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    pub fn get(&self, user_id: &str) -> Result<Option<User>> {
        let db = self.db.lock().unwrap();
        let user = db
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![user_id],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn find_by_identifier(&self, identifier: &str) -> Result<Option<User>> {
        let db = self.db.lock().unwrap();
        let user = db
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE identifier = ?1"),
                params![identifier],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Create a password user. Fails if the identifier is taken.
    #[instrument(skip(self, password))]
    pub fn create(&self, identifier: &str, password: &str, role: UserRole) -> Result<User> {
        if self.find_by_identifier(identifier)?.is_some() {
            return Err(UserError::AlreadyExists(identifier.to_string()));
        }
        let hash = hash_password(password)?;
        self.insert(identifier, Some(&hash), role, AuthProvider::Credentials, serde_json::json!({}))
    }

    /// Create the user, or reset the password and role of an existing one.
    /// Used to seed the default admin.
    #[instrument(skip(self, password))]
    pub fn upsert_password_user(&self, identifier: &str, password: &str, role: UserRole) -> Result<User> {
        let Some(existing) = self.find_by_identifier(identifier)? else {
            info!(identifier, "creating user");
            return self.create(identifier, password, role);
        };

        let hash = hash_password(password)?;
        let now = Utc::now().to_rfc3339();
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "UPDATE users SET password_hash = ?1, role = ?2, provider = 'credentials', updated_at = ?3
                 WHERE id = ?4",
                params![hash, role.to_string(), now, existing.id],
            )?;
        }
        info!(identifier, "user password updated");
        self.get(&existing.id)?
            .ok_or_else(|| UserError::NotFound(existing.id.clone()))
    }

    /// Check an identifier/password pair. Unknown users and wrong passwords
    /// produce the same error.
    #[instrument(skip(self, password))]
    pub fn verify_credentials(&self, identifier: &str, password: &str) -> Result<User> {
        let row = {
            let db = self.db.lock().unwrap();
            db.query_row(
                &format!("SELECT {USER_COLUMNS}, password_hash FROM users WHERE identifier = ?1"),
                params![identifier],
                |row| Ok((row_to_user(row)?, row.get::<_, Option<String>>(9)?)),
            )
            .optional()?
        };

        match row {
            Some((user, Some(hash))) if verify_password(password, &hash) => {
                self.touch_login(&user.id)?;
                Ok(user)
            }
            _ => {
                warn!(identifier, "login rejected");
                Err(UserError::InvalidCredentials)
            }
        }
    }

    /// Look up an OAuth user by identifier, creating it on first login.
    /// The profile metadata is refreshed on every login.
    ///
    /// Only accounts created through OAuth match. A password account with
    /// the same identifier is refused, so an identity provider can never sign
    /// someone in as it. New accounts always get the `User` role.
    #[instrument(skip(self, metadata))]
    pub fn find_or_create_oauth(
        &self,
        identifier: &str,
        display_name: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<User> {
        let user = match self.find_by_identifier(identifier)? {
            Some(user) if user.provider != AuthProvider::Oauth => {
                warn!(identifier, "oauth login refused for password account");
                return Err(UserError::NotOauthAccount(identifier.to_string()));
            }
            Some(user) => {
                let now = Utc::now().to_rfc3339();
                let db = self.db.lock().unwrap();
                db.execute(
                    "UPDATE users SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
                    params![metadata.to_string(), now, user.id],
                )?;
                user
            }
            None => {
                info!(identifier, "creating oauth user");
                let user = self.insert(identifier, None, UserRole::User, AuthProvider::Oauth, metadata)?;
                if let Some(name) = display_name {
                    let db = self.db.lock().unwrap();
                    db.execute(
                        "UPDATE users SET display_name = ?1 WHERE id = ?2",
                        params![name, user.id],
                    )?;
                }
                user
            }
        };
        self.touch_login(&user.id)?;
        self.get(&user.id)?.ok_or_else(|| UserError::NotFound(user.id.clone()))
    }

    /// Issue a bearer token valid for `ttl`. The plain token is returned once.
    pub fn issue_token(&self, user_id: &str, ttl: Duration) -> Result<String> {
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let now = Utc::now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO auth_tokens (token_hash, user_id, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                token_digest(&token),
                user_id,
                (now + ttl).to_rfc3339(),
                now.to_rfc3339()
            ],
        )?;
        debug!(user_id, "login token issued");
        Ok(token)
    }

    /// The user a token belongs to, or `None` for unknown or expired tokens.
    pub fn resolve_token(&self, token: &str) -> Result<Option<User>> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let user = db
            .query_row(
                "SELECT u.id, u.identifier, u.display_name, u.role, u.provider, u.metadata,
                        u.created_at, u.updated_at, u.last_login_at
                 FROM users u JOIN auth_tokens t ON t.user_id = u.id
                 WHERE t.token_hash = ?1 AND t.expires_at > ?2",
                params![token_digest(token), now],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn revoke_token(&self, token: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM auth_tokens WHERE token_hash = ?1",
            params![token_digest(token)],
        )?;
        Ok(n > 0)
    }

    /// Drop expired tokens. Returns how many were removed.
    pub fn purge_expired_tokens(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        Ok(db.execute("DELETE FROM auth_tokens WHERE expires_at <= ?1", params![now])?)
    }

    fn insert(
        &self,
        identifier: &str,
        password_hash: Option<&str>,
        role: UserRole,
        provider: AuthProvider,
        metadata: serde_json::Value,
    ) -> Result<User> {
        let now = Utc::now().to_rfc3339();
        let user = User {
            id: Uuid::now_v7().to_string(),
            identifier: identifier.to_string(),
            display_name: identifier.split('@').next().unwrap_or(identifier).to_string(),
            role,
            provider,
            metadata,
            created_at: now.clone(),
            updated_at: now,
            last_login_at: None,
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO users (id, identifier, display_name, role, provider, password_hash, metadata,
                                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                user.id,
                user.identifier,
                user.display_name,
                user.role.to_string(),
                user.provider.as_str(),
                password_hash,
                user.metadata.to_string(),
                user.created_at
            ],
        )?;
        Ok(user)
    }

    fn touch_login(&self, user_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
            params![now, user_id],
        )?;
        Ok(())
    }
}
