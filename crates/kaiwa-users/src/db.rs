use std::str::FromStr;

use kaiwa_core::types::UserRole;
use rusqlite::{Connection, Result};

use crate::types::{AuthProvider, User};

/// Column order shared by every user SELECT in this crate.
pub(crate) const USER_COLUMNS: &str = "id, identifier, display_name, role, provider, metadata,
     created_at, updated_at, last_login_at";

/// Map a SELECT row (column order from `USER_COLUMNS`) to a User.
pub(crate) fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let role = UserRole::from_str(&row.get::<_, String>(3)?).unwrap_or_default();
    let provider = AuthProvider::from_str(&row.get::<_, String>(4)?).unwrap_or_default();
    let metadata = serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default();
    Ok(User {
        id: row.get(0)?,
        identifier: row.get(1)?,
        display_name: row.get(2)?,
        role,
        provider,
        metadata,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        last_login_at: row.get(8)?,
    })
}

/// Initialise the user and login-token tables. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id             TEXT PRIMARY KEY NOT NULL,
            identifier     TEXT NOT NULL UNIQUE,
            display_name   TEXT NOT NULL,
            role           TEXT NOT NULL DEFAULT 'user',
            provider       TEXT NOT NULL DEFAULT 'credentials',
            password_hash  TEXT,
            metadata       TEXT NOT NULL DEFAULT '{}',  -- JSON
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL,
            last_login_at  TEXT
        );

        -- only the SHA-256 digest of a token is stored
        CREATE TABLE IF NOT EXISTS auth_tokens (
            token_hash  TEXT PRIMARY KEY NOT NULL,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            expires_at  TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_auth_tokens_user ON auth_tokens(user_id);",
    )
}
