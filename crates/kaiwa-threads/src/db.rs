use rusqlite::Connection;

use crate::error::Result;

/// Create the thread, step, element and feedback tables.
///
/// Safe to call on every startup, uses `IF NOT EXISTS` throughout. Child rows
/// go away with their thread when foreign keys are enabled on the connection.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS threads (
            id                 TEXT PRIMARY KEY,
            user_id            TEXT NOT NULL,
            user_identifier    TEXT NOT NULL,
            name               TEXT NOT NULL,
            provider_thread_id TEXT,
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_threads_user
            ON threads(user_id, updated_at DESC);

        CREATE TABLE IF NOT EXISTS steps (
            id           TEXT PRIMARY KEY,
            thread_id    TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            seq          INTEGER NOT NULL,
            role         TEXT NOT NULL,
            name         TEXT NOT NULL,
            content      TEXT NOT NULL,
            tool_call_id TEXT,
            tool_calls   TEXT,
            created_at   TEXT NOT NULL,
            start_at     TEXT NOT NULL,
            end_at       TEXT NOT NULL,
            UNIQUE (thread_id, seq)
        );

        CREATE TABLE IF NOT EXISTS elements (
            id          TEXT PRIMARY KEY,
            thread_id   TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            step_id     TEXT,
            name        TEXT NOT NULL,
            mime        TEXT NOT NULL,
            object_key  TEXT NOT NULL,
            url         TEXT NOT NULL,
            size        INTEGER NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_elements_thread ON elements(thread_id);

        CREATE TABLE IF NOT EXISTS feedback (
            id          TEXT PRIMARY KEY,
            step_id     TEXT NOT NULL UNIQUE REFERENCES steps(id) ON DELETE CASCADE,
            value       INTEGER NOT NULL,
            comment     TEXT,
            created_at  TEXT NOT NULL
        );",
    )?;
    Ok(())
}
