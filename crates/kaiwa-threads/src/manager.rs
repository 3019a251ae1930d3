use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use kaiwa_core::turn::{ChatTurn, Role, ToolInvocation};
use kaiwa_core::types::ThreadId;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{Result, ThreadError};
use crate::types::{Element, Feedback, NewElement, Step, Thread};

const THREAD_COLUMNS: &str =
    "id, user_id, user_identifier, name, provider_thread_id, created_at, updated_at";

const STEP_COLUMNS: &str = "id, thread_id, seq, role, name, content, tool_call_id, tool_calls,
     created_at, start_at, end_at";

const ELEMENT_COLUMNS: &str =
    "id, thread_id, step_id, name, mime, object_key, url, size, created_at";

/// Name given to a thread created without one.
pub fn default_thread_name(now: DateTime<Utc>) -> String {
    format!("Chat {}", now.format("%Y-%m-%d %H:%M"))
}

/// Persisted threads and their steps, elements and feedback.
///
/// Wraps a single SQLite connection in a `Mutex`; the lock is never held
/// across an await point.
pub struct ThreadManager {
    db: Mutex<Connection>,
}

impl ThreadManager {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Cheap liveness check for the health endpoint.
    pub fn ping(&self) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    #[instrument(skip(self), fields(user_id))]
    pub fn create_thread(
        &self,
        user_id: &str,
        user_identifier: &str,
        name: Option<&str>,
    ) -> Result<Thread> {
        let now = Utc::now();
        let name = match name.map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => default_thread_name(now),
        };
        let thread = Thread {
            id: ThreadId::new().to_string(),
            user_id: user_id.to_string(),
            user_identifier: user_identifier.to_string(),
            name,
            provider_thread_id: None,
            created_at: now.to_rfc3339(),
            updated_at: now.to_rfc3339(),
        };

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO threads (id, user_id, user_identifier, name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![thread.id, thread.user_id, thread.user_identifier, thread.name, thread.created_at],
        )?;
        debug!(thread = %thread.id, "thread created");
        Ok(thread)
    }

    pub fn get(&self, thread_id: &str) -> Result<Option<Thread>> {
        let db = self.db.lock().unwrap();
        let thread = db
            .query_row(
                &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?1"),
                params![thread_id],
                row_to_thread,
            )
            .optional()?;
        Ok(thread)
    }

    /// Most recently active threads first.
    #[instrument(skip(self), fields(user_id, limit))]
    pub fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<Thread>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {THREAD_COLUMNS} FROM threads
             WHERE user_id = ?1
             ORDER BY updated_at DESC, id DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![user_id, limit as i64], row_to_thread)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn rename(&self, thread_id: &str, name: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE threads SET name = ?1, updated_at = ?2 WHERE id = ?3",
            params![name, now, thread_id],
        )?;
        ensure_found(changed, "thread", thread_id)
    }

    pub fn set_provider_thread(&self, thread_id: &str, provider_thread_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE threads SET provider_thread_id = ?1 WHERE id = ?2",
            params![provider_thread_id, thread_id],
        )?;
        ensure_found(changed, "thread", thread_id)
    }

    /// Delete a thread together with its steps, elements and feedback.
    #[instrument(skip(self))]
    pub fn delete(&self, thread_id: &str) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM feedback WHERE step_id IN (SELECT id FROM steps WHERE thread_id = ?1)",
            params![thread_id],
        )?;
        tx.execute("DELETE FROM steps WHERE thread_id = ?1", params![thread_id])?;
        tx.execute("DELETE FROM elements WHERE thread_id = ?1", params![thread_id])?;
        let changed = tx.execute("DELETE FROM threads WHERE id = ?1", params![thread_id])?;
        ensure_found(changed, "thread", thread_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Persist committed turns as the next steps of the thread, atomically.
    ///
    /// Tool turns are named after the tool they answer when the matching
    /// assistant turn is part of the same batch.
    #[instrument(skip(self, turns), fields(thread_id, count = turns.len()))]
    pub fn append_turns(&self, thread_id: &str, turns: &[ChatTurn]) -> Result<Vec<Step>> {
        let now = Utc::now().to_rfc3339();
        let mut tool_names: HashMap<&str, &str> = HashMap::new();

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), -1) + 1 FROM steps WHERE thread_id = ?1",
            params![thread_id],
            |row| row.get(0),
        )?;

        let mut steps = Vec::with_capacity(turns.len());
        for (offset, turn) in turns.iter().enumerate() {
            for call in &turn.tool_calls {
                tool_names.insert(call.id.as_str(), call.name.as_str());
            }
            let name = turn
                .tool_call_id
                .as_deref()
                .and_then(|id| tool_names.get(id).copied())
                .unwrap_or(turn.role.as_str())
                .to_string();
            let tool_calls = if turn.tool_calls.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&turn.tool_calls).map_err(|source| {
                    ThreadError::CorruptStep {
                        step_id: format!("{thread_id}#{offset}"),
                        source,
                    }
                })?)
            };

            let step = Step {
                id: Uuid::now_v7().to_string(),
                thread_id: thread_id.to_string(),
                seq: next + offset as i64,
                role: turn.role,
                name,
                content: turn.content.clone(),
                tool_call_id: turn.tool_call_id.clone(),
                tool_calls,
                created_at: now.clone(),
                start: now.clone(),
                end: now.clone(),
            };
            tx.execute(
                &format!("INSERT INTO steps ({STEP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                params![
                    step.id,
                    step.thread_id,
                    step.seq,
                    step.role.as_str(),
                    step.name,
                    step.content,
                    step.tool_call_id,
                    step.tool_calls,
                    step.created_at,
                    step.start,
                    step.end
                ],
            )?;
            steps.push(step);
        }

        let changed = tx.execute(
            "UPDATE threads SET updated_at = ?1 WHERE id = ?2",
            params![now, thread_id],
        )?;
        ensure_found(changed, "thread", thread_id)?;
        tx.commit()?;
        Ok(steps)
    }

    pub fn list_steps(&self, thread_id: &str) -> Result<Vec<Step>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE thread_id = ?1 ORDER BY seq"
        ))?;
        let rows = stmt.query_map(params![thread_id], row_to_step)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_step(&self, step_id: &str) -> Result<Option<Step>> {
        let db = self.db.lock().unwrap();
        let step = db
            .query_row(
                &format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1"),
                params![step_id],
                row_to_step,
            )
            .optional()?;
        Ok(step)
    }

    /// Rebuild the chat history of a thread for replay.
    pub fn load_turns(&self, thread_id: &str) -> Result<Vec<ChatTurn>> {
        self.list_steps(thread_id)?
            .into_iter()
            .map(|step| {
                let tool_calls: Vec<ToolInvocation> = match &step.tool_calls {
                    Some(raw) => serde_json::from_str(raw).map_err(|source| ThreadError::CorruptStep {
                        step_id: step.id.clone(),
                        source,
                    })?,
                    None => Vec::new(),
                };
                Ok(ChatTurn {
                    role: step.role,
                    content: step.content,
                    tool_call_id: step.tool_call_id,
                    tool_calls,
                })
            })
            .collect()
    }

    pub fn add_element(&self, new: NewElement) -> Result<Element> {
        let element = Element {
            id: Uuid::now_v7().to_string(),
            thread_id: new.thread_id,
            step_id: new.step_id,
            name: new.name,
            mime: new.mime,
            object_key: new.object_key,
            url: new.url,
            size: new.size,
            created_at: Utc::now().to_rfc3339(),
        };
        let db = self.db.lock().unwrap();
        db.execute(
            &format!("INSERT INTO elements ({ELEMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                element.id,
                element.thread_id,
                element.step_id,
                element.name,
                element.mime,
                element.object_key,
                element.url,
                element.size,
                element.created_at
            ],
        )?;
        debug!(element = %element.id, key = %element.object_key, "element stored");
        Ok(element)
    }

    pub fn list_elements(&self, thread_id: &str) -> Result<Vec<Element>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {ELEMENT_COLUMNS} FROM elements WHERE thread_id = ?1 ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(params![thread_id], |row| {
            Ok(Element {
                id: row.get(0)?,
                thread_id: row.get(1)?,
                step_id: row.get(2)?,
                name: row.get(3)?,
                mime: row.get(4)?,
                object_key: row.get(5)?,
                url: row.get(6)?,
                size: row.get(7)?,
                created_at: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Record feedback for a step, replacing any earlier feedback on it.
    #[instrument(skip(self, comment))]
    pub fn upsert_feedback(&self, step_id: &str, value: i64, comment: Option<&str>) -> Result<Feedback> {
        if !(-1..=1).contains(&value) {
            return Err(ThreadError::InvalidFeedback(value));
        }
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO feedback (id, step_id, value, comment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(step_id) DO UPDATE SET value = excluded.value, comment = excluded.comment",
            params![Uuid::now_v7().to_string(), step_id, value, comment, now],
        )?;
        let feedback = db.query_row(
            "SELECT id, step_id, value, comment, created_at FROM feedback WHERE step_id = ?1",
            params![step_id],
            |row| {
                Ok(Feedback {
                    id: row.get(0)?,
                    step_id: row.get(1)?,
                    value: row.get(2)?,
                    comment: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )?;
        Ok(feedback)
    }
}

fn ensure_found(changed: usize, what: &'static str, id: &str) -> Result<()> {
    if changed == 0 {
        return Err(ThreadError::NotFound {
            what,
            id: id.to_string(),
        });
    }
    Ok(())
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thread> {
    Ok(Thread {
        id: row.get(0)?,
        user_id: row.get(1)?,
        user_identifier: row.get(2)?,
        name: row.get(3)?,
        provider_thread_id: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<Step> {
    let role: String = row.get(3)?;
    let role: Role = role.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Step {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        seq: row.get(2)?,
        role,
        name: row.get(4)?,
        content: row.get(5)?,
        tool_call_id: row.get(6)?,
        tool_calls: row.get(7)?,
        created_at: row.get(8)?,
        start: row.get(9)?,
        end: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use chrono::TimeZone;

    fn manager() -> ThreadManager {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        init_db(&conn).unwrap();
        ThreadManager::new(conn)
    }

    fn tool_turns() -> Vec<ChatTurn> {
        vec![
            ChatTurn::user("weather in Tokyo?"),
            ChatTurn::assistant_with_tools(
                "",
                vec![ToolInvocation {
                    index: 0,
                    id: "call_1".into(),
                    name: "weather".into(),
                    arguments: r#"{"location":"Tokyo"}"#.into(),
                }],
            ),
            ChatTurn::tool_result("call_1", r#"{"temperature":25}"#),
            ChatTurn::assistant("It is 25 degrees in Tokyo."),
        ]
    }

    #[test]
    fn default_name_uses_minutes() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 59).unwrap();
        assert_eq!(default_thread_name(at), "Chat 2024-03-09 14:05");
    }

    #[test]
    fn create_get_rename() {
        let m = manager();
        let t = m.create_thread("u1", "a@example.com", None).unwrap();
        assert!(t.name.starts_with("Chat "));

        m.rename(&t.id, "Quarterly numbers").unwrap();
        let loaded = m.get(&t.id).unwrap().unwrap();
        assert_eq!(loaded.name, "Quarterly numbers");
        assert_eq!(loaded.user_identifier, "a@example.com");

        assert!(m.get("missing").unwrap().is_none());
        assert!(matches!(
            m.rename("missing", "x"),
            Err(ThreadError::NotFound { what: "thread", .. })
        ));
    }

    #[test]
    fn turns_round_trip_through_steps() {
        let m = manager();
        let t = m.create_thread("u1", "a@example.com", Some("weather")).unwrap();
        let turns = tool_turns();

        let steps = m.append_turns(&t.id, &turns).unwrap();
        assert_eq!(steps.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(steps[2].name, "weather");
        assert_eq!(steps[0].name, "user");

        assert_eq!(m.load_turns(&t.id).unwrap(), turns);
    }

    #[test]
    fn appends_continue_the_sequence() {
        let m = manager();
        let t = m.create_thread("u1", "a", None).unwrap();
        m.append_turns(&t.id, &[ChatTurn::user("one")]).unwrap();
        let more = m
            .append_turns(&t.id, &[ChatTurn::assistant("two"), ChatTurn::user("three")])
            .unwrap();
        assert_eq!(more[0].seq, 1);
        assert_eq!(more[1].seq, 2);
        let contents: Vec<String> = m.load_turns(&t.id).unwrap().into_iter().map(|t| t.content).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn appending_to_unknown_thread_fails_without_writing() {
        let m = manager();
        let err = m.append_turns("ghost", &[ChatTurn::user("x")]).unwrap_err();
        assert!(matches!(err, ThreadError::Database(_) | ThreadError::NotFound { .. }));
        assert!(m.list_steps("ghost").unwrap().is_empty());
    }

    #[test]
    fn list_is_per_user() {
        let m = manager();
        m.create_thread("u1", "a", Some("first")).unwrap();
        m.create_thread("u1", "a", Some("second")).unwrap();
        m.create_thread("u2", "b", Some("other")).unwrap();

        let mine = m.list_for_user("u1", 10).unwrap();
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|t| t.user_id == "u1"));
        assert_eq!(m.list_for_user("u1", 1).unwrap().len(), 1);
    }

    #[test]
    fn feedback_is_upserted_per_step() {
        let m = manager();
        let t = m.create_thread("u1", "a", None).unwrap();
        let steps = m.append_turns(&t.id, &[ChatTurn::assistant("hi")]).unwrap();

        let first = m.upsert_feedback(&steps[0].id, 1, None).unwrap();
        let second = m.upsert_feedback(&steps[0].id, -1, Some("wrong")).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.value, -1);
        assert_eq!(second.comment.as_deref(), Some("wrong"));

        assert!(matches!(
            m.upsert_feedback(&steps[0].id, 5, None),
            Err(ThreadError::InvalidFeedback(5))
        ));
    }

    #[test]
    fn delete_removes_children() {
        let m = manager();
        let t = m.create_thread("u1", "a", None).unwrap();
        let steps = m.append_turns(&t.id, &tool_turns()).unwrap();
        m.upsert_feedback(&steps[3].id, 1, None).unwrap();
        m.add_element(NewElement {
            thread_id: t.id.clone(),
            step_id: None,
            name: "data.csv".into(),
            mime: "text/csv".into(),
            object_key: format!("{}/data.csv", t.id),
            url: "/files/x".into(),
            size: 12,
        })
        .unwrap();

        m.delete(&t.id).unwrap();
        assert!(m.get(&t.id).unwrap().is_none());
        assert!(m.list_steps(&t.id).unwrap().is_empty());
        assert!(m.list_elements(&t.id).unwrap().is_empty());
        assert!(m.get_step(&steps[3].id).unwrap().is_none());
    }

    #[test]
    fn provider_thread_is_remembered() {
        let m = manager();
        let t = m.create_thread("u1", "a", None).unwrap();
        m.set_provider_thread(&t.id, "thread_abc").unwrap();
        assert_eq!(
            m.get(&t.id).unwrap().unwrap().provider_thread_id.as_deref(),
            Some("thread_abc")
        );
    }

    #[test]
    fn ping_succeeds_on_open_db() {
        assert!(manager().ping().is_ok());
    }
}
