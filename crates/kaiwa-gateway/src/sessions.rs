//! In-memory chat sessions, one per thread, rebuilt from the thread store on
//! first use after a restart.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use kaiwa_agent::assistants::Attachment;
use kaiwa_agent::session::{MessageHistory, SessionContext};
use kaiwa_core::config::ChatConfig;
use kaiwa_core::turn::ChatTurn;
use kaiwa_core::types::ThreadId;
use kaiwa_threads::{Thread, ThreadError, ThreadManager};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct LiveSession {
    /// Held for the whole turn; `try_lock` failing means a turn is running.
    pub ctx: Arc<tokio::sync::Mutex<SessionContext>>,
    stop: Mutex<CancellationToken>,
    /// Provider files uploaded since the last message (assistants mode).
    pending: Mutex<Vec<Attachment>>,
    last_used: Mutex<Instant>,
}

impl LiveSession {
    fn new(ctx: SessionContext) -> Self {
        Self {
            ctx: Arc::new(tokio::sync::Mutex::new(ctx)),
            stop: Mutex::new(CancellationToken::new()),
            pending: Mutex::new(Vec::new()),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    /// Safe to drop: idle past `ttl`, no turn holding the context and no
    /// attachments waiting for the next message.
    fn is_evictable(&self, ttl: Duration) -> bool {
        self.last_used.lock().unwrap().elapsed() >= ttl
            && self.ctx.try_lock().is_ok()
            && self.pending.lock().unwrap().is_empty()
    }

    /// Fresh token for the turn about to start.
    pub fn begin_turn(&self) -> CancellationToken {
        self.touch();
        let mut stop = self.stop.lock().unwrap();
        *stop = CancellationToken::new();
        stop.clone()
    }

    /// Cancel whatever turn is running. Harmless when idle.
    pub fn stop(&self) {
        self.stop.lock().unwrap().cancel();
    }

    pub fn queue_attachment(&self, attachment: Attachment) {
        self.pending.lock().unwrap().push(attachment);
    }

    /// Attachments for the next message, in upload order.
    pub fn take_attachments(&self) -> Vec<Attachment> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }

    /// Put attachments back after a turn that never reached the provider.
    pub fn restore_attachments(&self, mut attachments: Vec<Attachment>) {
        let mut pending = self.pending.lock().unwrap();
        attachments.append(&mut pending);
        *pending = attachments;
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    live: DashMap<String, Arc<LiveSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, thread_id: &str) -> Option<Arc<LiveSession>> {
        let live = self.live.get(thread_id).map(|s| Arc::clone(s.value()))?;
        live.touch();
        Some(live)
    }

    /// The live session for `thread`, loading its history on first use.
    /// The system prompt comes from config and is never persisted.
    ///
    /// History is read before the map entry is locked; when two requests
    /// race, the first insert wins and the other load is discarded.
    pub fn get_or_load(
        &self,
        thread: &Thread,
        threads: &ThreadManager,
        chat: &ChatConfig,
    ) -> Result<Arc<LiveSession>, ThreadError> {
        if let Some(live) = self.get(&thread.id) {
            return Ok(live);
        }

        let mut turns = vec![ChatTurn::system(chat.system_prompt.clone())];
        turns.extend(threads.load_turns(&thread.id)?);
        debug!(thread = %thread.id, turns = turns.len(), "session loaded");

        let mut ctx = SessionContext::with_history(
            ThreadId::from(thread.id.as_str()),
            MessageHistory::from_turns(turns),
        );
        ctx.provider_thread_id = thread.provider_thread_id.clone();

        let entry = self
            .live
            .entry(thread.id.clone())
            .or_insert_with(|| Arc::new(LiveSession::new(ctx)));
        Ok(Arc::clone(entry.value()))
    }

    /// Drop sessions idle for at least `ttl`. Busy sessions and sessions
    /// with queued attachments stay. Returns how many were dropped.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let before = self.live.len();
        self.live.retain(|_, live| !live.is_evictable(ttl));
        let evicted = before.saturating_sub(self.live.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.live.len(), "idle sessions evicted");
        }
        evicted
    }

    /// Forget a session (thread deleted). A running turn is cancelled.
    pub fn remove(&self, thread_id: &str) {
        if let Some((_, session)) = self.live.remove(thread_id) {
            session.stop();
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaiwa_core::turn::Role;
    use rusqlite::Connection;

    fn store() -> ThreadManager {
        let conn = Connection::open_in_memory().unwrap();
        kaiwa_threads::db::init_db(&conn).unwrap();
        ThreadManager::new(conn)
    }

    #[tokio::test]
    async fn history_is_rebuilt_from_steps() {
        let threads = store();
        let thread = threads.create_thread("u1", "a@example.com", Some("t")).unwrap();
        threads
            .append_turns(
                &thread.id,
                &[ChatTurn::assistant("hello"), ChatTurn::user("hi"), ChatTurn::assistant("yo")],
            )
            .unwrap();

        let registry = SessionRegistry::new();
        let chat = ChatConfig::default();
        let live = registry.get_or_load(&thread, &threads, &chat).unwrap();
        let ctx = live.ctx.lock().await;
        let roles: Vec<Role> = ctx.history.turns().iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::System, Role::Assistant, Role::User, Role::Assistant]);
        assert_eq!(ctx.history.turns()[0].content, chat.system_prompt);
        drop(ctx);

        // second lookup reuses the live session
        let again = registry.get_or_load(&thread, &threads, &chat).unwrap();
        assert!(Arc::ptr_eq(&live, &again));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stop_cancels_current_turn_only() {
        let live = LiveSession::new(SessionContext::new(ThreadId::from("t")));
        let first = live.begin_turn();
        live.stop();
        assert!(first.is_cancelled());

        let second = live.begin_turn();
        assert!(!second.is_cancelled());
    }

    #[test]
    fn attachments_are_taken_once_and_restored_in_order() {
        let live = LiveSession::new(SessionContext::new(ThreadId::from("t")));
        let file = |id: &str| Attachment {
            file_id: id.to_string(),
            mime: "text/csv".to_string(),
        };
        live.queue_attachment(file("f1"));
        let taken = live.take_attachments();
        assert_eq!(taken, vec![file("f1")]);
        assert!(live.take_attachments().is_empty());

        live.queue_attachment(file("f2"));
        live.restore_attachments(taken);
        let ids: Vec<String> = live.take_attachments().into_iter().map(|a| a.file_id).collect();
        assert_eq!(ids, vec!["f1", "f2"]);
    }

    #[test]
    fn remove_cancels_running_turn() {
        let registry = SessionRegistry::new();
        let threads = store();
        let thread = threads.create_thread("u1", "a@example.com", None).unwrap();
        let live = registry
            .get_or_load(&thread, &threads, &ChatConfig::default())
            .unwrap();
        let token = live.begin_turn();
        registry.remove(&thread.id);
        assert!(token.is_cancelled());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_and_reloaded() {
        let registry = SessionRegistry::new();
        let threads = store();
        let chat = ChatConfig::default();
        let idle = threads.create_thread("u1", "a@example.com", None).unwrap();
        let busy = threads.create_thread("u1", "a@example.com", None).unwrap();
        let queued = threads.create_thread("u1", "a@example.com", None).unwrap();
        threads.append_turns(&idle.id, &[ChatTurn::user("remember me")]).unwrap();

        let first = registry.get_or_load(&idle, &threads, &chat).unwrap();
        let running = registry.get_or_load(&busy, &threads, &chat).unwrap();
        let _turn = Arc::clone(&running.ctx).try_lock_owned().unwrap();
        registry
            .get_or_load(&queued, &threads, &chat)
            .unwrap()
            .queue_attachment(Attachment {
                file_id: "f1".into(),
                mime: "text/csv".into(),
            });

        // nothing is old enough yet
        assert_eq!(registry.evict_idle(Duration::from_secs(3600)), 0);

        assert_eq!(registry.evict_idle(Duration::ZERO), 1);
        assert!(registry.get(&idle.id).is_none());
        assert!(registry.get(&busy.id).is_some());
        assert!(registry.get(&queued.id).is_some());

        let reloaded = registry.get_or_load(&idle, &threads, &chat).unwrap();
        assert!(!Arc::ptr_eq(&first, &reloaded));
        let ctx = reloaded.ctx.lock().await;
        assert_eq!(ctx.history.last().unwrap(), &ChatTurn::user("remember me"));
    }
}
