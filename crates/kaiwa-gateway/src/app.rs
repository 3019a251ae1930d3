use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use kaiwa_agent::assistants::RunPoller;
use kaiwa_agent::connections::ConnectionRegistry;
use kaiwa_agent::provider::ToolDefinition;
use kaiwa_agent::turn::TurnController;
use kaiwa_core::config::{KaiwaConfig, StorageBackend, MAX_UPLOAD_BYTES};
use kaiwa_storage::BlobStorage;
use kaiwa_threads::ThreadManager;
use kaiwa_users::UserManager;
use tower_http::services::ServeDir;

use crate::sessions::SessionRegistry;

/// How user messages are answered, fixed at startup by `chat.mode`.
pub enum ChatBackend {
    /// Streaming chat completions with local tool execution.
    Completions {
        controller: TurnController,
        tools: Vec<ToolDefinition>,
    },
    /// Hosted assistant runs, polled until they finish.
    Assistants {
        poller: RunPoller,
        assistant_id: String,
    },
}

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: KaiwaConfig,
    pub users: UserManager,
    pub threads: ThreadManager,
    pub storage: Arc<dyn BlobStorage>,
    pub chat: ChatBackend,
    /// Tool connections; closed on shutdown.
    pub registry: Arc<ConnectionRegistry>,
    pub sessions: SessionRegistry,
    /// Outstanding OAuth `state` values and when they were issued.
    pub oauth_states: DashMap<String, Instant>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(
        config: KaiwaConfig,
        users: UserManager,
        threads: ThreadManager,
        storage: Arc<dyn BlobStorage>,
        chat: ChatBackend,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            config,
            users,
            threads,
            storage,
            chat,
            registry,
            sessions: SessionRegistry::new(),
            oauth_states: DashMap::new(),
            http: reqwest::Client::new(),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    use crate::http::{auth, feedback, files, health, messages, threads};

    let mut router = Router::new()
        .route("/api/health", get(health::health_handler))
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/oauth/login", get(auth::oauth_login))
        .route("/auth/oauth/callback", get(auth::oauth_callback))
        .route("/api/threads", get(threads::list).post(threads::create))
        .route(
            "/api/threads/{id}",
            get(threads::get).patch(threads::rename).delete(threads::delete),
        )
        .route("/api/threads/{id}/messages", post(messages::post_message))
        .route("/api/threads/{id}/stop", post(messages::stop))
        .route(
            "/api/threads/{id}/files",
            // one byte over the limit so oversized uploads reach the handler's check
            post(files::upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 1)),
        )
        .route("/api/steps/{id}/feedback", post(feedback::submit));

    if state.config.storage.backend == StorageBackend::Local {
        let served = Router::new()
            .fallback_service(ServeDir::new(&state.config.storage.local_dir))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                files::require_file_access,
            ));
        router = router.nest_service("/files", served);
    }

    router
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
