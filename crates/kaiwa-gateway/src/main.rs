use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kaiwa_agent::assistants::{client::ensure_assistant, AssistantsClient, PollPolicy, RunPoller};
use kaiwa_agent::connections::{builtin::BuiltinConnection, mcp::McpConnection, ConnectionRegistry};
use kaiwa_agent::openai::OpenAiProvider;
use kaiwa_agent::provider::LlmProvider;
use kaiwa_agent::tools::bridge::ToolBridge;
use kaiwa_agent::turn::{TurnController, TurnOptions};
use kaiwa_core::config::{ChatMode, KaiwaConfig};
use kaiwa_core::types::UserRole;
use kaiwa_gateway::app::{self, AppState, ChatBackend};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "kaiwa-gateway")]
#[command(about = "Kaiwa chat gateway", long_about = None)]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("KAIWA_GIT_SHA"), ")"))]
struct Cli {
    /// Config file (defaults to $KAIWA_CONFIG, then ~/.kaiwa/kaiwa.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the HTTP gateway (default)")]
    Serve,
    #[command(about = "Create or upgrade the database schema and exit")]
    Migrate,
    #[command(about = "Create the admin user, or reset its password")]
    Seed {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    #[command(about = "Create an assistant and print its id")]
    CreateAssistant {
        /// Data file attached to the assistant's code interpreter
        #[arg(long)]
        file: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kaiwa_gateway=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = KaiwaConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Migrate => {
            open_database(&config.database.path)?;
            Ok(())
        }
        Commands::Seed { email, password } => seed(&config, email, password),
        Commands::CreateAssistant { file } => {
            let mut assistant = config.assistant.clone();
            assistant.assistant_id = None;
            if file.is_some() {
                assistant.seed_file = file;
            }
            let api = AssistantsClient::from_config(&config.provider);
            let id = ensure_assistant(&api, &assistant, &config.provider.model).await?;
            println!("{id}");
            Ok(())
        }
    }
}

async fn serve(config: KaiwaConfig) -> anyhow::Result<()> {
    open_database(&config.database.path)?;
    // each store gets its own connection
    let users = kaiwa_users::UserManager::new(connect(&config.database.path)?);
    let threads = kaiwa_threads::ThreadManager::new(connect(&config.database.path)?);
    match users.purge_expired_tokens() {
        Ok(n) if n > 0 => info!(count = n, "expired login tokens removed"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "purging expired tokens failed"),
    }

    let storage = kaiwa_storage::from_config(&config.storage, config.gateway.public_url.as_deref())?;
    let registry = connect_tools(&config).await;
    let chat = build_backend(&config, Arc::clone(&registry)).await?;

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(AppState::new(
        config,
        users,
        threads,
        storage,
        chat,
        Arc::clone(&registry),
    ));
    spawn_session_sweep(Arc::clone(&state));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!(version = env!("KAIWA_GIT_SHA"), "Kaiwa gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    registry.close_all().await;
    info!("tool connections closed");
    Ok(())
}

/// Periodically drop idle live sessions; they reload from the store on next use.
fn spawn_session_sweep(state: Arc<AppState>) {
    let idle = Duration::from_secs(state.config.chat.session_idle_secs);
    if idle.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(idle.max(Duration::from_secs(60)) / 2);
        loop {
            tick.tick().await;
            let evicted = state.sessions.evict_idle(idle);
            if evicted > 0 {
                info!(evicted, live = state.sessions.len(), "idle sessions released");
            }
        }
    });
}

/// Open the database file and run every schema migration (idempotent).
fn open_database(path: &str) -> anyhow::Result<rusqlite::Connection> {
    ensure_parent_dir(path);
    info!(path = %path, "opening SQLite database");
    let db = connect(path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    kaiwa_users::db::init_db(&db)?;
    kaiwa_threads::db::init_db(&db)?;
    info!("database migrations complete");
    Ok(db)
}

fn connect(path: &str) -> anyhow::Result<rusqlite::Connection> {
    let db = rusqlite::Connection::open(path)?;
    db.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(db)
}

fn seed(config: &KaiwaConfig, email: Option<String>, password: Option<String>) -> anyhow::Result<()> {
    let db = open_database(&config.database.path)?;
    let users = kaiwa_users::UserManager::new(db);
    let email = email.unwrap_or_else(|| config.auth.default_admin_email.clone());
    let password = password
        .or_else(|| config.auth.default_admin_password.clone())
        .ok_or_else(|| anyhow::anyhow!("no password: pass --password or set auth.default_admin_password"))?;
    let user = users.upsert_password_user(&email, &password, UserRole::Admin)?;
    println!("admin user {} ({})", user.identifier, user.id);
    Ok(())
}

/// Register the built-in tools and spawn the configured MCP servers.
/// A server that fails to start is skipped.
async fn connect_tools(config: &KaiwaConfig) -> Arc<ConnectionRegistry> {
    let registry = Arc::new(ConnectionRegistry::new());
    if config.tools.builtin {
        registry.connect(Arc::new(BuiltinConnection::new()));
    }
    let timeout = Duration::from_secs(config.tools.call_timeout_secs);
    for server in &config.tools.mcp {
        match McpConnection::connect(server, timeout).await {
            Ok(conn) => registry.connect(Arc::new(conn)),
            Err(e) => warn!(connection = %server.id, error = %e, "MCP server unavailable"),
        }
    }
    registry
}

async fn build_backend(config: &KaiwaConfig, registry: Arc<ConnectionRegistry>) -> anyhow::Result<ChatBackend> {
    match config.chat.mode {
        ChatMode::Completions => {
            let tools = registry.list_all_tools().await;
            info!(count = tools.len(), "tools available");
            let bridge = Arc::new(ToolBridge::new(
                registry,
                Duration::from_secs(config.tools.call_timeout_secs),
            ));
            let options = TurnOptions {
                model: config.provider.model.clone(),
                max_tokens: config.provider.max_tokens,
                temperature: config.provider.temperature,
                max_tool_rounds: config.tools.max_tool_rounds,
            };
            Ok(ChatBackend::Completions {
                controller: TurnController::new(build_provider(config), bridge, options),
                tools,
            })
        }
        ChatMode::Assistants => {
            let api = Arc::new(AssistantsClient::from_config(&config.provider));
            let assistant_id = ensure_assistant(api.as_ref(), &config.assistant, &config.provider.model).await?;
            info!(assistant = %assistant_id, "assistants mode");
            Ok(ChatBackend::Assistants {
                poller: RunPoller::new(api, PollPolicy::from(&config.assistant)),
                assistant_id,
            })
        }
    }
}

fn build_provider(config: &KaiwaConfig) -> Arc<dyn LlmProvider> {
    if config.provider.api_key.is_empty() {
        warn!("provider.api_key is empty; chat requests will fail");
        return Arc::new(NullProvider);
    }
    info!(model = %config.provider.model, azure = config.provider.is_azure(), "LLM provider configured");
    Arc::new(OpenAiProvider::from_config(&config.provider))
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

/// Placeholder provider when no API key is available.
struct NullProvider;

#[async_trait::async_trait]
impl LlmProvider for NullProvider {
    fn name(&self) -> &str {
        "null"
    }
    async fn send(
        &self,
        _req: &kaiwa_agent::provider::ChatRequest,
    ) -> Result<kaiwa_agent::provider::ChatResponse, kaiwa_agent::provider::ProviderError> {
        Err(kaiwa_agent::provider::ProviderError::Unavailable(
            "no LLM provider configured, set provider.api_key in kaiwa.toml".into(),
        ))
    }
}
