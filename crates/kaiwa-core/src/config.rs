use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024; // 20 MB per uploaded file

/// MIME types that additionally get `file_search` when attached to an
/// assistants-mode message. Everything else only gets `code_interpreter`.
pub const TEXT_MIME_TYPES: &[&str] = &[
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "text/markdown",
    "application/pdf",
    "text/plain",
];

/// Top-level config (kaiwa.toml + KAIWA_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KaiwaConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Externally reachable base URL, used for OAuth redirects and local file links.
    pub public_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            public_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    /// Seeded by `kaiwa-gateway seed` when no flags are given.
    #[serde(default = "default_admin_email")]
    pub default_admin_email: String,
    pub default_admin_password: Option<String>,
    /// Lifetime of a login token issued by /auth/login or the OAuth callback.
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: i64,
    pub oauth: Option<OAuthConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            default_admin_email: default_admin_email(),
            default_admin_password: None,
            token_ttl_hours: default_token_ttl_hours(),
            oauth: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Local identifier + password checked against the users table.
    #[default]
    Password,
    /// Authorization-code flow against an external identity provider.
    /// Password login stays available for seeded accounts.
    Oauth,
    /// Every request runs as the default admin. Local development only.
    None,
}

/// Generic OAuth2 authorization-code provider (Azure AD, GitHub, Google, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Label stored on users created through this provider.
    #[serde(default = "default_oauth_provider")]
    pub provider: String,
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    /// Must match the redirect registered with the identity provider.
    pub redirect_url: String,
    #[serde(default = "default_oauth_scopes")]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// OpenAI-compatible provider. Setting `api_version` switches to Azure
/// OpenAI addressing (`api-key` header, deployment-scoped URLs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    pub api_version: Option<String>,
    /// Model name, or the deployment name in Azure mode.
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_openai_base_url(),
            api_version: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ProviderConfig {
    pub fn is_azure(&self) -> bool {
        self.api_version.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ChatMode {
    /// Streaming chat completions with client-side tool execution.
    #[default]
    Completions,
    /// Hosted assistants API: threads, runs and status polling.
    Assistants,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub mode: ChatMode,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// First assistant message of every new thread. Empty disables it.
    #[serde(default = "default_greeting")]
    pub greeting: String,
    /// Idle live sessions are dropped from memory after this long and
    /// reloaded from the thread store on next use. Zero keeps them forever.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            mode: ChatMode::default(),
            system_prompt: default_system_prompt(),
            greeting: default_greeting(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// Existing assistant to reuse. When absent one is created at startup.
    pub assistant_id: Option<String>,
    #[serde(default = "default_assistant_name")]
    pub name: String,
    #[serde(default = "default_assistant_instructions")]
    pub instructions: String,
    #[serde(default = "default_assistant_temperature")]
    pub temperature: f32,
    /// Data file uploaded and attached to the code interpreter on creation.
    pub seed_file: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on a single run. Zero waits forever.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            assistant_id: None,
            name: default_assistant_name(),
            instructions: default_assistant_instructions(),
            temperature: default_assistant_temperature(),
            seed_file: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    #[default]
    Local,
    Azure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Root directory for the local backend.
    #[serde(default = "default_local_dir")]
    pub local_dir: String,
    pub account: Option<String>,
    pub account_key: Option<String>,
    #[serde(default = "default_container")]
    pub container: String,
    /// Replaces `https://{account}.blob.core.windows.net`, e.g.
    /// `http://127.0.0.1:10000/devstoreaccount1` for Azurite.
    pub endpoint_override: Option<String>,
    /// Lifetime of SAS read URLs.
    #[serde(default = "default_sas_ttl_secs")]
    pub sas_ttl_secs: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            local_dir: default_local_dir(),
            account: None,
            account_key: None,
            container: default_container(),
            endpoint_override: None,
            sas_ttl_secs: default_sas_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Register the in-process `calculator` and `weather` tools.
    #[serde(default = "bool_true")]
    pub builtin: bool,
    /// Tool rounds allowed per user turn before the answer is forced.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default)]
    pub mcp: Vec<McpServerConfig>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            builtin: true,
            max_tool_rounds: default_max_tool_rounds(),
            call_timeout_secs: default_call_timeout_secs(),
            mcp: Vec::new(),
        }
    }
}

/// An MCP server spawned over stdio at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Connection identifier, also the prefix tools are grouped under.
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_admin_email() -> String {
    "admin@example.com".to_string()
}
fn default_token_ttl_hours() -> i64 {
    24 * 7
}
fn default_oauth_provider() -> String {
    "oauth".to_string()
}
fn default_oauth_scopes() -> Vec<String> {
    vec!["openid".into(), "email".into(), "profile".into()]
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_system_prompt() -> String {
    "You are a helpful assistant.".to_string()
}
fn default_greeting() -> String {
    "Hello! How can I help you today?".to_string()
}
fn default_session_idle_secs() -> u64 {
    1800
}
fn default_assistant_name() -> String {
    "Data Analyst".to_string()
}
fn default_assistant_instructions() -> String {
    "You are a data analyst. Use the attached files and the code interpreter \
     to answer questions, and produce charts when they help."
        .to_string()
}
fn default_assistant_temperature() -> f32 {
    0.1
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_max_wait_secs() -> u64 {
    600
}
fn default_local_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.kaiwa/files", home)
}
fn default_container() -> String {
    "kaiwa".to_string()
}
fn default_sas_ttl_secs() -> i64 {
    3600
}
fn default_max_tool_rounds() -> usize {
    1
}
fn default_call_timeout_secs() -> u64 {
    60
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.kaiwa/kaiwa.db", home)
}

impl KaiwaConfig {
    /// Load config from a TOML file with KAIWA_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `KAIWA_CONFIG`
    ///   3. ~/.kaiwa/kaiwa.toml
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("KAIWA_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::KaiwaError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        // `split("__")` keeps single underscores inside field names, so
        // KAIWA_PROVIDER__API_KEY maps to provider.api_key.
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("KAIWA_").ignore(&["CONFIG"]).split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.kaiwa/kaiwa.toml", home)
}
