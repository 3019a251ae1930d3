use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use kaiwa_agent::assistants::{
    Annotation, AssistantMessage, AssistantSpec, AssistantsApi, Attachment, PollPolicy, RunHandle,
    RunPoller, RunSnapshot, RunStatus, RunToolCall, RunUsage,
};
use kaiwa_agent::connections::ConnectionRegistry;
use kaiwa_agent::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};
use kaiwa_agent::tools::bridge::ToolBridge;
use kaiwa_agent::turn::{TurnController, TurnOptions};
use kaiwa_core::config::{AuthMode, KaiwaConfig};
use kaiwa_core::turn::Role;
use kaiwa_core::types::UserRole;
use kaiwa_gateway::app::{build_router, AppState, ChatBackend};
use kaiwa_threads::ThreadManager;
use kaiwa_users::UserManager;
use rusqlite::Connection;
use serde_json::{json, Value};
use tower::ServiceExt;

/// Answers every turn with the last user message.
struct Echo;

#[async_trait]
impl LlmProvider for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let last = req
            .turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.clone())
            .unwrap_or_default();
        Ok(ChatResponse {
            content: format!("echo: {last}"),
            model: "echo-1".into(),
            tokens_in: 3,
            tokens_out: 2,
            stop_reason: "stop".into(),
            tool_calls: Vec::new(),
        })
    }
}

struct AlwaysFail;

#[async_trait]
impl LlmProvider for AlwaysFail {
    fn name(&self) -> &str {
        "fail"
    }

    async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        Err(ProviderError::Unavailable("upstream down".into()))
    }
}

struct Harness {
    app: Router,
    state: Arc<AppState>,
    _files: tempfile::TempDir,
}

/// A provider thread whose every run completes at once, having run one
/// code interpreter call and produced a chart.
struct FinishedRuns;

#[async_trait]
impl AssistantsApi for FinishedRuns {
    async fn create_thread(&self) -> Result<String, ProviderError> {
        Ok("thread_p".into())
    }
    async fn add_message(&self, _: &str, _: &str, _: &[Attachment]) -> Result<(), ProviderError> {
        Ok(())
    }
    async fn create_run(&self, thread_id: &str, _: &str) -> Result<RunHandle, ProviderError> {
        Ok(RunHandle {
            thread_id: thread_id.into(),
            run_id: "run_1".into(),
            status: RunStatus::Queued,
            usage: None,
        })
    }
    async fn retrieve_run(&self, _: &str, _: &str) -> Result<RunSnapshot, ProviderError> {
        Ok(RunSnapshot {
            usage: Some(RunUsage {
                prompt_tokens: 40,
                completion_tokens: 12,
            }),
            ..RunSnapshot::new(RunStatus::Completed)
        })
    }
    async fn cancel_run(&self, _: &str, _: &str) -> Result<(), ProviderError> {
        Ok(())
    }
    async fn list_run_tool_calls(&self, _: &str, _: &str) -> Result<Vec<RunToolCall>, ProviderError> {
        Ok(vec![RunToolCall {
            id: "ci_1".into(),
            name: "code_interpreter".into(),
            input: Some("plot(df)".into()),
            output: Some("saved\n".into()),
            failed: false,
        }])
    }
    async fn latest_assistant_message(&self, _: &str) -> Result<Option<AssistantMessage>, ProviderError> {
        Ok(Some(AssistantMessage {
            id: "msg_1".into(),
            text: "Here it is: [chart](sandbox:/mnt/data/chart.png)".into(),
            annotations: vec![Annotation::FilePath {
                text: "sandbox:/mnt/data/chart.png".into(),
                file_id: "file-chart".into(),
            }],
            image_file_ids: Vec::new(),
        }))
    }
    async fn upload_file(&self, _: &str, _: Vec<u8>, _: &str) -> Result<String, ProviderError> {
        Ok("file-up".into())
    }
    async fn file_content(&self, _: &str) -> Result<Vec<u8>, ProviderError> {
        Ok(b"PNG".to_vec())
    }
    async fn create_assistant(&self, _: &AssistantSpec) -> Result<String, ProviderError> {
        Ok("asst".into())
    }
    async fn retrieve_assistant(&self, _: &str) -> Result<Option<String>, ProviderError> {
        Ok(Some("asst".into()))
    }
}

fn harness(mode: AuthMode, provider: Arc<dyn LlmProvider>) -> Harness {
    build_harness(mode, |registry| {
        let bridge = Arc::new(ToolBridge::new(registry, Duration::from_secs(5)));
        let controller = TurnController::new(
            provider,
            bridge,
            TurnOptions {
                model: "echo-1".into(),
                max_tokens: 256,
                temperature: None,
                max_tool_rounds: 1,
            },
        );
        ChatBackend::Completions {
            controller,
            tools: Vec::new(),
        }
    })
}

fn assistants_harness(api: Arc<dyn AssistantsApi>) -> Harness {
    build_harness(AuthMode::Password, |_| ChatBackend::Assistants {
        poller: RunPoller::new(
            api,
            PollPolicy {
                interval: Duration::from_millis(1),
                max_wait: None,
            },
        ),
        assistant_id: "asst".into(),
    })
}

fn build_harness(mode: AuthMode, chat: impl FnOnce(Arc<ConnectionRegistry>) -> ChatBackend) -> Harness {
    let files = tempfile::tempdir().unwrap();
    let mut config = KaiwaConfig::default();
    config.auth.mode = mode;
    config.chat.greeting = "Hi, ask me anything.".into();
    config.storage.local_dir = files.path().to_string_lossy().into_owned();

    let users_db = Connection::open_in_memory().unwrap();
    kaiwa_users::db::init_db(&users_db).unwrap();
    let threads_db = Connection::open_in_memory().unwrap();
    threads_db.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
    kaiwa_threads::db::init_db(&threads_db).unwrap();

    let registry = Arc::new(ConnectionRegistry::new());
    let chat = chat(Arc::clone(&registry));
    let storage = kaiwa_storage::from_config(&config.storage, None).unwrap();

    let state = Arc::new(AppState::new(
        config,
        UserManager::new(users_db),
        ThreadManager::new(threads_db),
        storage,
        chat,
        registry,
    ));
    Harness {
        app: build_router(Arc::clone(&state)),
        state,
        _files: files,
    }
}

impl Harness {
    async fn send(&self, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Vec<u8>) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = self.app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn json(&self, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let (status, bytes) = self.send(method, uri, token, body).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn login(&self, identifier: &str, password: &str) -> String {
        self.state
            .users
            .create(identifier, password, UserRole::User)
            .unwrap();
        let (status, body) = self
            .json(
                "POST",
                "/auth/login",
                None,
                Some(json!({"identifier": identifier, "password": password})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        body["token"].as_str().unwrap().to_string()
    }

    async fn new_thread(&self, token: &str) -> String {
        let (status, body) = self
            .json("POST", "/api/threads", Some(token), Some(json!({"name": "Budget"})))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }

    /// SSE `data:` payloads of a message turn, parsed.
    async fn post_message(&self, token: &str, thread: &str, content: &str) -> Vec<Value> {
        let (status, bytes) = self
            .send(
                "POST",
                &format!("/api/threads/{thread}/messages"),
                Some(token),
                Some(json!({"content": content})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .map(|d| serde_json::from_str(d).unwrap())
            .collect()
    }
}

#[tokio::test]
async fn health_reports_connected_database() {
    let h = harness(AuthMode::Password, Arc::new(Echo));
    let (status, body) = h.json("GET", "/api/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "database": "connected"}));
}

#[tokio::test]
async fn api_requires_bearer_token() {
    let h = harness(AuthMode::Password, Arc::new(Echo));
    let (status, body) = h.json("GET", "/api/threads", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH_FAILED");

    let (status, _) = h.json("GET", "/api/threads", Some("not-a-token"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let h = harness(AuthMode::Password, Arc::new(Echo));
    h.login("a@example.com", "right").await;
    let (status, _) = h
        .json(
            "POST",
            "/auth/login",
            None,
            Some(json!({"identifier": "a@example.com", "password": "wrong"})),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_revokes_token() {
    let h = harness(AuthMode::Password, Arc::new(Echo));
    let token = h.login("a@example.com", "pw").await;
    let (status, _) = h.send("POST", "/auth/logout", Some(&token), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = h.json("GET", "/api/threads", Some(&token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn auth_mode_none_runs_as_local_admin() {
    let h = harness(AuthMode::None, Arc::new(Echo));
    let (status, body) = h.json("GET", "/api/threads", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
    let admin = h
        .state
        .users
        .find_by_identifier(&h.state.config.auth.default_admin_email)
        .unwrap()
        .unwrap();
    assert!(admin.role.is_admin());
}

#[tokio::test]
async fn new_thread_starts_with_greeting() {
    let h = harness(AuthMode::Password, Arc::new(Echo));
    let token = h.login("a@example.com", "pw").await;
    let thread = h.new_thread(&token).await;

    let (status, detail) = h.json("GET", &format!("/api/threads/{thread}"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["thread"]["name"], "Budget");
    let steps = detail["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["role"], "assistant");
    assert_eq!(steps[0]["content"], "Hi, ask me anything.");

    let (_, list) = h.json("GET", "/api/threads", Some(&token), None).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn threads_of_other_users_look_missing() {
    let h = harness(AuthMode::Password, Arc::new(Echo));
    let alice = h.login("alice@example.com", "pw").await;
    let bob = h.login("bob@example.com", "pw").await;
    let thread = h.new_thread(&alice).await;

    let (status, _) = h.json("GET", &format!("/api/threads/{thread}"), Some(&bob), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = h
        .json("DELETE", &format!("/api/threads/{thread}"), Some(&bob), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn message_streams_answer_and_persists_steps() {
    let h = harness(AuthMode::Password, Arc::new(Echo));
    let token = h.login("a@example.com", "pw").await;
    let thread = h.new_thread(&token).await;

    let events = h.post_message(&token, &thread, "what is 2+2?").await;
    assert_eq!(events.first().unwrap()["type"], "token");
    assert_eq!(events.first().unwrap()["text"], "echo: what is 2+2?");
    let done = events.last().unwrap();
    assert_eq!(done["type"], "done");
    assert_eq!(done["model"], "echo-1");

    let (_, detail) = h.json("GET", &format!("/api/threads/{thread}"), Some(&token), None).await;
    let steps: Vec<(String, String)> = detail["steps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| {
            (
                s["role"].as_str().unwrap().to_string(),
                s["content"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(
        steps,
        vec![
            ("assistant".to_string(), "Hi, ask me anything.".to_string()),
            ("user".to_string(), "what is 2+2?".to_string()),
            ("assistant".to_string(), "echo: what is 2+2?".to_string()),
        ]
    );

    // the next turn continues the same history
    let events = h.post_message(&token, &thread, "and 3+3?").await;
    assert_eq!(events.first().unwrap()["text"], "echo: and 3+3?");
    let (_, detail) = h.json("GET", &format!("/api/threads/{thread}"), Some(&token), None).await;
    assert_eq!(detail["steps"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn provider_failure_is_streamed_as_error() {
    let h = harness(AuthMode::Password, Arc::new(AlwaysFail));
    let token = h.login("a@example.com", "pw").await;
    let thread = h.new_thread(&token).await;

    let events = h.post_message(&token, &thread, "hello?").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "error");
    assert!(events[0]["message"].as_str().unwrap().contains("upstream down"));

    // the user turn is kept, no assistant turn was written
    let (_, detail) = h.json("GET", &format!("/api/threads/{thread}"), Some(&token), None).await;
    let steps = detail["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[1]["role"], "user");
}

#[tokio::test]
async fn second_turn_while_busy_is_conflict() {
    let h = harness(AuthMode::Password, Arc::new(Echo));
    let token = h.login("a@example.com", "pw").await;
    let thread_id = h.new_thread(&token).await;

    let thread = h.state.threads.get(&thread_id).unwrap().unwrap();
    let live = h
        .state
        .sessions
        .get_or_load(&thread, &h.state.threads, &h.state.config.chat)
        .unwrap();
    let _running = live.ctx.lock().await;

    let (status, body) = h
        .json(
            "POST",
            &format!("/api/threads/{thread_id}/messages"),
            Some(&token),
            Some(json!({"content": "hi"})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "SESSION_BUSY");
}

#[tokio::test]
async fn empty_message_is_bad_request() {
    let h = harness(AuthMode::Password, Arc::new(Echo));
    let token = h.login("a@example.com", "pw").await;
    let thread = h.new_thread(&token).await;
    let (status, _) = h
        .json(
            "POST",
            &format!("/api/threads/{thread}/messages"),
            Some(&token),
            Some(json!({"content": "   "})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stop_without_running_turn() {
    let h = harness(AuthMode::Password, Arc::new(Echo));
    let token = h.login("a@example.com", "pw").await;
    let thread = h.new_thread(&token).await;
    let (status, body) = h
        .json("POST", &format!("/api/threads/{thread}/stop"), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"stopped": false}));
}

#[tokio::test]
async fn feedback_on_own_step() {
    let h = harness(AuthMode::Password, Arc::new(Echo));
    let token = h.login("a@example.com", "pw").await;
    let thread = h.new_thread(&token).await;
    h.post_message(&token, &thread, "hi").await;

    let (_, detail) = h.json("GET", &format!("/api/threads/{thread}"), Some(&token), None).await;
    let answer = detail["steps"].as_array().unwrap().last().unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();

    let uri = format!("/api/steps/{answer}/feedback");
    let (status, body) = h
        .json("POST", &uri, Some(&token), Some(json!({"value": 1, "comment": "nice"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], 1);
    assert_eq!(body["comment"], "nice");

    let (status, _) = h.json("POST", &uri, Some(&token), Some(json!({"value": 5}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let other = h.login("b@example.com", "pw").await;
    let (status, _) = h.json("POST", &uri, Some(&other), Some(json!({"value": -1}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

impl Harness {
    /// Upload `body` as a text file and return the created element.
    async fn upload(&self, token: &str, thread: &str, name: &str, body: &'static str) -> Value {
        let req = Request::builder()
            .method("POST")
            .uri(format!("/api/threads/{thread}/files?name={name}"))
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "text/plain")
            .body(Body::from(body))
            .unwrap();
        let resp = self.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}

#[tokio::test]
async fn uploaded_file_is_stored_and_served() {
    let h = harness(AuthMode::Password, Arc::new(Echo));
    let token = h.login("a@example.com", "pw").await;
    let thread = h.new_thread(&token).await;

    let element = h.upload(&token, &thread, "notes%20v1.txt", "remember the milk").await;
    assert_eq!(element["name"], "notes v1.txt");
    assert_eq!(element["mime"], "text/plain");
    assert_eq!(element["size"], 17);
    let url = element["url"].as_str().unwrap().to_string();
    assert!(url.starts_with(&format!("/files/{thread}/")), "{url}");
    assert!(url.ends_with("/notes_v1.txt"), "{url}");

    let (status, body) = h.send("GET", &url, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"remember the milk");

    let (_, detail) = h.json("GET", &format!("/api/threads/{thread}"), Some(&token), None).await;
    assert_eq!(detail["elements"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn stored_files_are_private_to_the_thread_owner() {
    let h = harness(AuthMode::Password, Arc::new(Echo));
    let owner = h.login("a@example.com", "pw").await;
    let thread = h.new_thread(&owner).await;
    let element = h.upload(&owner, &thread, "secret.txt", "payroll").await;
    let url = element["url"].as_str().unwrap().to_string();

    let (status, _) = h.send("GET", &url, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let stranger = h.login("b@example.com", "pw").await;
    let (status, _) = h.send("GET", &url, Some(&stranger), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn same_file_name_does_not_overwrite() {
    let h = harness(AuthMode::Password, Arc::new(Echo));
    let token = h.login("a@example.com", "pw").await;
    let thread = h.new_thread(&token).await;

    let first = h.upload(&token, &thread, "data.txt", "first").await;
    let second = h.upload(&token, &thread, "data.txt", "second").await;
    assert_ne!(first["url"], second["url"]);

    let (_, body) = h.send("GET", first["url"].as_str().unwrap(), Some(&token), None).await;
    assert_eq!(body, b"first");
    let (_, body) = h.send("GET", second["url"].as_str().unwrap(), Some(&token), None).await;
    assert_eq!(body, b"second");
}

#[tokio::test]
async fn assistant_run_streams_tools_and_usage() {
    let h = assistants_harness(Arc::new(FinishedRuns));
    let token = h.login("a@example.com", "pw").await;
    let thread = h.new_thread(&token).await;

    let events = h.post_message(&token, &thread, "plot it").await;
    let kinds: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["tool_started", "tool_output", "tool_finished", "token", "done"]);
    assert_eq!(events[0]["name"], "code_interpreter");
    assert_eq!(events[1]["input"], "plot(df)");
    assert_eq!(events[2]["is_error"], false);
    let answer = events[3]["text"].as_str().unwrap().to_string();
    assert!(answer.contains(&format!("/files/{thread}/")), "{answer}");
    assert!(!answer.contains("sandbox:"));
    assert_eq!(events[4]["tokens_in"], 40);
    assert_eq!(events[4]["tokens_out"], 12);

    // the live session holds the same rewritten answer the store has
    let (_, detail) = h.json("GET", &format!("/api/threads/{thread}"), Some(&token), None).await;
    let stored = detail["steps"].as_array().unwrap().last().unwrap()["content"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(stored, answer);
    let live = h.state.sessions.get(&thread).unwrap();
    let session = live.ctx.lock().await;
    assert_eq!(session.history.turns().last().unwrap().content, answer);
    assert_eq!(session.provider_thread_id.as_deref(), Some("thread_p"));
}

#[tokio::test]
async fn rename_and_delete_thread() {
    let h = harness(AuthMode::Password, Arc::new(Echo));
    let token = h.login("a@example.com", "pw").await;
    let thread = h.new_thread(&token).await;
    let uri = format!("/api/threads/{thread}");

    let (status, body) = h.json("PATCH", &uri, Some(&token), Some(json!({"name": "Taxes"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Taxes");

    let (status, _) = h.json("PATCH", &uri, Some(&token), Some(json!({"name": " "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h.send("DELETE", &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = h.json("GET", &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
