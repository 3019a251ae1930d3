use async_trait::async_trait;
use kaiwa_core::config::{AssistantConfig, ProviderConfig, TEXT_MIME_TYPES};
use reqwest::multipart;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{
    Annotation, AssistantMessage, AssistantSpec, AssistantsApi, AssistantsError, Attachment,
    RunHandle, RunSnapshot, RunStatus, RunToolCall, RunUsage,
};
use crate::provider::{check_status, ProviderError};

const PROVIDER: &str = "assistants";

/// HTTP client for the OpenAI / Azure OpenAI assistants API (v2).
pub struct AssistantsClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    api_version: Option<String>,
}

impl AssistantsClient {
    pub fn from_config(cfg: &ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(cfg.request_timeout_secs))
                .build()
                .unwrap_or_default(),
            api_key: cfg.api_key.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_version: cfg.api_version.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        match self.api_version {
            Some(_) => format!("{}/openai{}", self.base_url, path),
            None => format!("{}/v1{}", self.base_url, path),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, self.url(path))
            .header("OpenAI-Beta", "assistants=v2");
        match &self.api_version {
            Some(version) => builder
                .query(&[("api-version", version.as_str())])
                .header("api-key", &self.api_key),
            None => builder.bearer_auth(&self.api_key),
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, ProviderError> {
        let resp = check_status(builder.send().await?, PROVIDER).await?;
        resp.json().await.map_err(|e| ProviderError::Parse(e.to_string()))
    }
}

/// Tools enabled for an attached file: always the code interpreter, plus
/// file search for text documents.
fn attachment_tools(mime: &str) -> Vec<serde_json::Value> {
    let mut tools = vec![json!({"type": "code_interpreter"})];
    if TEXT_MIME_TYPES.contains(&mime) {
        tools.push(json!({"type": "file_search"}));
    }
    tools
}

#[async_trait]
impl AssistantsApi for AssistantsClient {
    async fn create_thread(&self) -> Result<String, ProviderError> {
        let obj: IdObject = self
            .send_json(self.request(reqwest::Method::POST, "/threads").json(&json!({})))
            .await?;
        debug!(thread = %obj.id, "provider thread created");
        Ok(obj.id)
    }

    async fn add_message(
        &self,
        thread_id: &str,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<(), ProviderError> {
        let mut body = json!({ "role": "user", "content": content });
        if !attachments.is_empty() {
            body["attachments"] = attachments
                .iter()
                .map(|a| json!({ "file_id": a.file_id, "tools": attachment_tools(&a.mime) }))
                .collect();
        }
        let path = format!("/threads/{thread_id}/messages");
        let _: IdObject = self
            .send_json(self.request(reqwest::Method::POST, &path).json(&body))
            .await?;
        Ok(())
    }

    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunHandle, ProviderError> {
        let path = format!("/threads/{thread_id}/runs");
        let run: RunObject = self
            .send_json(
                self.request(reqwest::Method::POST, &path)
                    .json(&json!({ "assistant_id": assistant_id })),
            )
            .await?;
        Ok(RunHandle {
            thread_id: thread_id.to_string(),
            run_id: run.id,
            status: run.status,
            usage: None,
        })
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<RunSnapshot, ProviderError> {
        let path = format!("/threads/{thread_id}/runs/{run_id}");
        let run: RunObject = self.send_json(self.request(reqwest::Method::GET, &path)).await?;
        Ok(RunSnapshot {
            status: run.status,
            last_error: run.last_error.map(|e| e.message),
            usage: run.usage,
        })
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), ProviderError> {
        let path = format!("/threads/{thread_id}/runs/{run_id}/cancel");
        let _: RunObject = self.send_json(self.request(reqwest::Method::POST, &path)).await?;
        Ok(())
    }

    async fn list_run_tool_calls(&self, thread_id: &str, run_id: &str) -> Result<Vec<RunToolCall>, ProviderError> {
        let path = format!("/threads/{thread_id}/runs/{run_id}/steps");
        let list: StepList = self
            .send_json(
                self.request(reqwest::Method::GET, &path)
                    .query(&[("order", "asc"), ("limit", "100")]),
            )
            .await?;
        Ok(list.tool_calls())
    }

    async fn latest_assistant_message(
        &self,
        thread_id: &str,
    ) -> Result<Option<AssistantMessage>, ProviderError> {
        let path = format!("/threads/{thread_id}/messages");
        let list: MessageList = self
            .send_json(
                self.request(reqwest::Method::GET, &path)
                    .query(&[("order", "desc"), ("limit", "20")]),
            )
            .await?;
        Ok(list.latest_assistant())
    }

    async fn upload_file(&self, name: &str, bytes: Vec<u8>, mime: &str) -> Result<String, ProviderError> {
        let part = multipart::Part::bytes(bytes)
            .file_name(name.to_string())
            .mime_str(mime)?;
        let form = multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);
        let obj: IdObject = self
            .send_json(self.request(reqwest::Method::POST, "/files").multipart(form))
            .await?;
        info!(file = %obj.id, name, "file uploaded to provider");
        Ok(obj.id)
    }

    async fn file_content(&self, file_id: &str) -> Result<Vec<u8>, ProviderError> {
        let path = format!("/files/{file_id}/content");
        let resp = check_status(self.request(reqwest::Method::GET, &path).send().await?, PROVIDER).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<String, ProviderError> {
        let mut body = json!({
            "model": spec.model,
            "name": spec.name,
            "instructions": spec.instructions,
            "temperature": spec.temperature,
            "tools": [{"type": "code_interpreter"}, {"type": "file_search"}],
        });
        if !spec.file_ids.is_empty() {
            body["tool_resources"] = json!({ "code_interpreter": { "file_ids": spec.file_ids } });
        }
        let obj: IdObject = self
            .send_json(self.request(reqwest::Method::POST, "/assistants").json(&body))
            .await?;
        info!(assistant = %obj.id, name = %spec.name, "assistant created");
        Ok(obj.id)
    }

    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<Option<String>, ProviderError> {
        let path = format!("/assistants/{assistant_id}");
        let resp = self.request(reqwest::Method::GET, &path).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let obj: IdObject = check_status(resp, PROVIDER)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(Some(obj.id))
    }
}

/// Reuse the configured assistant, or create one (uploading the seed file
/// first when configured). Returns the assistant id.
pub async fn ensure_assistant(
    api: &dyn AssistantsApi,
    cfg: &AssistantConfig,
    model: &str,
) -> Result<String, AssistantsError> {
    if let Some(id) = &cfg.assistant_id {
        match api.retrieve_assistant(id).await? {
            Some(found) => {
                debug!(assistant = %found, "using configured assistant");
                return Ok(found);
            }
            None => warn!(assistant = %id, "configured assistant not found, creating a new one"),
        }
    }

    let mut file_ids = Vec::new();
    if let Some(path) = &cfg.seed_file {
        let bytes = tokio::fs::read(path).await?;
        let name = std::path::Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "seed".to_string());
        file_ids.push(api.upload_file(&name, bytes, "application/octet-stream").await?);
    }

    let spec = AssistantSpec {
        name: cfg.name.clone(),
        instructions: cfg.instructions.clone(),
        model: model.to_string(),
        temperature: cfg.temperature,
        file_ids,
    };
    Ok(api.create_assistant(&spec).await?)
}

// ---- wire types ----

#[derive(Deserialize)]
struct IdObject {
    id: String,
}

#[derive(Deserialize)]
struct RunObject {
    id: String,
    status: RunStatus,
    #[serde(default)]
    last_error: Option<RunErrorObject>,
    #[serde(default)]
    usage: Option<RunUsage>,
}

#[derive(Deserialize)]
struct RunErrorObject {
    message: String,
}

#[derive(Deserialize)]
struct MessageList {
    data: Vec<MessageObject>,
}

#[derive(Deserialize)]
struct MessageObject {
    id: String,
    role: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: TextBlock },
    ImageFile { image_file: FileRef },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct TextBlock {
    value: String,
    #[serde(default)]
    annotations: Vec<AnnotationObject>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnnotationObject {
    FilePath { text: String, file_path: FileRef },
    FileCitation { text: String, file_citation: FileRef },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct FileRef {
    file_id: String,
}

#[derive(Deserialize)]
struct StepList {
    data: Vec<StepObject>,
}

#[derive(Deserialize)]
struct StepObject {
    status: String,
    step_details: StepDetails,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StepDetails {
    ToolCalls { tool_calls: Vec<StepToolCall> },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StepToolCall {
    CodeInterpreter {
        id: String,
        code_interpreter: CodeInterpreterCall,
    },
    FileSearch {
        id: String,
    },
    Function {
        id: String,
        function: FunctionCall,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct CodeInterpreterCall {
    #[serde(default)]
    input: String,
    #[serde(default)]
    outputs: Vec<InterpreterOutput>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InterpreterOutput {
    Logs { logs: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
    output: Option<String>,
}

impl StepList {
    fn tool_calls(self) -> Vec<RunToolCall> {
        let mut calls = Vec::new();
        for step in self.data {
            let failed = step.status == "failed";
            let StepDetails::ToolCalls { tool_calls } = step.step_details else {
                continue;
            };
            calls.extend(tool_calls.into_iter().filter_map(|call| match call {
                StepToolCall::CodeInterpreter { id, code_interpreter } => {
                    let logs: Vec<String> = code_interpreter
                        .outputs
                        .into_iter()
                        .filter_map(|o| match o {
                            InterpreterOutput::Logs { logs } => Some(logs),
                            InterpreterOutput::Other => None,
                        })
                        .collect();
                    Some(RunToolCall {
                        id,
                        name: "code_interpreter".to_string(),
                        input: Some(code_interpreter.input).filter(|i| !i.is_empty()),
                        output: (!logs.is_empty()).then(|| logs.join("")),
                        failed,
                    })
                }
                StepToolCall::FileSearch { id } => Some(RunToolCall {
                    id,
                    name: "file_search".to_string(),
                    failed,
                    ..Default::default()
                }),
                StepToolCall::Function { id, function } => Some(RunToolCall {
                    id,
                    name: function.name,
                    input: Some(function.arguments),
                    output: function.output,
                    failed,
                }),
                StepToolCall::Other => None,
            }));
        }
        calls
    }
}

impl MessageList {
    /// The list is requested newest first.
    fn latest_assistant(self) -> Option<AssistantMessage> {
        let msg = self.data.into_iter().find(|m| m.role == "assistant")?;
        let mut out = AssistantMessage {
            id: msg.id,
            ..Default::default()
        };
        for block in msg.content {
            match block {
                ContentBlock::Text { text } => {
                    if !out.text.is_empty() {
                        out.text.push('\n');
                    }
                    out.text.push_str(&text.value);
                    out.annotations.extend(text.annotations.into_iter().filter_map(|a| match a {
                        AnnotationObject::FilePath { text, file_path } => Some(Annotation::FilePath {
                            text,
                            file_id: file_path.file_id,
                        }),
                        AnnotationObject::FileCitation {
                            text,
                            file_citation,
                        } => Some(Annotation::FileCitation {
                            text,
                            file_id: file_citation.file_id,
                        }),
                        AnnotationObject::Other => None,
                    }));
                }
                ContentBlock::ImageFile { image_file } => out.image_file_ids.push(image_file.file_id),
                ContentBlock::Other => {}
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_follow_provider_flavour() {
        let openai = AssistantsClient::from_config(&ProviderConfig::default());
        assert_eq!(openai.url("/threads"), "https://api.openai.com/v1/threads");

        let azure = AssistantsClient::from_config(&ProviderConfig {
            base_url: "https://acme.openai.azure.com/".into(),
            api_version: Some("2024-05-01-preview".into()),
            ..Default::default()
        });
        assert_eq!(
            azure.url("/threads/t/runs"),
            "https://acme.openai.azure.com/openai/threads/t/runs"
        );
    }

    #[test]
    fn text_files_get_file_search() {
        assert_eq!(attachment_tools("text/plain").len(), 2);
        assert_eq!(attachment_tools("image/png"), vec![json!({"type": "code_interpreter"})]);
    }

    #[test]
    fn latest_assistant_message_is_parsed() {
        let raw = json!({
            "data": [
                {
                    "id": "msg_2",
                    "role": "assistant",
                    "content": [
                        {"type": "image_file", "image_file": {"file_id": "file-img"}},
                        {"type": "text", "text": {
                            "value": "See sandbox:/mnt/data/out.csv",
                            "annotations": [
                                {"type": "file_path", "text": "sandbox:/mnt/data/out.csv",
                                 "file_path": {"file_id": "file-csv"},
                                 "start_index": 4, "end_index": 29}
                            ]
                        }}
                    ]
                },
                {"id": "msg_1", "role": "user", "content": [{"type": "text", "text": {"value": "hi"}}]}
            ]
        });
        let list: MessageList = serde_json::from_value(raw).unwrap();
        let msg = list.latest_assistant().unwrap();
        assert_eq!(msg.id, "msg_2");
        assert_eq!(msg.text, "See sandbox:/mnt/data/out.csv");
        assert_eq!(msg.image_file_ids, vec!["file-img"]);
        assert_eq!(
            msg.annotations,
            vec![Annotation::FilePath {
                text: "sandbox:/mnt/data/out.csv".into(),
                file_id: "file-csv".into()
            }]
        );
    }

    #[test]
    fn no_assistant_message_yet() {
        let list: MessageList =
            serde_json::from_value(json!({"data": [{"id": "m", "role": "user", "content": []}]})).unwrap();
        assert!(list.latest_assistant().is_none());
    }

    #[test]
    fn run_status_and_error_parse() {
        let run: RunObject = serde_json::from_value(json!({
            "id": "run_1",
            "status": "failed",
            "last_error": {"code": "server_error", "message": "boom"}
        }))
        .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.last_error.unwrap().message, "boom");
    }

    #[test]
    fn run_steps_yield_tool_calls_in_order() {
        let raw = json!({
            "data": [
                {"id": "step_1", "status": "completed", "step_details": {
                    "type": "tool_calls",
                    "tool_calls": [
                        {"id": "ci_1", "type": "code_interpreter", "code_interpreter": {
                            "input": "df.describe()",
                            "outputs": [
                                {"type": "logs", "logs": "count 10\n"},
                                {"type": "image", "image": {"file_id": "file-img"}}
                            ]
                        }},
                        {"id": "fs_1", "type": "file_search", "file_search": {}}
                    ]
                }},
                {"id": "step_2", "status": "completed", "step_details": {
                    "type": "message_creation", "message_creation": {"message_id": "msg_1"}
                }},
                {"id": "step_3", "status": "failed", "step_details": {
                    "type": "tool_calls",
                    "tool_calls": [
                        {"id": "fn_1", "type": "function", "function": {
                            "name": "lookup", "arguments": "{}", "output": null
                        }}
                    ]
                }}
            ]
        });
        let list: StepList = serde_json::from_value(raw).unwrap();
        let calls = list.tool_calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].name, "code_interpreter");
        assert_eq!(calls[0].input.as_deref(), Some("df.describe()"));
        assert_eq!(calls[0].output.as_deref(), Some("count 10\n"));
        assert_eq!(calls[1].name, "file_search");
        assert!(calls[1].input.is_none());
        assert_eq!(calls[2].name, "lookup");
        assert!(calls[2].failed);
        assert!(!calls[0].failed);
    }

    #[test]
    fn run_usage_is_parsed_when_present() {
        let run: RunObject = serde_json::from_value(json!({
            "id": "run_1",
            "status": "completed",
            "usage": {"prompt_tokens": 120, "completion_tokens": 30, "total_tokens": 150}
        }))
        .unwrap();
        assert_eq!(
            run.usage,
            Some(RunUsage {
                prompt_tokens: 120,
                completion_tokens: 30
            })
        );

        let pending: RunObject =
            serde_json::from_value(json!({"id": "run_2", "status": "queued", "usage": null})).unwrap();
        assert!(pending.usage.is_none());
    }
}
