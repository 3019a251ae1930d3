//! Stdio transport: a child process speaking newline-delimited JSON-RPC.
//!
//! A writer task owns stdin and a reader task owns stdout. Requests hand a
//! whole line to the writer and wait on a oneshot keyed by request id, so a
//! caller dropped mid-request can never leave half a line on the pipe.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kaiwa_core::config::McpServerConfig;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use super::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Non-JSON stdout lines tolerated before the server is declared broken.
const MAX_SKIP_LINES: usize = 1000;

type Pending = DashMap<u64, oneshot::Sender<JsonRpcResponse>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MCP server process has exited")]
    ProcessExited,

    #[error("timeout waiting for response")]
    Timeout,
}

pub struct StdioTransport {
    outbox: std::sync::Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Arc<Pending>,
    child: Mutex<Child>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    timeout: Duration,
}

impl StdioTransport {
    pub fn spawn(config: &McpServerConfig, timeout: Duration) -> Result<Self, TransportError> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let broken = |what: &str| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("failed to capture child {what}"),
            ))
        };
        let stdin = child.stdin.take().ok_or_else(|| broken("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| broken("stdout"))?;

        let alive = Arc::new(AtomicBool::new(true));
        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let (outbox, lines) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(stdin, lines, Arc::clone(&alive)));
        tokio::spawn(read_loop(
            BufReader::new(stdout),
            Arc::clone(&pending),
            Arc::clone(&alive),
        ));

        Ok(Self {
            outbox: std::sync::Mutex::new(Some(outbox)),
            pending,
            child: Mutex::new(child),
            next_id: AtomicU64::new(1),
            alive,
            timeout,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn send_line(&self, line: String) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::ProcessExited);
        }
        let outbox = self.outbox.lock().unwrap();
        match outbox.as_ref() {
            Some(tx) => tx.send(line).map_err(|_| TransportError::ProcessExited),
            None => Err(TransportError::ProcessExited),
        }
    }

    /// Send a request and wait for the response with the same id.
    ///
    /// Only the wait is bounded by the timeout; the line itself is always
    /// written whole.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let json = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        // the reader may have died between the alive check and the insert
        if let Err(e) = self.send_line(json) {
            self.pending.remove(&id);
            return Err(e);
        }
        if !self.is_alive() {
            self.pending.remove(&id);
            return Err(TransportError::ProcessExited);
        }
        debug!(id, method, "sent MCP request");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(TransportError::ProcessExited),
            Err(_) => {
                self.pending.remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    pub async fn notify(&self, method: &str) -> Result<(), TransportError> {
        let json = serde_json::to_string(&JsonRpcNotification::new(method))?;
        self.send_line(json)
    }

    /// Close stdin and give the process a few seconds before killing it.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        // dropping the sender ends the writer, which closes stdin
        self.outbox.lock().unwrap().take();
        let mut child = self.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "MCP server exited"),
            Ok(Err(e)) => warn!(error = %e, "error waiting for MCP server"),
            Err(_) => {
                warn!("MCP server did not exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }
}

async fn write_loop(
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
    alive: Arc<AtomicBool>,
) {
    while let Some(line) = lines.recv().await {
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            warn!(error = %e, "writing to MCP server failed");
            alive.store(false, Ordering::SeqCst);
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

/// Route each response to the request waiting for its id. Lines that are
/// not JSON objects and messages without a matching id are skipped.
async fn read_loop(mut stdout: BufReader<ChildStdout>, pending: Arc<Pending>, alive: Arc<AtomicBool>) {
    let mut skipped = 0usize;
    let mut line = String::new();
    loop {
        line.clear();
        match stdout.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "reading from MCP server failed");
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !trimmed.starts_with('{') {
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                warn!("MCP server produced too many non-JSON lines on stdout");
                break;
            }
            debug!(line = %trimmed, "skipping non-JSON line from MCP server");
            continue;
        }
        // server notifications carry no id and fail to parse here
        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
            Ok(resp) => match pending.remove(&resp.id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(resp);
                }
                None => debug!(id = resp.id, "response for an abandoned request"),
            },
            Err(_) => debug!("skipping MCP message that is not a response"),
        }
    }
    alive.store(false, Ordering::SeqCst);
    // dropping the senders wakes every waiter with ProcessExited
    pending.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A stand-in server: `sh -c <script>`.
    fn script(body: &str) -> McpServerConfig {
        McpServerConfig {
            id: "test".into(),
            command: "sh".into(),
            args: vec!["-c".into(), body.into()],
            env: Default::default(),
        }
    }

    #[tokio::test]
    async fn response_is_matched_by_id_past_noise() {
        let t = StdioTransport::spawn(
            &script(
                r#"read line
echo 'server starting'
echo '{"jsonrpc":"2.0","method":"notifications/progress"}'
echo '{"jsonrpc":"2.0","id":99,"result":{"stale":true}}'
echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'
sleep 2"#,
            ),
            Duration::from_secs(5),
        )
        .unwrap();

        let resp = t.request("ping", None).await.unwrap();
        assert_eq!(resp.id, 1);
        assert_eq!(resp.into_result().unwrap(), serde_json::json!({"ok": true}));
        t.shutdown().await;
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let t = StdioTransport::spawn(&script("read line; sleep 5"), Duration::from_millis(100)).unwrap();
        let err = t.request("ping", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        assert!(t.pending.is_empty());
        t.shutdown().await;
    }

    #[tokio::test]
    async fn exited_server_fails_pending_and_later_requests() {
        let t = StdioTransport::spawn(&script("read line; exit 0"), Duration::from_secs(5)).unwrap();
        let err = t.request("ping", None).await.unwrap_err();
        assert!(matches!(err, TransportError::ProcessExited));
        assert!(!t.is_alive());

        let err = t.request("ping", None).await.unwrap_err();
        assert!(matches!(err, TransportError::ProcessExited));
    }

    #[tokio::test]
    async fn abandoned_request_does_not_corrupt_the_next_one() {
        // answers the second request only; the first stays unanswered
        let t = StdioTransport::spawn(
            &script(
                r#"read first
read second
echo '{"jsonrpc":"2.0","id":2,"result":"second"}'
sleep 2"#,
            ),
            Duration::from_secs(5),
        )
        .unwrap();

        let first = tokio::time::timeout(Duration::from_millis(50), t.request("slow", None)).await;
        assert!(first.is_err());

        let resp = t.request("fast", None).await.unwrap();
        assert_eq!(resp.into_result().unwrap(), serde_json::json!("second"));
        t.shutdown().await;
    }
}
