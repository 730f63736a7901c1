//! Subprocess RPC runtime (C9).
//!
//! Manages a keyed pool of agent subprocesses, one per session file. Each
//! subprocess speaks line-delimited JSON on stdin/stdout; stderr is
//! buffered for diagnostic attachment. Responses and streaming events are
//! routed strictly by caller-assigned `id` (the design note's preferred
//! resolution over the source's partial id-routing, applied uniformly
//! here rather than only for `get_commands`).

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::slash::{self, Classification};

const STDERR_RING_CAPACITY: usize = 8;
const SLASH_ACK_MS: u64 = 1500;
const DISCOVERY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum Outgoing {
    #[serde(rename = "switch_session")]
    SwitchSession {
        #[serde(rename = "sessionFile")]
        session_file: String,
        #[serde(rename = "sessionPath")]
        session_path: String,
        path: String,
    },
    #[serde(rename = "get_state")]
    GetState,
    #[serde(rename = "get_commands")]
    GetCommands { id: String },
    #[serde(rename = "prompt")]
    Prompt {
        id: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        images: Option<Vec<ImagePart>>,
    },
    #[serde(rename = "cancel")]
    Cancel { id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePart {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// Tagged union of JSONL events emitted by the subprocess, per the design
/// note modeling `Record<string, unknown>` as variants with a catch-all.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum Incoming {
    #[serde(rename = "response")]
    Response {
        command: String,
        id: Option<String>,
        success: bool,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        data: Option<Value>,
        #[serde(default)]
        commands: Option<Value>,
    },
    #[serde(rename = "message_end")]
    MessageEnd { message: AssistantMessage },
    #[serde(rename = "agent_end")]
    AgentEnd,
    #[serde(rename = "rpc_error")]
    RpcError { message: String },
    #[serde(rename = "rpc_process_crashed")]
    RpcProcessCrashed { message: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
struct AssistantMessage {
    role: String,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("RPC session busy")]
    Busy,
    #[error("RPC session disposed")]
    Disposed,
    #[error("command inventory unavailable")]
    InventoryUnavailable,
    #[error("command not supported: {0}")]
    NotSupported(String),
    #[error("{message}{stderr}", stderr = format_stderr(.stderr))]
    Protocol { message: String, stderr: Vec<String> },
    #[error("rpc timeout after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_stderr(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!(" (stderr: {})", lines.join(" | "))
    }
}

/// One pending caller awaiting a result keyed by RPC id.
struct PendingPrompt {
    responder: Option<oneshot::Sender<Result<String, RpcError>>>,
    is_slash: bool,
    command_name: String,
    accepted: bool,
    latest_assistant_text: Option<String>,
}

struct Session {
    stdin: Arc<Mutex<ChildStdin>>,
    child: Child,
    stderr_ring: Arc<Mutex<VecDeque<String>>>,
    pending: Arc<Mutex<HashMap<String, PendingPrompt>>>,
    commands: Arc<Mutex<Option<HashMap<String, bool>>>>,
    discovery_inflight: Arc<Mutex<Option<mpsc::Sender<()>>>>,
    busy: Arc<Mutex<bool>>,
}

/// Configuration for spawning agent subprocesses.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub agent_binary: String,
    pub disable_env_var: String,
}

/// Manages one subprocess per session file.
pub struct RpcRuntime {
    config: RpcConfig,
    sessions: Mutex<HashMap<String, Session>>,
    bot_username: String,
}

fn ignorable_stderr(line: &str) -> bool {
    line.to_ascii_lowercase().contains("experimentalwarning")
}

impl RpcRuntime {
    pub fn new(config: RpcConfig, bot_username: String) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            bot_username,
        }
    }

    async fn ensure_session(&self, session_file: &str, session_path: &str, cwd: &str) -> Result<(), RpcError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(session_file) {
            return Ok(());
        }

        let mut child = Command::new(&self.config.agent_binary)
            .arg("--mode")
            .arg("rpc")
            .env(&self.config.disable_env_var, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let pending: Arc<Mutex<HashMap<String, PendingPrompt>>> = Arc::new(Mutex::new(HashMap::new()));
        let commands: Arc<Mutex<Option<HashMap<String, bool>>>> = Arc::new(Mutex::new(None));
        let stderr_ring = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_RING_CAPACITY)));

        spawn_stdout_reader(stdout, pending.clone(), commands.clone());
        spawn_stderr_reader(stderr, stderr_ring.clone());

        let stdin = Arc::new(Mutex::new(stdin));

        write_line(
            &stdin,
            &Outgoing::SwitchSession {
                session_file: session_file.to_string(),
                session_path: session_path.to_string(),
                path: cwd.to_string(),
            },
        )
        .await?;
        write_line(&stdin, &Outgoing::GetState).await?;

        let session = Session {
            stdin,
            child,
            stderr_ring,
            pending,
            commands,
            discovery_inflight: Arc::new(Mutex::new(None)),
            busy: Arc::new(Mutex::new(false)),
        };

        sessions.insert(session_file.to_string(), session);
        Ok(())
    }

    /// Run a prompt against `session_file`. Enforces one in-flight prompt
    /// per session.
    pub async fn run_prompt(
        &self,
        session_file: &str,
        session_path: &str,
        cwd: &str,
        message: &str,
        timeout_ms: u64,
        images: Option<Vec<ImagePart>>,
    ) -> Result<String, RpcError> {
        self.ensure_session(session_file, session_path, cwd).await?;

        let classification = {
            let sessions = self.sessions.lock().await;
            let session = sessions.get(session_file).expect("just ensured");
            let commands_guard = session.commands.lock().await;
            match &*commands_guard {
                Some(index) => slash::classify(message, index, &self.bot_username),
                None if message.starts_with('/') && !message.starts_with("//") => {
                    drop(commands_guard);
                    self.discover_commands(session_file, DISCOVERY_TIMEOUT_MS).await?;
                    let sessions = self.sessions.lock().await;
                    let session = sessions.get(session_file).expect("just ensured");
                    let index_guard = session.commands.lock().await;
                    let index = index_guard.as_ref().ok_or(RpcError::InventoryUnavailable)?;
                    slash::classify(message, index, &self.bot_username)
                }
                None => Classification::NotSlash,
            }
        };

        let command_name = match &classification {
            Classification::Supported { command } => command.clone(),
            Classification::NotSlash => String::new(),
            other => {
                return Err(RpcError::NotSupported(format!("{other:?}")));
            }
        };

        let is_slash = !command_name.is_empty();

        let sessions = self.sessions.lock().await;
        let session = sessions.get(session_file).expect("just ensured");

        {
            let mut busy = session.busy.lock().await;
            if *busy {
                return Err(RpcError::Busy);
            }
            *busy = true;
        }

        let id = uuid::Uuid::now_v7().to_string();
        let (tx, rx) = oneshot::channel();
        session.pending.lock().await.insert(
            id.clone(),
            PendingPrompt {
                responder: Some(tx),
                is_slash,
                command_name,
                accepted: false,
                latest_assistant_text: None,
            },
        );

        let busy_flag = session.busy.clone();
        let pending = session.pending.clone();
        let id_for_timer = id.clone();
        if is_slash {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(SLASH_ACK_MS)).await;
                let mut map = pending.lock().await;
                if let Some(entry) = map.get_mut(&id_for_timer) {
                    if entry.accepted && entry.latest_assistant_text.is_none() {
                        if let Some(tx) = entry.responder.take() {
                            let ack = format!("✅ /{} executed.", entry.command_name);
                            let _ = tx.send(Ok(ack));
                        }
                        map.remove(&id_for_timer);
                    }
                }
            });
        }

        let stdin = session.stdin.clone();
        drop(sessions);

        let outgoing = Outgoing::Prompt {
            id: id.clone(),
            message: message.to_string(),
            images,
        };
        write_line(&stdin, &outgoing).await?;

        let result = if timeout_ms == 0 {
            rx.await.map_err(|_| RpcError::Disposed)?
        } else {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
                Ok(inner) => inner.map_err(|_| RpcError::Disposed)?,
                Err(_) => {
                    let sessions = self.sessions.lock().await;
                    if let Some(session) = sessions.get(session_file) {
                        session.pending.lock().await.remove(&id);
                    }
                    Err(RpcError::Timeout(Duration::from_millis(timeout_ms)))
                }
            }
        };

        *busy_flag.lock().await = false;
        result
    }

    /// Discover the agent's command inventory, sharing an in-flight
    /// request across concurrent callers.
    pub async fn discover_commands(&self, session_file: &str, timeout_ms: u64) -> Result<(), RpcError> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(session_file).ok_or(RpcError::Disposed)?;

        {
            let existing = session.commands.lock().await;
            if existing.is_some() {
                return Ok(());
            }
        }

        let mut inflight = session.discovery_inflight.lock().await;
        if inflight.is_none() {
            let (tx, _rx) = mpsc::channel(1);
            *inflight = Some(tx);
            drop(inflight);

            let id = uuid::Uuid::now_v7().to_string();
            let (resp_tx, resp_rx) = oneshot::channel();
            session.pending.lock().await.insert(
                id.clone(),
                PendingPrompt {
                    responder: Some(resp_tx),
                    is_slash: false,
                    command_name: "get_commands".to_string(),
                    accepted: false,
                    latest_assistant_text: None,
                },
            );

            write_line(&session.stdin, &Outgoing::GetCommands { id: id.clone() }).await?;

            let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), resp_rx).await;
            *session.discovery_inflight.lock().await = None;

            match outcome {
                Ok(Ok(Ok(_))) => Ok(()),
                _ => {
                    session.pending.lock().await.remove(&id);
                    Err(RpcError::InventoryUnavailable)
                }
            }
        } else {
            Ok(())
        }
    }

    /// Request cancellation of the in-flight prompt for `session_file`.
    ///
    /// Sends a `cancel` command for every pending prompt id, then tears the
    /// subprocess down: the protocol carries no cancel acknowledgement, so
    /// there's no reliable signal the subprocess actually stopped working
    /// the prompt short of killing it. The session is removed from the
    /// pool; a later `run_prompt` against the same `session_file` respawns
    /// a fresh subprocess via `ensure_session`.
    pub async fn cancel_session(&self, session_file: &str, reason: &str) {
        let mut sessions = self.sessions.lock().await;
        let Some(mut session) = sessions.remove(session_file) else {
            return;
        };
        drop(sessions);

        let pending_ids: Vec<String> = {
            let mut pending = session.pending.lock().await;
            let ids: Vec<String> = pending.keys().cloned().collect();
            for (_, entry) in pending.drain() {
                if let Some(tx) = entry.responder {
                    let _ = tx.send(Err(RpcError::Protocol {
                        message: reason.to_string(),
                        stderr: Vec::new(),
                    }));
                }
            }
            ids
        };

        for id in pending_ids {
            let _ = write_line(&session.stdin, &Outgoing::Cancel { id }).await;
        }

        let _ = session.child.start_kill();
    }

    /// SIGTERM every subprocess, rejecting any pending prompt.
    pub async fn dispose(&self) {
        let mut sessions = self.sessions.lock().await;
        for (_, mut session) in sessions.drain() {
            let mut pending = session.pending.lock().await;
            for (_, entry) in pending.drain() {
                if let Some(tx) = entry.responder {
                    let _ = tx.send(Err(RpcError::Disposed));
                }
            }
            drop(pending);
            let _ = session.child.start_kill();
        }
    }
}

async fn write_line(stdin: &Arc<Mutex<ChildStdin>>, message: &Outgoing) -> Result<(), RpcError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    let mut guard = stdin.lock().await;
    guard.write_all(line.as_bytes()).await?;
    guard.flush().await?;
    Ok(())
}

fn spawn_stdout_reader(
    stdout: tokio::process::ChildStdout,
    pending: Arc<Mutex<HashMap<String, PendingPrompt>>>,
    commands: Arc<Mutex<Option<HashMap<String, bool>>>>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(event) = serde_json::from_str::<Incoming>(&line) else {
                continue;
            };
            handle_event(event, &pending, &commands).await;
        }
    });
}

async fn handle_event(
    event: Incoming,
    pending: &Arc<Mutex<HashMap<String, PendingPrompt>>>,
    commands: &Arc<Mutex<Option<HashMap<String, bool>>>>,
) {
    match event {
        Incoming::Response { command, id, success, error, data, commands: cmds_field } => {
            let Some(id) = id else { return };
            if command == "get_commands" {
                if success {
                    let raw = data.or(cmds_field).unwrap_or(Value::Null);
                    let parsed = parse_command_index(&raw);
                    *commands.lock().await = Some(parsed);
                }
                let mut map = pending.lock().await;
                if let Some(mut entry) = map.remove(&id) {
                    if let Some(tx) = entry.responder.take() {
                        let _ = tx.send(Ok(String::new()));
                    }
                }
                return;
            }

            // command == "prompt"
            let mut map = pending.lock().await;
            if let Some(entry) = map.get_mut(&id) {
                if success {
                    entry.accepted = true;
                } else if let Some(tx) = entry.responder.take() {
                    let message = error.unwrap_or_else(|| "prompt rejected".to_string());
                    let prefixed = if entry.is_slash {
                        format!("slash command failed: {message}")
                    } else {
                        message
                    };
                    let _ = tx.send(Err(RpcError::Protocol { message: prefixed, stderr: Vec::new() }));
                    map.remove(&id);
                }
            }
        }
        Incoming::MessageEnd { message } => {
            if message.role != "assistant" {
                return;
            }
            let text: String = message
                .content
                .iter()
                .filter_map(|c| c.text.as_deref())
                .collect::<Vec<_>>()
                .join("");

            let mut map = pending.lock().await;
            for entry in map.values_mut() {
                if entry.responder.is_some() {
                    entry.latest_assistant_text = Some(text.clone());
                }
            }
        }
        Incoming::AgentEnd => {
            let mut map = pending.lock().await;
            let ids: Vec<String> = map.keys().cloned().collect();
            for id in ids {
                if let Some(mut entry) = map.remove(&id) {
                    if let Some(tx) = entry.responder.take() {
                        let text = entry.latest_assistant_text.clone().unwrap_or_else(|| {
                            format!("✅ /{} executed.", entry.command_name)
                        });
                        let _ = tx.send(Ok(text));
                    }
                }
            }
        }
        Incoming::RpcError { message } | Incoming::RpcProcessCrashed { message } => {
            let mut map = pending.lock().await;
            for (_, mut entry) in map.drain() {
                if let Some(tx) = entry.responder.take() {
                    let _ = tx.send(Err(RpcError::Protocol { message: message.clone(), stderr: Vec::new() }));
                }
            }
        }
        Incoming::Unknown => {}
    }
}

fn parse_command_index(value: &Value) -> HashMap<String, bool> {
    let mut index = HashMap::new();
    if let Some(entries) = value.as_array() {
        for entry in entries {
            if let Some(name) = entry.get("name").and_then(Value::as_str) {
                let interactive = entry
                    .get("interactiveOnly")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                index.insert(name.to_string(), interactive);
            }
        }
    }
    index
}

fn spawn_stderr_reader(stderr: tokio::process::ChildStderr, ring: Arc<Mutex<VecDeque<String>>>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if ignorable_stderr(&line) {
                continue;
            }
            let mut buf = ring.lock().await;
            if buf.len() == STDERR_RING_CAPACITY {
                buf.pop_front();
            }
            buf.push_back(line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignorable_stderr_matches_experimental_warning() {
        assert!(ignorable_stderr("(node:123) ExperimentalWarning: foo"));
        assert!(!ignorable_stderr("real error: connection refused"));
    }

    #[test]
    fn parse_command_index_reads_name_and_flag() {
        let value = serde_json::json!([
            {"name": "status", "interactiveOnly": true},
            {"name": "plan", "interactiveOnly": false},
        ]);
        let index = parse_command_index(&value);
        assert_eq!(index.get("status"), Some(&true));
        assert_eq!(index.get("plan"), Some(&false));
    }

    #[test]
    fn format_stderr_empty_vs_nonempty() {
        assert_eq!(format_stderr(&[]), "");
        assert_eq!(format_stderr(&["a".into(), "b".into()]), " (stderr: a | b)");
    }
}
