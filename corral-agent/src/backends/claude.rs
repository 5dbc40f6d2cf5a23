// ABOUTME: Claude backend - spawns claude with --print --output-format stream-json per turn.
// ABOUTME: Parses streaming JSONL from stdout into AgentMessages; one CLI process per turn.

use crate::config::{McpServerConfig, QueryOptions, SessionConfig, ToolAllowList};
use crate::mailbox::Mailbox;
use crate::message::{AgentMessage, ResultSubtype, SystemSubtype, Usage};
use crate::multi_turn::sequential_turns;
use crate::session::Session;
use crate::traits::AgentBackend;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as ProcessCommand;
use tokio_util::sync::CancellationToken;

const STDERR_TAIL_LINES: usize = 20;
const STDERR_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Configuration for the Claude backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeConfig {
    /// Path to the claude binary
    pub binary: String,
    /// Extra CLI arguments appended to every invocation
    #[serde(default)]
    pub extra_args: Vec<String>,
}

pub struct ClaudeBackend {
    config: ClaudeConfig,
    /// Cancellation handles of in-flight turns, keyed by session id
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl ClaudeBackend {
    pub fn new(config: ClaudeConfig) -> Self {
        Self {
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    fn track(&self, session_id: &str, token: &CancellationToken) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.to_string(), token.clone());
    }

    fn untrack(&self, session_id: Option<&str>) {
        if let Some(id) = session_id {
            self.running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(id);
        }
    }
}

impl AgentBackend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn create_session<'a>(&'a self, config: SessionConfig) -> BoxFuture<'a, Result<Session>> {
        // The CLI assigns the id; it arrives with the first system/init
        Box::pin(async move { Ok(Session::new(config)) })
    }

    fn resume_session<'a>(
        &'a self,
        config: SessionConfig,
        session_id: &'a str,
        resume_at: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Session>> {
        Box::pin(async move {
            let mut session = Session::with_id(config, session_id);
            session.resume_at = resume_at.map(str::to_string);
            Ok(session)
        })
    }

    fn run_query<'a>(
        &'a self,
        session: &'a mut Session,
        prompt: &'a str,
        options: QueryOptions,
    ) -> BoxStream<'a, AgentMessage> {
        Box::pin(async_stream::stream! {
            let turn = session.begin_turn();
            let cancel = options.abort.child_token();
            if let Some(id) = session.id.as_deref() {
                self.track(id, &cancel);
            }

            let args = build_args(&self.config, session);
            tracing::debug!(?args, turn, "Spawning Claude CLI");

            let mut child = match ProcessCommand::new(&self.config.binary)
                .args(&args)
                .current_dir(&session.config.working_dir)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true)
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!(error = %e, binary = %self.config.binary, "Failed to spawn Claude CLI");
                    self.untrack(session.id.as_deref());
                    yield AgentMessage::failure(
                        ResultSubtype::Error,
                        format!("failed to spawn {}: {}", self.config.binary, e),
                    );
                    return;
                }
            };

            // Prompt goes over stdin so leading dashes are never read as flags
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    tracing::warn!(error = %e, "Failed to write prompt to Claude CLI");
                }
                drop(stdin);
            }

            let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
            let stderr_handle = child.stderr.take().map(|stderr| {
                let tail = stderr_tail.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if line.is_empty() {
                            continue;
                        }
                        tracing::warn!(stderr = %line, "Claude CLI stderr");
                        let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                })
            });

            let Some(stdout) = child.stdout.take() else {
                self.untrack(session.id.as_deref());
                yield AgentMessage::failure(ResultSubtype::Error, "failed to capture Claude CLI stdout");
                return;
            };
            let mut lines = BufReader::new(stdout).lines();
            let mut parser = ClaudeStreamParser::new();
            let deadline = options.turn_timeout.map(|t| tokio::time::Instant::now() + t);
            let mut finished = false;

            while !finished {
                let step = tokio::select! {
                    line = lines.next_line() => TurnStep::Line(line),
                    _ = cancel.cancelled() => TurnStep::Cancelled,
                    _ = sleep_until_opt(deadline) => TurnStep::TimedOut,
                };

                let line = match step {
                    TurnStep::Line(line) => line,
                    TurnStep::Cancelled => {
                        tracing::info!(turn, "Claude turn cancelled");
                        let _ = child.start_kill();
                        yield AgentMessage::failure(ResultSubtype::Abort, "query cancelled");
                        finished = true;
                        continue;
                    }
                    TurnStep::TimedOut => {
                        tracing::warn!(turn, "Claude turn timed out");
                        let _ = child.start_kill();
                        let secs = options.turn_timeout.map(|t| t.as_secs()).unwrap_or_default();
                        yield AgentMessage::failure(
                            ResultSubtype::Timeout,
                            format!("no result within {secs}s"),
                        );
                        finished = true;
                        continue;
                    }
                };

                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed reading Claude CLI stdout");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(json) = serde_json::from_str::<Value>(&line) else {
                    tracing::debug!(line = %line, "Skipping non-JSON Claude output");
                    continue;
                };

                for message in parser.parse(&json) {
                    match message {
                        AgentMessage::System { subtype: SystemSubtype::Init, session_id: Some(ref id), .. } => {
                            if session.id.as_deref() != Some(id.as_str()) {
                                self.untrack(session.id.as_deref());
                                session.id = Some(id.clone());
                                self.track(id, &cancel);
                            }
                            // A resume point only applies to the turn that forked
                            session.resume_at = None;
                            if session.claim_init() {
                                yield message;
                            }
                        }
                        AgentMessage::Result { .. } => {
                            finished = true;
                            yield message;
                        }
                        other => yield other,
                    }
                }
            }

            let status = child.wait().await;
            if let Some(handle) = stderr_handle {
                // Grandchildren may hold the pipe open after the CLI is killed
                match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, handle).await {
                    Ok(Err(e)) => tracing::warn!(error = %e, "stderr reader task failed to complete"),
                    Err(_) => tracing::debug!("stderr still open after Claude CLI exit"),
                    Ok(Ok(())) => {}
                }
            }
            self.untrack(session.id.as_deref());

            if !finished {
                let code = status.ok().and_then(|s| s.code());
                let tail: Vec<String> = stderr_tail
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .iter()
                    .cloned()
                    .collect();
                let mut detail = format!("claude exited with status {code:?} before finishing the turn");
                if !tail.is_empty() {
                    detail.push_str(": ");
                    detail.push_str(&tail.join("\n"));
                }
                yield AgentMessage::failure(ResultSubtype::Error, detail);
            }
        })
    }

    fn run_multi_turn_query<'a>(
        &'a self,
        session: &'a mut Session,
        initial_prompt: &'a str,
        mailbox: &'a Mailbox,
        options: QueryOptions,
    ) -> BoxStream<'a, AgentMessage> {
        sequential_turns(self, session, initial_prompt, mailbox, options)
    }

    fn abort_session<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let token = session.id.as_deref().and_then(|id| {
                self.running
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(id)
            });
            match token {
                Some(token) => token.cancel(),
                None => tracing::debug!(session_id = ?session.id, "No running Claude turn to abort"),
            }
        })
    }
}

enum TurnStep {
    Line(std::io::Result<Option<String>>),
    Cancelled,
    TimedOut,
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Command-line arguments for one turn
pub fn build_args(config: &ClaudeConfig, session: &Session) -> Vec<String> {
    let mut args = vec![
        "--print".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--dangerously-skip-permissions".to_string(),
    ];

    if let Some(id) = session.id.as_deref() {
        args.push("--resume".to_string());
        args.push(id.to_string());
        if let Some(at) = session.resume_at.as_deref() {
            args.push("--resume-session-at".to_string());
            args.push(at.to_string());
            args.push("--fork-session".to_string());
        }
    }

    if let Some(tools) = allowed_tools_arg(&session.config.allowed_tools) {
        args.push("--allowedTools".to_string());
        args.push(tools);
    }

    if let Some(fragment) = session.config.system_prompt.as_deref() {
        args.push("--append-system-prompt".to_string());
        args.push(fragment.to_string());
    }

    if !session.config.mcp_servers.is_empty() {
        args.push("--mcp-config".to_string());
        args.push(mcp_config_json(&session.config.mcp_servers).to_string());
    }

    args.extend(config.extra_args.iter().cloned());
    args
}

/// The CLI names a whole MCP server as `mcp__<server>`, without a wildcard
fn allowed_tools_arg(list: &ToolAllowList) -> Option<String> {
    if list.is_unrestricted() {
        return None;
    }
    let names: Vec<String> = list
        .entries()
        .iter()
        .map(|entry| match entry.strip_suffix("__*") {
            Some(namespace) => namespace.to_string(),
            None => entry.clone(),
        })
        .collect();
    Some(names.join(","))
}

fn mcp_config_json(servers: &[McpServerConfig]) -> Value {
    let mut map = serde_json::Map::new();
    for server in servers {
        map.insert(
            server.name.clone(),
            json!({
                "command": server.command,
                "args": server.args,
                "env": server.env,
            }),
        );
    }
    json!({ "mcpServers": map })
}

/// Stateful translation of Claude stream-json lines into AgentMessages
#[derive(Debug, Default)]
pub struct ClaudeStreamParser {
    accumulated_text: String,
}

impl ClaudeStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, json: &Value) -> Vec<AgentMessage> {
        let Some(event_type) = json.get("type").and_then(|t| t.as_str()) else {
            return Vec::new();
        };

        match event_type {
            "system" => parse_system(json).into_iter().collect(),
            "assistant" => self.parse_assistant(json),
            "user" => parse_tool_results(json),
            "result" => vec![self.parse_result(json)],
            _ => Vec::new(),
        }
    }

    fn parse_assistant(&mut self, json: &Value) -> Vec<AgentMessage> {
        let message = json.get("message");
        let stream_id = message
            .and_then(|m| m.get("id"))
            .and_then(|i| i.as_str())
            .map(str::to_string);
        let Some(content) = message
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
        else {
            return Vec::new();
        };

        let mut messages = Vec::new();
        for item in content {
            match item.get("type").and_then(|t| t.as_str()) {
                Some("tool_use") => {
                    let name = item
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    let id = item
                        .get("id")
                        .and_then(|i| i.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    let input = item.get("input").cloned().unwrap_or(Value::Null);

                    tracing::info!(tool = %name, id = %id, "Tool use detected");
                    messages.push(AgentMessage::ToolUse {
                        id,
                        name,
                        input,
                        state: None,
                    });
                }
                Some("text") => {
                    let Some(text) = item.get("text").and_then(|t| t.as_str()) else {
                        continue;
                    };
                    if text.is_empty() {
                        continue;
                    }
                    // Separate consecutive assistant messages unless spacing is already there
                    if !self.accumulated_text.is_empty() {
                        let ends_with_ws = self.accumulated_text.ends_with(char::is_whitespace);
                        let starts_with_ws_or_punct = text
                            .starts_with(|c: char| c.is_whitespace() || c.is_ascii_punctuation());
                        if !ends_with_ws && !starts_with_ws_or_punct {
                            self.accumulated_text.push(' ');
                        }
                    }
                    self.accumulated_text.push_str(text);
                    messages.push(AgentMessage::text(text, stream_id.clone()));
                }
                _ => {}
            }
        }
        messages
    }

    fn parse_result(&mut self, json: &Value) -> AgentMessage {
        let accumulated = std::mem::take(&mut self.accumulated_text);
        let subtype = json.get("subtype").and_then(|s| s.as_str()).unwrap_or("success");
        let is_error = json
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if is_error || subtype != "success" {
            let detail = json
                .get("result")
                .or_else(|| json.get("error"))
                .and_then(|e| e.as_str())
                .map(str::to_string)
                .or_else(|| {
                    json.get("errors")
                        .and_then(|e| e.as_array())
                        .map(|errors| {
                            errors
                                .iter()
                                .filter_map(|e| e.as_str())
                                .collect::<Vec<_>>()
                                .join("; ")
                        })
                        .filter(|s| !s.is_empty())
                })
                .unwrap_or_else(|| subtype.to_string());

            let kind = if detail.to_lowercase().contains("timeout") {
                ResultSubtype::Timeout
            } else {
                ResultSubtype::Error
            };
            return AgentMessage::failure(kind, detail);
        }

        let text = match json.get("result").and_then(|r| r.as_str()) {
            Some(result) => result.to_string(),
            None => accumulated,
        };
        let usage = extract_usage(json);

        tracing::debug!(
            result_len = text.len(),
            input_tokens = usage.as_ref().map(|u| u.input_tokens).unwrap_or(0),
            output_tokens = usage.as_ref().map(|u| u.output_tokens).unwrap_or(0),
            "Turn finished with usage"
        );

        AgentMessage::success(text, usage)
    }
}

fn parse_system(json: &Value) -> Option<AgentMessage> {
    let subtype = json.get("subtype").and_then(|s| s.as_str())?;
    let session_id = json
        .get("session_id")
        .and_then(|s| s.as_str())
        .map(str::to_string);
    let message = json
        .get("message")
        .or_else(|| json.get("status"))
        .and_then(|m| m.as_str())
        .map(str::to_string);

    let subtype = match subtype {
        "init" => {
            session_id.as_ref()?;
            SystemSubtype::Init
        }
        "compact_boundary" => SystemSubtype::Compacted,
        "status" => SystemSubtype::Status,
        "task_notification" => SystemSubtype::TaskNotification,
        other => {
            tracing::debug!(subtype = %other, "Ignoring Claude system event");
            return None;
        }
    };

    Some(AgentMessage::System {
        subtype,
        session_id,
        message,
    })
}

fn parse_tool_results(json: &Value) -> Vec<AgentMessage> {
    let Some(content) = json
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
    else {
        return Vec::new();
    };

    content
        .iter()
        .filter(|item| item.get("type").and_then(|t| t.as_str()) == Some("tool_result"))
        .map(|item| AgentMessage::ToolResult {
            tool_use_id: item
                .get("tool_use_id")
                .and_then(|i| i.as_str())
                .unwrap_or("unknown")
                .to_string(),
            content: item.get("content").cloned().unwrap_or(Value::Null),
            is_error: item
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            metadata: json
                .get("tool_use_result")
                .cloned()
                .unwrap_or(Value::Null),
        })
        .collect()
}

fn extract_usage(json: &Value) -> Option<Usage> {
    let mut usage = Usage::default();
    let mut found_usage = false;

    if let Some(cost) = json.get("total_cost_usd").and_then(|v| v.as_f64()) {
        usage.cost_usd = Some(cost);
        found_usage = true;
    }

    if let Some(usage_obj) = json.get("usage") {
        usage.input_tokens = usage_obj
            .get("input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        usage.output_tokens = usage_obj
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        usage.cache_read_tokens = usage_obj
            .get("cache_read_input_tokens")
            .and_then(|v| v.as_u64());
        usage.cache_write_tokens = usage_obj
            .get("cache_creation_input_tokens")
            .and_then(|v| v.as_u64());
        found_usage = true;
    }

    found_usage.then_some(usage)
}
