// ABOUTME: Turns raw OpenCode server events into normalized AgentMessages for one turn.
// ABOUTME: Deduplicates snapshot text, tracks tool lifecycles, and resolves exactly one result.

use crate::message::{AgentMessage, ResultSubtype, SystemSubtype, ToolState, Usage};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Map an OpenCode error name onto a result subtype
pub fn classify_error(name: &str) -> ResultSubtype {
    if name == "MessageAbortedError" {
        ResultSubtype::Abort
    } else if name.contains("Timeout") {
        ResultSubtype::Timeout
    } else if name.contains("Tool") {
        ResultSubtype::ToolError
    } else {
        ResultSubtype::Error
    }
}

/// Split `next` into the part already seen in `previous` and the unseen suffix.
///
/// Returns the suffix and whether `next` extends `previous` cleanly.
pub fn unseen_suffix<'a>(previous: &str, next: &'a str) -> (&'a str, bool) {
    let mut common = 0;
    for ((i, a), b) in next.char_indices().zip(previous.chars()) {
        if a != b {
            break;
        }
        common = i + a.len_utf8();
    }
    (&next[common..], common == previous.len())
}

/// True for the event that says `session_id` has stopped working
pub fn is_idle_event(event: &Value, session_id: &str) -> bool {
    let event_type = event.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let props = event.get("properties").unwrap_or(event);
    if event_session_id(props) != Some(session_id) {
        return false;
    }
    match event_type {
        "session.idle" => true,
        "session.status" => {
            props
                .get("status")
                .and_then(|s| s.get("type"))
                .and_then(|v| v.as_str())
                == Some("idle")
        }
        _ => false,
    }
}

/// Per-turn event state for one OpenCode session
#[derive(Debug)]
pub struct TurnNormalizer {
    session_id: String,
    roles: HashMap<String, String>,
    text_parts: HashMap<String, String>,
    text_order: Vec<String>,
    tools_started: HashSet<String>,
    tools_finished: HashSet<String>,
    usage: HashMap<String, Usage>,
    last_status: Option<String>,
    resolved: bool,
    went_idle: bool,
}

impl TurnNormalizer {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            roles: HashMap::new(),
            text_parts: HashMap::new(),
            text_order: Vec::new(),
            tools_started: HashSet::new(),
            tools_finished: HashSet::new(),
            usage: HashMap::new(),
            last_status: None,
            resolved: false,
            went_idle: false,
        }
    }

    /// True once this turn has produced its result
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// True when the server reported the session idle for this turn.
    /// A turn resolved any other way may still have events in flight.
    pub fn went_idle(&self) -> bool {
        self.went_idle
    }

    /// Assistant text seen so far, in part order
    pub fn text(&self) -> String {
        self.text_order
            .iter()
            .filter_map(|id| self.text_parts.get(id))
            .filter(|t| !t.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn total_usage(&self) -> Option<Usage> {
        if self.usage.is_empty() {
            return None;
        }
        let mut total = Usage::default();
        for u in self.usage.values() {
            total.input_tokens += u.input_tokens;
            total.output_tokens += u.output_tokens;
            total.cache_read_tokens = sum_opt(total.cache_read_tokens, u.cache_read_tokens);
            total.cache_write_tokens = sum_opt(total.cache_write_tokens, u.cache_write_tokens);
            total.cost_usd = sum_opt(total.cost_usd, u.cost_usd);
        }
        Some(total)
    }

    /// Resolve the turn from outside the event feed (abort, timeout, lost stream).
    /// Returns None when the turn already has a result.
    pub fn resolve_with(&mut self, subtype: ResultSubtype, detail: &str) -> Option<AgentMessage> {
        if self.resolved {
            return None;
        }
        self.resolved = true;
        Some(AgentMessage::failure(subtype, detail))
    }

    pub fn handle(&mut self, event: &Value) -> Vec<AgentMessage> {
        if self.resolved {
            return Vec::new();
        }

        let event_type = event.get("type").and_then(|v| v.as_str()).unwrap_or("");
        let props = event.get("properties").unwrap_or(event);

        if let Some(id) = event_session_id(props) {
            if id != self.session_id {
                return Vec::new();
            }
        }

        match event_type {
            "message.updated" => {
                self.on_message_updated(props);
                Vec::new()
            }
            "message.part.updated" => self.on_part_updated(props),
            "session.idle" => {
                self.resolved = true;
                self.went_idle = true;
                vec![AgentMessage::success(self.text(), self.total_usage())]
            }
            "session.error" => {
                let error = props.get("error");
                let name = error
                    .and_then(|e| e.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("UnknownError");
                let message = error
                    .and_then(|e| e.get("data"))
                    .and_then(|d| d.get("message"))
                    .and_then(|v| v.as_str())
                    .or_else(|| props.get("message").and_then(|v| v.as_str()))
                    .unwrap_or(name);
                tracing::info!(session_id = %self.session_id, error = name, "OpenCode session error");
                self.resolved = true;
                vec![AgentMessage::failure(classify_error(name), message)]
            }
            "session.status" => {
                let status = props
                    .get("status")
                    .and_then(|s| s.get("type"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                if self.last_status.as_deref() == Some(status.as_str()) {
                    return Vec::new();
                }
                self.last_status = Some(status.clone());
                vec![AgentMessage::System {
                    subtype: SystemSubtype::Status,
                    session_id: Some(self.session_id.clone()),
                    message: Some(status),
                }]
            }
            "session.compacted" => vec![AgentMessage::System {
                subtype: SystemSubtype::Compacted,
                session_id: Some(self.session_id.clone()),
                message: None,
            }],
            "permission.updated" | "permission.asked" => {
                let request_id = props
                    .get("id")
                    .or_else(|| props.get("permissionID"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let kind = props
                    .get("permission")
                    .or_else(|| props.get("type"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let title = props
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let pattern = match props.get("pattern").or_else(|| props.get("patterns")) {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Array(items)) => Some(
                        items
                            .iter()
                            .filter_map(|v| v.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                    ),
                    _ => None,
                };
                vec![AgentMessage::Permission {
                    request_id,
                    kind,
                    title,
                    pattern,
                }]
            }
            _ => Vec::new(),
        }
    }

    fn on_message_updated(&mut self, props: &Value) {
        let Some(info) = props.get("info") else {
            return;
        };
        let Some(id) = info.get("id").and_then(|v| v.as_str()) else {
            return;
        };
        let role = info.get("role").and_then(|v| v.as_str()).unwrap_or("");
        self.roles.insert(id.to_string(), role.to_string());

        if role != "assistant" {
            return;
        }
        if let Some(tokens) = info.get("tokens") {
            let count = |v: Option<&Value>| v.and_then(|v| v.as_u64());
            let cache = tokens.get("cache");
            self.usage.insert(
                id.to_string(),
                Usage {
                    input_tokens: count(tokens.get("input")).unwrap_or(0),
                    output_tokens: count(tokens.get("output")).unwrap_or(0),
                    cache_read_tokens: count(cache.and_then(|c| c.get("read"))),
                    cache_write_tokens: count(cache.and_then(|c| c.get("write"))),
                    cost_usd: info.get("cost").and_then(|v| v.as_f64()),
                },
            );
        }
    }

    fn on_part_updated(&mut self, props: &Value) -> Vec<AgentMessage> {
        let Some(part) = props.get("part") else {
            return Vec::new();
        };
        let message_id = part.get("messageID").and_then(|v| v.as_str()).unwrap_or("");
        if self.roles.get(message_id).map(String::as_str) == Some("user") {
            return Vec::new();
        }

        match part.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "text" => self.on_text_part(part, props.get("delta").and_then(|v| v.as_str())),
            "tool" => self.on_tool_part(part),
            _ => Vec::new(),
        }
    }

    fn on_text_part(&mut self, part: &Value, delta: Option<&str>) -> Vec<AgentMessage> {
        let Some(part_id) = part.get("id").and_then(|v| v.as_str()) else {
            return Vec::new();
        };
        let synthetic = part.get("synthetic").and_then(|v| v.as_bool()).unwrap_or(false);
        let message_id = part.get("messageID").and_then(|v| v.as_str());

        if !self.text_parts.contains_key(part_id) {
            self.text_order.push(part_id.to_string());
        }
        let seen = self.text_parts.entry(part_id.to_string()).or_default();

        let fresh = match delta {
            Some(delta) => {
                seen.push_str(delta);
                delta.to_string()
            }
            None => {
                let snapshot = part.get("text").and_then(|v| v.as_str()).unwrap_or("");
                let (suffix, append_only) = unseen_suffix(seen, snapshot);
                if !append_only {
                    tracing::warn!(part_id, "OpenCode text part was rewritten, not appended");
                }
                let suffix = suffix.to_string();
                *seen = snapshot.to_string();
                suffix
            }
        };

        if fresh.is_empty() {
            return Vec::new();
        }
        vec![AgentMessage::Text {
            content: fresh,
            stream_id: message_id.map(str::to_string),
            synthetic,
        }]
    }

    fn on_tool_part(&mut self, part: &Value) -> Vec<AgentMessage> {
        let call_id = part
            .get("callID")
            .or_else(|| part.get("id"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let name = part.get("tool").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let state = part.get("state").cloned().unwrap_or(Value::Null);
        let status = state.get("status").and_then(|v| v.as_str()).unwrap_or("pending");
        let input = state.get("input").cloned().unwrap_or(Value::Null);

        let tool_state = match status {
            "running" => ToolState::Running,
            "completed" => ToolState::Completed,
            "error" => ToolState::Error,
            _ => ToolState::Pending,
        };

        let mut out = Vec::new();
        if self.tools_started.insert(call_id.clone()) {
            out.push(AgentMessage::ToolUse {
                id: call_id.clone(),
                name,
                input,
                state: Some(tool_state),
            });
        }

        let finished = matches!(tool_state, ToolState::Completed | ToolState::Error);
        if finished && self.tools_finished.insert(call_id.clone()) {
            let is_error = tool_state == ToolState::Error;
            let content = if is_error {
                state.get("error").cloned().unwrap_or(Value::Null)
            } else {
                state.get("output").cloned().unwrap_or(Value::Null)
            };
            out.push(AgentMessage::ToolResult {
                tool_use_id: call_id,
                content,
                is_error,
                metadata: state.get("metadata").cloned().unwrap_or(Value::Null),
            });
        }
        out
    }
}

fn sum_opt<T: std::ops::Add<Output = T>>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (a, b) => a.or(b),
    }
}

fn event_session_id(props: &Value) -> Option<&str> {
    props
        .get("sessionID")
        .or_else(|| props.get("info").and_then(|i| i.get("sessionID")))
        .or_else(|| props.get("part").and_then(|p| p.get("sessionID")))
        .and_then(|v| v.as_str())
}
