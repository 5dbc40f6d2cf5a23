// ABOUTME: Unified message model emitted by every backend adapter during a query.
// ABOUTME: Tagged union of text, tool lifecycle, system notices, permissions, and turn results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages emitted by backend adapters, normalized across backends
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Assistant text output
    Text {
        /// Text content (a delta, never a repeated snapshot)
        content: String,
        /// Upstream stream/part id this text belongs to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_id: Option<String>,
        /// True when the adapter produced this text itself rather than the model
        #[serde(default)]
        synthetic: bool,
    },

    /// Tool invocation
    ToolUse {
        /// Unique identifier for this tool invocation
        id: String,
        /// Tool name (e.g., "Read", "Bash", "mcp__corral__send_message")
        name: String,
        /// Full input passed to the tool
        input: Value,
        /// Execution state when the backend reports one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<ToolState>,
    },

    /// Tool completed
    ToolResult {
        /// Matches the id from ToolUse
        tool_use_id: String,
        /// Tool output
        content: Value,
        /// Whether the tool failed
        #[serde(default)]
        is_error: bool,
        /// Backend-specific metadata
        #[serde(default)]
        metadata: Value,
    },

    /// Session-level notice
    System {
        subtype: SystemSubtype,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Human-readable message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// End of a turn. Exactly one per completed turn.
    Result {
        subtype: ResultSubtype,
        /// Final text of the turn
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        /// Token usage and cost (if available)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    /// The backend is asking for permission to do something
    Permission {
        request_id: String,
        #[serde(rename = "permission_type")]
        kind: String,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
    },
}

/// Tool execution state reported by event-driven backends
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Pending,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemSubtype {
    Init,
    Status,
    Compacted,
    Error,
    Warning,
    TaskNotification,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultSubtype {
    Success,
    Error,
    Timeout,
    Abort,
    ToolError,
}

impl ResultSubtype {
    /// Prefix used for human-readable terminal failure text
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Error => "Error",
            Self::Timeout => "Timeout",
            Self::Abort => "Aborted",
            Self::ToolError => "Tool error",
        }
    }
}

/// Token usage and cost tracking
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    /// Input tokens consumed
    pub input_tokens: u64,
    /// Output tokens generated
    pub output_tokens: u64,
    /// Tokens read from cache
    pub cache_read_tokens: Option<u64>,
    /// Tokens written to cache
    pub cache_write_tokens: Option<u64>,
    /// Total cost in USD
    pub cost_usd: Option<f64>,
}

impl AgentMessage {
    /// Plain model text for a stream/part id
    pub fn text(content: impl Into<String>, stream_id: Option<String>) -> Self {
        Self::Text {
            content: content.into(),
            stream_id,
            synthetic: false,
        }
    }

    pub fn success(result: impl Into<String>, usage: Option<Usage>) -> Self {
        Self::Result {
            subtype: ResultSubtype::Success,
            result: Some(result.into()),
            usage,
        }
    }

    /// Terminal failure, rendered as `"<Kind>: <detail>"`
    pub fn failure(subtype: ResultSubtype, detail: impl AsRef<str>) -> Self {
        Self::Result {
            subtype,
            result: Some(format!("{}: {}", subtype.label(), detail.as_ref())),
            usage: None,
        }
    }

    pub fn init(session_id: impl Into<String>) -> Self {
        Self::System {
            subtype: SystemSubtype::Init,
            session_id: Some(session_id.into()),
            message: None,
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}
