// ABOUTME: Wire records exchanged between the host and the in-container runner.
// ABOUTME: ContainerInput arrives on the runner's stdin; ContainerOutput leaves framed on stdout.

use crate::config::McpServerConfig;
use serde::{Deserialize, Serialize};

/// Per-invocation input written by the host to the runner's stdin as one JSON object
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInput {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Message id to fork the resumed session from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<String>,
    pub group_folder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_jid: Option<String>,
    #[serde(default)]
    pub is_main: bool,
    #[serde(default)]
    pub is_scheduled_task: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<McpServerConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    Success,
    Error,
    Timeout,
}

/// One record per completed turn, written between output markers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOutput {
    pub status: OutputStatus,
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContainerOutput {
    pub fn success(result: Option<String>, new_session_id: Option<String>) -> Self {
        Self {
            status: OutputStatus::Success,
            result,
            new_session_id,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>, new_session_id: Option<String>) -> Self {
        Self {
            status: OutputStatus::Error,
            result: None,
            new_session_id,
            error: Some(message.into()),
        }
    }
}
