// ABOUTME: Session, query, and runner configuration for corral-agent.
// ABOUTME: Includes the tool allow-list with global and namespaced wildcard matching.

use crate::registry::BackendKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Configuration for an MCP server made available to the agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpServerConfig {
    /// Server name (used as tool prefix)
    pub name: String,
    /// Command to run
    pub command: String,
    /// Command arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Tool names the agent may use.
///
/// Entries are exact names, the global wildcard `*`, or a namespaced
/// wildcard such as `mcp__corral__*`. An empty list leaves the backend's
/// own defaults in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ToolAllowList(Vec<String>);

impl ToolAllowList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn entries(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every tool is allowed (empty list or a bare `*`)
    pub fn is_unrestricted(&self) -> bool {
        self.0.is_empty() || self.0.iter().any(|p| p == "*")
    }

    pub fn allows(&self, tool: &str) -> bool {
        if self.is_unrestricted() {
            return true;
        }
        self.0.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => tool.starts_with(prefix),
            None => pattern == tool,
        })
    }
}

/// Configuration handed to a backend when a session is created or resumed
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Working directory for the agent
    pub working_dir: PathBuf,
    #[serde(default)]
    pub allowed_tools: ToolAllowList,
    /// Fragment appended to the backend's system prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    /// Title for backends that keep one per session
    #[serde(default)]
    pub title: Option<String>,
}

impl SessionConfig {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..Default::default()
        }
    }
}

/// Per-query options
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Cancelling this token aborts the query cooperatively
    pub abort: CancellationToken,
    /// Give up on a turn that has not finished within this long
    pub turn_timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = Some(timeout);
        self
    }
}

/// Settings for the in-container runner, read from the environment
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub backend: BackendKind,
    pub ipc_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub claude_binary: String,
    pub opencode_url: String,
    pub poll_interval: Duration,
    pub turn_timeout: Option<Duration>,
}

impl RunnerConfig {
    /// Load from process environment. An invalid `AGENT_BACKEND` is fatal.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary variable lookup (used by tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = BackendKind::from_env_value(lookup("AGENT_BACKEND").as_deref())?;

        let poll_interval = match lookup("CORRAL_POLL_INTERVAL_MS") {
            Some(v) => Duration::from_millis(
                v.parse()
                    .with_context(|| format!("Invalid CORRAL_POLL_INTERVAL_MS: {v}"))?,
            ),
            None => Duration::from_millis(500),
        };

        let turn_timeout = lookup("CORRAL_TURN_TIMEOUT_SECS")
            .map(|v| {
                v.parse::<u64>()
                    .map(Duration::from_secs)
                    .with_context(|| format!("Invalid CORRAL_TURN_TIMEOUT_SECS: {v}"))
            })
            .transpose()?;

        Ok(Self {
            backend,
            ipc_dir: lookup("CORRAL_IPC_DIR")
                .unwrap_or_else(|| "/workspace/ipc".to_string())
                .into(),
            workspace_dir: lookup("CORRAL_WORKSPACE_DIR")
                .unwrap_or_else(|| "/workspace/group".to_string())
                .into(),
            claude_binary: lookup("CLAUDE_BINARY").unwrap_or_else(|| "claude".to_string()),
            opencode_url: lookup("OPENCODE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:4096".to_string()),
            poll_interval,
            turn_timeout,
        })
    }
}
