// ABOUTME: Runtime backend selection from the AGENT_BACKEND environment variable.
// ABOUTME: Exactly two backends are valid; anything else is a fatal configuration error.

use crate::backends::claude::{ClaudeBackend, ClaudeConfig};
use crate::backends::opencode::{OpenCodeBackend, OpenCodeConfig};
use crate::config::RunnerConfig;
use crate::traits::AgentBackend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const BACKEND_ENV_VAR: &str = "AGENT_BACKEND";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Claude Code CLI streaming one request/response cycle per turn
    Claude,
    /// OpenCode server with explicit sessions and server-sent events
    #[serde(rename = "opencode")]
    OpenCode,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid {BACKEND_ENV_VAR} value {value:?}: expected \"claude\" or \"opencode\"")]
pub struct BackendSelectionError {
    pub value: String,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::OpenCode => "opencode",
        }
    }

    /// Parse the environment value; unset selects Claude
    pub fn from_env_value(value: Option<&str>) -> Result<Self, BackendSelectionError> {
        match value {
            None => Ok(Self::Claude),
            Some(v) => v.parse(),
        }
    }
}

impl FromStr for BackendKind {
    type Err = BackendSelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "claude" => Ok(Self::Claude),
            "opencode" => Ok(Self::OpenCode),
            other => Err(BackendSelectionError {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the adapter selected by the runner configuration
pub fn create_backend(config: &RunnerConfig) -> anyhow::Result<Box<dyn AgentBackend>> {
    let backend: Box<dyn AgentBackend> = match config.backend {
        BackendKind::Claude => Box::new(ClaudeBackend::new(ClaudeConfig {
            binary: config.claude_binary.clone(),
            extra_args: Vec::new(),
        })),
        BackendKind::OpenCode => Box::new(OpenCodeBackend::new(OpenCodeConfig {
            base_url: config.opencode_url.clone(),
        })?),
    };
    tracing::info!(backend = backend.name(), "Selected agent backend");
    Ok(backend)
}
