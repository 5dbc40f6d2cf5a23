// ABOUTME: Backend implementations (Claude CLI, OpenCode server, mock).
// ABOUTME: Each backend implements the AgentBackend trait.

pub mod claude;
pub mod mock;
pub mod opencode;
