// ABOUTME: In-container side of corral: agent backends, mailbox IPC, and framed output.
// ABOUTME: Provides the AgentBackend contract with Claude CLI, OpenCode, and mock adapters.

pub mod config;
pub mod framing;
pub mod mailbox;
pub mod message;
pub mod multi_turn;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod session;
pub mod traits;

pub mod backends;

pub use config::{McpServerConfig, QueryOptions, RunnerConfig, SessionConfig, ToolAllowList};
pub use framing::{FrameDecoder, FrameError, OUTPUT_END_MARKER, OUTPUT_START_MARKER};
pub use mailbox::{Mailbox, NextTurn, CLOSE_SENTINEL};
pub use message::{AgentMessage, ResultSubtype, SystemSubtype, ToolState, Usage};
pub use protocol::{ContainerInput, ContainerOutput, OutputStatus};
pub use registry::{create_backend, BackendKind, BackendSelectionError, BACKEND_ENV_VAR};
pub use session::{Session, SessionMetadata};
pub use traits::AgentBackend;
