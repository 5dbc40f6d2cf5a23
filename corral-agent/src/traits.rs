// ABOUTME: Core AgentBackend trait that both backend adapters implement.
// ABOUTME: Defines session creation/resume, single and multi-turn queries, and abort.

use crate::config::{QueryOptions, SessionConfig};
use crate::mailbox::Mailbox;
use crate::message::AgentMessage;
use crate::session::Session;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

/// Contract every backend adapter implements.
///
/// Adapters hold no state between sessions; everything per-session lives in
/// the [`Session`] value handed back to the caller.
pub trait AgentBackend: Send + Sync {
    /// Backend name for logging and metrics
    fn name(&self) -> &'static str;

    /// Allocate a new session. The id may stay unset until the first turn.
    fn create_session<'a>(&'a self, config: SessionConfig) -> BoxFuture<'a, Result<Session>>;

    /// Reattach to a known session. With `resume_at`, later queries branch
    /// from that message and leave the original history untouched.
    fn resume_session<'a>(
        &'a self,
        config: SessionConfig,
        session_id: &'a str,
        resume_at: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Session>>;

    /// Send one prompt and stream normalized messages until the turn ends.
    ///
    /// The stream always finishes with exactly one `Result` message.
    fn run_query<'a>(
        &'a self,
        session: &'a mut Session,
        prompt: &'a str,
        options: QueryOptions,
    ) -> BoxStream<'a, AgentMessage>;

    /// Run turns until the mailbox asks to close: one `Result` per turn,
    /// follow-up prompts taken from `mailbox` between turns.
    fn run_multi_turn_query<'a>(
        &'a self,
        session: &'a mut Session,
        initial_prompt: &'a str,
        mailbox: &'a Mailbox,
        options: QueryOptions,
    ) -> BoxStream<'a, AgentMessage>;

    /// Best-effort cancellation; failures are logged and swallowed
    fn abort_session<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, ()>;
}
