// ABOUTME: OpenCode backend - drives an `opencode serve` instance over HTTP and server-sent events.
// ABOUTME: Keeps one event subscription open across turns and synthesizes the init notice.

pub mod client;
pub mod events;

pub use client::{BackendUnavailable, EventSubscription, OpenCodeClient};
pub use events::{classify_error, is_idle_event, unseen_suffix, TurnNormalizer};

use crate::config::{QueryOptions, SessionConfig, ToolAllowList};
use crate::mailbox::{Mailbox, NextTurn};
use crate::message::{AgentMessage, ResultSubtype};
use crate::session::Session;
use crate::traits::AgentBackend;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

/// How long to wait for a turn that ended early to go idle on the server
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OpenCodeConfig {
    /// Base URL of the OpenCode server, e.g. http://127.0.0.1:4096
    pub base_url: String,
}

pub struct OpenCodeBackend {
    client: OpenCodeClient,
}

enum TurnStep {
    Event(Option<Value>),
    Cancelled,
    TimedOut,
}

impl OpenCodeBackend {
    pub fn new(config: OpenCodeConfig) -> Result<Self> {
        Ok(Self {
            client: OpenCodeClient::new(&config.base_url)?,
        })
    }

    async fn abort_remote(&self, session_id: &str, directory: &Path) {
        if let Err(e) = self.client.abort(session_id, directory).await {
            tracing::warn!(session_id, error = %e, "OpenCode abort failed");
        }
    }

    fn run_turns<'a>(
        &'a self,
        session: &'a mut Session,
        initial_prompt: &'a str,
        mailbox: Option<&'a Mailbox>,
        options: QueryOptions,
    ) -> BoxStream<'a, AgentMessage> {
        Box::pin(async_stream::stream! {
            let Some(session_id) = session.id.clone() else {
                yield AgentMessage::failure(ResultSubtype::Error, "OpenCode session has no id");
                return;
            };
            let directory = session.config.working_dir.clone();

            // Subscribe before the first prompt so no event is missed
            let mut events = match self.client.subscribe(&directory).await {
                Ok(events) => events,
                Err(e) => {
                    yield AgentMessage::failure(
                        ResultSubtype::Error,
                        format!("OpenCode event stream unavailable: {e:#}"),
                    );
                    return;
                }
            };

            let mut prompt = initial_prompt.to_string();
            let mut unsettled = false;
            loop {
                if unsettled {
                    settle(&mut events, &session_id).await;
                }
                let turn = session.begin_turn();
                if session.claim_init() {
                    yield AgentMessage::init(session_id.clone());
                }
                tracing::info!(session_id = %session_id, turn, prompt_len = prompt.len(), "Sending OpenCode prompt");

                let mut normalizer = TurnNormalizer::new(session_id.clone());
                let mut stop = false;
                let body = prompt_body(&session.config, &prompt);

                if let Err(e) = self.client.prompt_async(&session_id, &body, &directory).await {
                    if let Some(m) = normalizer.resolve_with(ResultSubtype::Error, &format!("{e:#}")) {
                        yield m;
                    }
                    stop = true;
                }

                let deadline = options.turn_timeout.map(|t| Instant::now() + t);
                while !normalizer.is_resolved() {
                    let step = tokio::select! {
                        event = events.next_event() => TurnStep::Event(event),
                        _ = options.abort.cancelled() => TurnStep::Cancelled,
                        _ = sleep_until_opt(deadline) => TurnStep::TimedOut,
                    };

                    match step {
                        TurnStep::Event(Some(event)) => {
                            for message in normalizer.handle(&event) {
                                if let AgentMessage::Result { subtype: ResultSubtype::Abort, .. } = &message {
                                    stop = true;
                                }
                                yield message;
                            }
                        }
                        TurnStep::Event(None) => {
                            if let Some(m) = normalizer.resolve_with(
                                ResultSubtype::Error,
                                "OpenCode event stream closed before the turn finished",
                            ) {
                                yield m;
                            }
                            stop = true;
                        }
                        TurnStep::Cancelled => {
                            self.abort_remote(&session_id, &directory).await;
                            if let Some(m) = normalizer.resolve_with(ResultSubtype::Abort, "query cancelled") {
                                yield m;
                            }
                            stop = true;
                        }
                        TurnStep::TimedOut => {
                            self.abort_remote(&session_id, &directory).await;
                            let secs = options.turn_timeout.map(|t| t.as_secs()).unwrap_or_default();
                            if let Some(m) = normalizer.resolve_with(
                                ResultSubtype::Timeout,
                                &format!("no result within {secs}s"),
                            ) {
                                yield m;
                            }
                        }
                    }
                }

                // Error and timeout results arrive before the server goes idle;
                // what remains of this turn must not leak into the next one
                unsettled = !normalizer.went_idle();

                let Some(mailbox) = mailbox else { break };
                if stop || options.abort.is_cancelled() {
                    break;
                }

                match mailbox.await_next(&options.abort).await {
                    NextTurn::Prompt(next) => {
                        tracing::info!(session_id = %session_id, "Starting follow-up turn from mailbox");
                        prompt = next;
                    }
                    NextTurn::Close => {
                        tracing::info!(session_id = %session_id, "Close requested, ending session");
                        break;
                    }
                }
            }
        })
    }
}

/// Read and drop events until the session goes idle
async fn settle(events: &mut EventSubscription, session_id: &str) {
    let wait = tokio::time::sleep(SETTLE_TIMEOUT);
    tokio::pin!(wait);
    let mut dropped = 0usize;
    loop {
        tokio::select! {
            event = events.next_event() => match event {
                Some(event) if is_idle_event(&event, session_id) => break,
                Some(_) => dropped += 1,
                None => break,
            },
            _ = &mut wait => {
                tracing::warn!(session_id, "OpenCode session did not go idle after the previous turn");
                break;
            }
        }
    }
    tracing::debug!(session_id, dropped, "Previous turn settled");
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Translate the allow-list into OpenCode's tool toggle map.
///
/// `mcp__<server>__*` becomes `<server>_*`, matching how OpenCode prefixes
/// MCP tools. Returns None when every tool is allowed.
pub fn tool_toggles(allowed: &ToolAllowList) -> Option<Map<String, Value>> {
    if allowed.is_unrestricted() {
        return None;
    }
    let mut tools = Map::new();
    tools.insert("*".to_string(), Value::Bool(false));
    for entry in allowed.entries() {
        let key = match entry
            .strip_prefix("mcp__")
            .and_then(|rest| rest.strip_suffix("__*"))
        {
            Some(server) => format!("{server}_*"),
            None => entry.clone(),
        };
        tools.insert(key, Value::Bool(true));
    }
    Some(tools)
}

/// Request body for `prompt_async`
pub fn prompt_body(config: &SessionConfig, prompt: &str) -> Value {
    let mut body = json!({
        "parts": [{ "type": "text", "text": prompt }],
    });
    if let Some(system) = &config.system_prompt {
        body["system"] = json!(system);
    }
    if let Some(tools) = tool_toggles(&config.allowed_tools) {
        body["tools"] = Value::Object(tools);
    }
    body
}

impl AgentBackend for OpenCodeBackend {
    fn name(&self) -> &'static str {
        "opencode"
    }

    fn create_session<'a>(&'a self, config: SessionConfig) -> BoxFuture<'a, Result<Session>> {
        Box::pin(async move {
            if !config.mcp_servers.is_empty() {
                tracing::debug!(
                    count = config.mcp_servers.len(),
                    "MCP servers for OpenCode come from the server's own configuration"
                );
            }
            let info = self
                .client
                .create_session(&config.working_dir, config.title.as_deref())
                .await?;
            tracing::info!(session_id = %info.id, "Created OpenCode session");
            let mut session = Session::with_id(config, info.id.clone());
            session.metadata = info.metadata();
            Ok(session)
        })
    }

    fn resume_session<'a>(
        &'a self,
        config: SessionConfig,
        session_id: &'a str,
        resume_at: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Session>> {
        Box::pin(async move {
            let info = self
                .client
                .get_session(session_id, &config.working_dir)
                .await?;

            let info = match resume_at {
                Some(message_id) => {
                    let forked = self
                        .client
                        .fork_session(&info.id, message_id, &config.working_dir)
                        .await
                        .context("Failed to branch OpenCode session")?;
                    tracing::info!(
                        from = %info.id,
                        to = %forked.id,
                        message_id,
                        "Forked OpenCode session"
                    );
                    forked
                }
                None => info,
            };

            let mut session = Session::with_id(config, info.id.clone());
            session.metadata = info.metadata();
            Ok(session)
        })
    }

    fn run_query<'a>(
        &'a self,
        session: &'a mut Session,
        prompt: &'a str,
        options: QueryOptions,
    ) -> BoxStream<'a, AgentMessage> {
        self.run_turns(session, prompt, None, options)
    }

    fn run_multi_turn_query<'a>(
        &'a self,
        session: &'a mut Session,
        initial_prompt: &'a str,
        mailbox: &'a Mailbox,
        options: QueryOptions,
    ) -> BoxStream<'a, AgentMessage> {
        self.run_turns(session, initial_prompt, Some(mailbox), options)
    }

    fn abort_session<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Some(id) = &session.id {
                self.abort_remote(id, &session.config.working_dir).await;
            }
        })
    }
}
