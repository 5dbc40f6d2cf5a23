// ABOUTME: In-container session runner: reads ContainerInput, drives the backend, frames results to stdout.
// ABOUTME: One framed ContainerOutput per turn result; fatal setup errors produce a single error record.

use crate::config::{QueryOptions, RunnerConfig, SessionConfig, ToolAllowList};
use crate::framing;
use crate::mailbox::Mailbox;
use crate::message::{AgentMessage, ResultSubtype, SystemSubtype};
use crate::protocol::{ContainerInput, ContainerOutput, OutputStatus};
use crate::session::Session;
use crate::traits::AgentBackend;
use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const SCHEDULED_TASK_PREFIX: &str = "[SCHEDULED TASK - You are running as a scheduled task. \
No human is waiting on this conversation; use your tools to deliver any output.]";

/// Tools granted when the input does not name any
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &[
    "Bash",
    "Read",
    "Write",
    "Edit",
    "Glob",
    "Grep",
    "WebSearch",
    "WebFetch",
    "TodoWrite",
    "mcp__corral__*",
];

/// Build the first prompt from the input and anything already waiting in the mailbox
pub fn initial_prompt(input: &ContainerInput, pending: &[String]) -> String {
    let mut prompt = if input.is_scheduled_task {
        format!("{SCHEDULED_TASK_PREFIX}\n\n{}", input.prompt)
    } else {
        input.prompt.clone()
    };
    if !pending.is_empty() {
        prompt.push('\n');
        prompt.push_str(&pending.join("\n"));
    }
    prompt
}

pub fn session_config(input: &ContainerInput, config: &RunnerConfig) -> SessionConfig {
    let allowed_tools = match &input.allowed_tools {
        Some(tools) => ToolAllowList::new(tools.iter().cloned()),
        None => ToolAllowList::new(DEFAULT_ALLOWED_TOOLS.iter().copied()),
    };
    SessionConfig {
        working_dir: config.workspace_dir.clone(),
        allowed_tools,
        system_prompt: input.system_prompt.clone(),
        mcp_servers: input.mcp_servers.clone(),
        title: Some(format!("corral: {}", input.group_folder)),
    }
}

/// Turn a terminal result message into the wire record
pub fn output_for(
    subtype: ResultSubtype,
    result: Option<String>,
    session_id: Option<String>,
) -> ContainerOutput {
    let status = match subtype {
        ResultSubtype::Success => OutputStatus::Success,
        ResultSubtype::Timeout => OutputStatus::Timeout,
        _ => OutputStatus::Error,
    };
    ContainerOutput {
        status,
        result,
        new_session_id: session_id,
        error: None,
    }
}

async fn write_record<W>(out: &mut W, record: &ContainerOutput) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = framing::encode(record).context("Failed to encode output record")?;
    out.write_all(frame.as_bytes())
        .await
        .context("Failed to write output record")?;
    out.flush().await.context("Failed to flush stdout")?;
    Ok(())
}

async fn open_session(
    backend: &dyn AgentBackend,
    input: &ContainerInput,
    config: SessionConfig,
) -> Result<Session> {
    match &input.session_id {
        Some(id) => backend
            .resume_session(config, id, input.resume_at.as_deref())
            .await
            .with_context(|| format!("Failed to resume session {id}")),
        None => backend
            .create_session(config)
            .await
            .context("Failed to create session"),
    }
}

/// Run one container invocation to completion.
///
/// Returns the number of records written. A setup failure writes one error
/// record before returning `Err`.
pub async fn run<W>(
    backend: &dyn AgentBackend,
    config: &RunnerConfig,
    input: ContainerInput,
    cancel: CancellationToken,
    out: &mut W,
) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mailbox = Mailbox::for_ipc_root(&config.ipc_dir).with_poll_interval(config.poll_interval);

    let pending = mailbox.drain_pending().await;
    if !pending.is_empty() {
        tracing::info!(count = pending.len(), "Folding queued messages into the first prompt");
    }
    let prompt = initial_prompt(&input, &pending);

    let mut session =
        match open_session(backend, &input, session_config(&input, config)).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "Session setup failed");
                write_record(&mut *out, &ContainerOutput::error(format!("{e:#}"), None)).await?;
                return Err(e);
            }
        };

    tracing::info!(
        backend = backend.name(),
        group = %input.group_folder,
        session_id = ?session.id,
        resumed = input.session_id.is_some(),
        "Session ready"
    );

    let mut options = QueryOptions {
        abort: cancel,
        turn_timeout: None,
    };
    if let Some(timeout) = config.turn_timeout {
        options = options.with_turn_timeout(timeout);
    }

    let mut session_id = session.id.clone();
    let mut records = 0;
    let mut stream = backend.run_multi_turn_query(&mut session, &prompt, &mailbox, options);

    while let Some(message) = stream.next().await {
        match message {
            AgentMessage::System {
                subtype: SystemSubtype::Init,
                session_id: Some(id),
                ..
            } => {
                tracing::info!(session_id = %id, "Session initialized");
                session_id = Some(id);
            }
            AgentMessage::Result {
                subtype, result, ..
            } => {
                tracing::info!(?subtype, records, "Turn finished");
                let record = output_for(subtype, result, session_id.clone());
                write_record(&mut *out, &record).await?;
                records += 1;
            }
            AgentMessage::ToolUse { name, .. } => {
                tracing::debug!(tool = %name, "Tool call");
            }
            AgentMessage::ToolResult {
                tool_use_id,
                is_error,
                ..
            } => {
                tracing::debug!(tool_use_id = %tool_use_id, is_error, "Tool result");
            }
            AgentMessage::Permission { kind, title, .. } => {
                tracing::warn!(kind = %kind, title = %title, "Backend asked for permission");
            }
            other => {
                tracing::trace!(message = ?other, "Agent message");
            }
        }
    }

    tracing::info!(records, "Session ended");
    Ok(records)
}
