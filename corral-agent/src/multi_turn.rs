// ABOUTME: Sequential multi-turn driver for backends that run one query per turn.
// ABOUTME: Alternates run_query with mailbox polling and guarantees one result per turn.

use crate::config::QueryOptions;
use crate::mailbox::{Mailbox, NextTurn};
use crate::message::{AgentMessage, ResultSubtype};
use crate::session::Session;
use crate::traits::AgentBackend;
use futures::stream::{BoxStream, StreamExt};

/// Drive `backend.run_query` turn after turn until the mailbox closes.
///
/// Turns never overlap: the next prompt is only taken from the mailbox
/// after the previous turn's stream has ended.
pub fn sequential_turns<'a, B>(
    backend: &'a B,
    session: &'a mut Session,
    initial_prompt: &'a str,
    mailbox: &'a Mailbox,
    options: QueryOptions,
) -> BoxStream<'a, AgentMessage>
where
    B: AgentBackend + ?Sized,
{
    Box::pin(async_stream::stream! {
        let mut prompt = initial_prompt.to_string();

        loop {
            let mut aborted = false;
            let mut saw_result = false;
            {
                let mut turn = backend.run_query(&mut *session, &prompt, options.clone());
                while let Some(message) = turn.next().await {
                    if let AgentMessage::Result { subtype, .. } = &message {
                        if saw_result {
                            tracing::warn!(backend = backend.name(), "Dropping duplicate turn result");
                            continue;
                        }
                        saw_result = true;
                        aborted = *subtype == ResultSubtype::Abort;
                    }
                    yield message;
                }
            }

            if !saw_result {
                yield AgentMessage::failure(ResultSubtype::Error, "turn ended without a result");
            }

            if aborted || options.abort.is_cancelled() {
                tracing::info!(backend = backend.name(), "Query aborted, leaving multi-turn loop");
                break;
            }

            match mailbox.await_next(&options.abort).await {
                NextTurn::Prompt(next) => {
                    tracing::info!(
                        backend = backend.name(),
                        prompt_len = next.len(),
                        "Starting follow-up turn from mailbox"
                    );
                    prompt = next;
                }
                NextTurn::Close => {
                    tracing::info!(backend = backend.name(), "Close requested, ending session");
                    break;
                }
            }
        }
    })
}
