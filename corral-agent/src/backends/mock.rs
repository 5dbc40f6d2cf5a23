// ABOUTME: Mock backend for testing - replays pre-configured messages per prompt.
// ABOUTME: Allows deterministic tests without spawning real agent processes.
//!
//! # Example
//!
//! ```no_run
//! use corral_agent::backends::mock::MockBackend;
//! use corral_agent::{AgentBackend, AgentMessage, QueryOptions, SessionConfig};
//! use futures::StreamExt;
//!
//! # async fn example() {
//! let mock = MockBackend::new()
//!     .on_prompt("hello").respond_text("Hi there!");
//!
//! let mut session = mock.create_session(SessionConfig::new("/tmp")).await.unwrap();
//! let mut stream = mock.run_query(&mut session, "hello", QueryOptions::default());
//! while let Some(message) = stream.next().await {
//!     if let AgentMessage::Result { result, .. } = message {
//!         assert_eq!(result.as_deref(), Some("Hi there!"));
//!     }
//! }
//! # }
//! ```

use crate::config::{QueryOptions, SessionConfig};
use crate::mailbox::Mailbox;
use crate::message::{AgentMessage, ResultSubtype};
use crate::multi_turn::sequential_turns;
use crate::session::Session;
use crate::traits::AgentBackend;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Mock backend for testing
#[derive(Default)]
pub struct MockBackend {
    expectations: Arc<Mutex<VecDeque<Expectation>>>,
    prompts: Arc<Mutex<Vec<String>>>,
    sessions: AtomicU64,
}

struct Expectation {
    pattern: String,
    messages: Vec<AgentMessage>,
}

impl MockBackend {
    /// Create a new mock backend with no expectations
    pub fn new() -> Self {
        Self::default()
    }

    /// Set up an expectation for a prompt containing the given pattern
    pub fn on_prompt(self, pattern: &str) -> ExpectationBuilder {
        ExpectationBuilder {
            backend: self,
            pattern: pattern.to_string(),
        }
    }

    /// Every prompt received so far, in order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn take_messages(&self, prompt: &str) -> Option<Vec<AgentMessage>> {
        let mut exp = self.expectations.lock().unwrap_or_else(|e| e.into_inner());
        // FIFO first, then the first match anywhere in the queue
        if exp.front().is_some_and(|e| prompt.contains(&e.pattern)) {
            return exp.pop_front().map(|e| e.messages);
        }
        exp.iter()
            .position(|e| prompt.contains(&e.pattern))
            .and_then(|i| exp.remove(i))
            .map(|e| e.messages)
    }
}

/// Builder for setting up mock expectations
pub struct ExpectationBuilder {
    backend: MockBackend,
    pattern: String,
}

impl ExpectationBuilder {
    /// Respond with a sequence of messages
    pub fn respond_with(self, messages: Vec<AgentMessage>) -> MockBackend {
        self.backend
            .expectations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Expectation {
                pattern: self.pattern,
                messages,
            });
        self.backend
    }

    /// Respond with streamed text followed by a successful result
    pub fn respond_text(self, text: &str) -> MockBackend {
        self.respond_with(vec![
            AgentMessage::text(text, None),
            AgentMessage::success(text, None),
        ])
    }
}

impl AgentBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create_session<'a>(&'a self, config: SessionConfig) -> BoxFuture<'a, Result<Session>> {
        Box::pin(async move {
            let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Session::with_id(config, format!("mock-session-{n}")))
        })
    }

    fn resume_session<'a>(
        &'a self,
        config: SessionConfig,
        session_id: &'a str,
        resume_at: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Session>> {
        Box::pin(async move {
            let mut session = Session::with_id(config, session_id);
            session.resume_at = resume_at.map(str::to_string);
            Ok(session)
        })
    }

    fn run_query<'a>(
        &'a self,
        session: &'a mut Session,
        prompt: &'a str,
        options: QueryOptions,
    ) -> BoxStream<'a, AgentMessage> {
        Box::pin(async_stream::stream! {
            session.begin_turn();
            self.prompts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(prompt.to_string());

            if session.claim_init() {
                if let Some(id) = session.id.clone() {
                    yield AgentMessage::init(id);
                }
            }

            if options.abort.is_cancelled() {
                yield AgentMessage::failure(ResultSubtype::Abort, "query cancelled");
                return;
            }

            match self.take_messages(prompt) {
                Some(messages) => {
                    for message in messages {
                        yield message;
                    }
                }
                None => {
                    yield AgentMessage::success(format!("Mock: no expectation for '{prompt}'"), None);
                }
            }
        })
    }

    fn run_multi_turn_query<'a>(
        &'a self,
        session: &'a mut Session,
        initial_prompt: &'a str,
        mailbox: &'a Mailbox,
        options: QueryOptions,
    ) -> BoxStream<'a, AgentMessage> {
        sequential_turns(self, session, initial_prompt, mailbox, options)
    }

    fn abort_session<'a>(&'a self, _session: &'a Session) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}
