// ABOUTME: HTTP client for an OpenCode server: sessions, async prompts, abort, and the SSE event feed.
// ABOUTME: Connection failures at session creation surface as BackendUnavailable.

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{retry, Error as EventSourceError, Event, EventSource};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;

use crate::session::SessionMetadata;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The OpenCode server could not be reached when a session was needed
#[derive(Debug, thiserror::Error)]
#[error(
    "OpenCode server unreachable at {url}: {reason}. It is started by the container \
     entrypoint (`opencode serve`); check that it came up before the runner"
)]
pub struct BackendUnavailable {
    pub url: String,
    pub reason: String,
}

/// Session record as returned by the OpenCode API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    #[serde(default, rename = "projectID")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub time: Option<SessionTime>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionTime {
    pub created: Option<i64>,
    pub updated: Option<i64>,
}

impl SessionInfo {
    pub fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            project_id: self.project_id.clone(),
            directory: self.directory.clone(),
            title: self.title.clone(),
            created_at: self.time.as_ref().and_then(|t| t.created),
            updated_at: self.time.as_ref().and_then(|t| t.updated),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenCodeClient {
    http: Client,
    base_url: String,
}

impl OpenCodeClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build OpenCode HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Create a session rooted at `directory`. Not retried.
    pub async fn create_session(&self, directory: &Path, title: Option<&str>) -> Result<SessionInfo> {
        let mut body = json!({});
        if let Some(title) = title {
            body["title"] = json!(title);
        }

        let response = self
            .http
            .post(self.url("/session"))
            .query(&[("directory", directory.to_string_lossy())])
            .json(&body)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        parse_session(response).await
    }

    pub async fn get_session(&self, session_id: &str, directory: &Path) -> Result<SessionInfo> {
        let response = self
            .http
            .get(self.url(&format!("/session/{session_id}")))
            .query(&[("directory", directory.to_string_lossy())])
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        parse_session(response)
            .await
            .with_context(|| format!("OpenCode session {session_id} not found"))
    }

    /// Branch a new session from `message_id`; the original is not modified
    pub async fn fork_session(
        &self,
        session_id: &str,
        message_id: &str,
        directory: &Path,
    ) -> Result<SessionInfo> {
        let response = self
            .http
            .post(self.url(&format!("/session/{session_id}/fork")))
            .query(&[("directory", directory.to_string_lossy())])
            .json(&json!({ "messageID": message_id }))
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        parse_session(response)
            .await
            .with_context(|| format!("Failed to fork OpenCode session {session_id} at {message_id}"))
    }

    /// Queue a prompt; completion is reported on the event feed
    pub async fn prompt_async(&self, session_id: &str, body: &Value, directory: &Path) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/session/{session_id}/prompt_async")))
            .query(&[("directory", directory.to_string_lossy())])
            .json(body)
            .send()
            .await
            .context("Failed to send prompt to OpenCode")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenCode prompt failed {status}: {body}");
        }
        Ok(())
    }

    pub async fn abort(&self, session_id: &str, directory: &Path) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/session/{session_id}/abort")))
            .query(&[("directory", directory.to_string_lossy())])
            .send()
            .await
            .context("Failed to send abort to OpenCode")?;

        if !response.status().is_success() {
            anyhow::bail!("OpenCode abort failed {}", response.status());
        }
        Ok(())
    }

    /// Open the server-sent event feed and wait until the server accepts it
    pub async fn subscribe(&self, directory: &Path) -> Result<EventSubscription> {
        let request = self
            .http
            .get(self.url("/event"))
            .query(&[("directory", directory.to_string_lossy())])
            .header("accept", "text/event-stream");

        let mut source = EventSource::new(request).context("Failed to build OpenCode event request")?;
        // No reconnect: a gap in the feed ends the turn
        source.set_retry_policy(Box::new(retry::Never));

        match source.next().await {
            Some(Ok(Event::Open)) => {}
            Some(Ok(Event::Message(_))) | None => {
                source.close();
                anyhow::bail!("OpenCode event stream ended before it opened");
            }
            Some(Err(EventSourceError::Transport(e))) => {
                source.close();
                return Err(self.unavailable(e));
            }
            Some(Err(EventSourceError::InvalidStatusCode(status, response))) => {
                source.close();
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("OpenCode event stream error {status}: {body}");
            }
            Some(Err(e)) => {
                source.close();
                anyhow::bail!("OpenCode event stream failed to open: {e}");
            }
        }

        tracing::debug!(url = %self.base_url, "Subscribed to OpenCode events");
        Ok(EventSubscription { source })
    }

    fn unavailable(&self, err: reqwest::Error) -> anyhow::Error {
        if err.is_connect() || err.is_timeout() {
            BackendUnavailable {
                url: self.base_url.clone(),
                reason: err.to_string(),
            }
            .into()
        } else {
            anyhow::Error::new(err).context("OpenCode request failed")
        }
    }
}

async fn parse_session(response: reqwest::Response) -> Result<SessionInfo> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("OpenCode session request failed {status}: {body}");
    }
    response
        .json::<SessionInfo>()
        .await
        .context("OpenCode session response missing id")
}

/// Live OpenCode event feed yielding one JSON event at a time
pub struct EventSubscription {
    source: EventSource,
}

impl EventSubscription {
    /// Next decoded event, or None once the feed has ended
    pub async fn next_event(&mut self) -> Option<Value> {
        while let Some(item) = self.source.next().await {
            match item {
                Ok(Event::Open) => {}
                Ok(Event::Message(message)) => match serde_json::from_str::<Value>(&message.data) {
                    Ok(value) => return Some(value),
                    Err(e) => {
                        tracing::warn!(event = %message.event, error = %e, "Skipping unparsable OpenCode event");
                    }
                },
                Err(EventSourceError::StreamEnded) => {
                    tracing::debug!("OpenCode event stream ended");
                    self.source.close();
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "OpenCode event stream failed");
                    self.source.close();
                    return None;
                }
            }
        }
        None
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.source.close();
    }
}
