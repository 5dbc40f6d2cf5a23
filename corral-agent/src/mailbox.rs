// ABOUTME: Filesystem-backed mailbox used to inject follow-up turns into a running session.
// ABOUTME: Entries are JSON files consumed at most once; an empty `_close` file requests shutdown.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Name of the zero-byte file that asks the runner to stop taking turns
pub const CLOSE_SENTINEL: &str = "_close";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

// Keeps same-millisecond entries from one writer in enqueue order
static ENQUEUE_SEQ: AtomicU64 = AtomicU64::new(0);

/// On-disk shape of one mailbox entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailboxEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl MailboxEntry {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            text: text.into(),
        }
    }
}

/// What the multi-turn loop should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextTurn {
    /// Prompt for the next turn (pending texts joined by newline)
    Prompt(String),
    /// No more turns
    Close,
}

/// A single-writer, single-reader queue over one input directory.
///
/// Dequeue is read-then-delete with no locking. A file that disappears
/// between listing and reading counts as already consumed.
#[derive(Debug)]
pub struct Mailbox {
    input_dir: PathBuf,
    poll_interval: Duration,
    close_deferred: AtomicBool,
}

impl Mailbox {
    pub fn new(input_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            close_deferred: AtomicBool::new(false),
        }
    }

    /// Mailbox for an `ipc/` root (entries live in `ipc/input/`)
    pub fn for_ipc_root(ipc_dir: &Path) -> Self {
        Self::new(ipc_dir.join("input"))
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    /// Read and delete every pending entry, in filename order.
    ///
    /// An entry is returned only after its file is gone, so a failed delete
    /// leaves it for a later drain instead of delivering it twice. Corrupt
    /// entries are deleted and skipped. Returns an empty list when the
    /// directory does not exist yet.
    pub async fn drain_pending(&self) -> Vec<String> {
        let mut names = match self.list_entries().await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(dir = %self.input_dir.display(), error = %e, "Failed to list mailbox");
                return Vec::new();
            }
        };
        names.sort();

        let mut texts = Vec::with_capacity(names.len());
        for name in names {
            let path = self.input_dir.join(&name);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "Unreadable mailbox entry, discarding");
                    remove_quietly(&path).await;
                    continue;
                }
            };
            // Only an entry this reader managed to delete is delivered
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "Cannot consume mailbox entry, leaving it queued");
                    continue;
                }
            }

            match serde_json::from_str::<MailboxEntry>(&content) {
                Ok(entry) if entry.kind == "message" => texts.push(entry.text),
                Ok(entry) => {
                    tracing::warn!(file = %name, kind = %entry.kind, "Ignoring mailbox entry of unknown type");
                }
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "Corrupt mailbox entry, discarding");
                }
            }
        }

        texts
    }

    /// Consume the close sentinel if present. A second call returns false.
    pub async fn is_close_requested(&self) -> bool {
        match tokio::fs::remove_file(self.input_dir.join(CLOSE_SENTINEL)).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to consume close sentinel");
                false
            }
        }
    }

    /// Wait for the next turn's prompt or a close request.
    ///
    /// Pending messages win over a close seen in the same poll; the close is
    /// then returned by the following call. Cancellation counts as close.
    pub async fn await_next(&self, cancel: &CancellationToken) -> NextTurn {
        loop {
            if self.close_deferred.swap(false, Ordering::SeqCst) {
                return NextTurn::Close;
            }

            let close = self.is_close_requested().await;
            let pending = self.drain_pending().await;

            if !pending.is_empty() {
                if close {
                    tracing::debug!("Close requested with messages pending; deferring close");
                    self.close_deferred.store(true, Ordering::SeqCst);
                }
                return NextTurn::Prompt(pending.join("\n"));
            }
            if close {
                return NextTurn::Close;
            }

            tokio::select! {
                _ = cancel.cancelled() => return NextTurn::Close,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Queue a message. The file appears under its final name atomically.
    pub async fn enqueue(&self, text: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.input_dir)
            .await
            .with_context(|| format!("Failed to create mailbox {}", self.input_dir.display()))?;

        let name = format!(
            "{}-{:06}-{}.json",
            chrono::Utc::now().timestamp_millis(),
            ENQUEUE_SEQ.fetch_add(1, Ordering::SeqCst) % 1_000_000,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let path = self.input_dir.join(&name);
        let tmp = self.input_dir.join(format!(".{name}.tmp"));

        let body = serde_json::to_vec(&MailboxEntry::message(text))?;
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to publish {}", path.display()))?;

        tracing::debug!(file = %name, "Queued mailbox message");
        Ok(path)
    }

    /// Drop the close sentinel into the mailbox
    pub async fn request_close(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.input_dir).await?;
        tokio::fs::write(self.input_dir.join(CLOSE_SENTINEL), b"")
            .await
            .context("Failed to write close sentinel")?;
        Ok(())
    }

    /// Remove a leftover close sentinel. Returns true if one was there.
    pub async fn clear_close(&self) -> Result<bool> {
        match tokio::fs::remove_file(self.input_dir.join(CLOSE_SENTINEL)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context("Failed to remove close sentinel"),
        }
    }

    async fn list_entries(&self) -> std::io::Result<Vec<String>> {
        let mut dir = match tokio::fs::read_dir(&self.input_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".json") && !name.starts_with('.') {
                names.push(name);
            }
        }
        Ok(names)
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            tracing::warn!(file = %path.display(), error = %e, "Failed to delete mailbox entry");
        }
    }
}
