// ABOUTME: Session state owned by a single backend adapter for one runner invocation.
// ABOUTME: Tracks the backend-assigned id, configuration, metadata, and turn bookkeeping.

use crate::config::SessionConfig;
use serde::{Deserialize, Serialize};

/// Backend-specific descriptive metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    pub project_id: Option<String>,
    pub directory: Option<String>,
    pub title: Option<String>,
    /// Milliseconds since the epoch, as reported by the backend
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Session {
    /// Backend-assigned id. May be absent until the first turn reports it.
    pub id: Option<String>,
    pub config: SessionConfig,
    pub metadata: SessionMetadata,
    /// Prior message id to branch from on the next query
    pub resume_at: Option<String>,
    pub(crate) init_emitted: bool,
    pub(crate) turns: u64,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            id: None,
            config,
            metadata: SessionMetadata::default(),
            resume_at: None,
            init_emitted: false,
            turns: 0,
        }
    }

    pub fn with_id(config: SessionConfig, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(config)
        }
    }

    /// Number of turns started in this session
    pub fn turns(&self) -> u64 {
        self.turns
    }

    /// True once `system/init` has been emitted for this session
    pub fn init_emitted(&self) -> bool {
        self.init_emitted
    }

    /// Record a new turn and return its ordinal (1-based)
    pub(crate) fn begin_turn(&mut self) -> u64 {
        self.turns += 1;
        self.turns
    }

    /// Returns true exactly once per session, the first time it is called
    pub(crate) fn claim_init(&mut self) -> bool {
        !std::mem::replace(&mut self.init_emitted, true)
    }
}
