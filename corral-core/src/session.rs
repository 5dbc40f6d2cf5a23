// ABOUTME: Persistent session ids per group using a SQLite database.
// ABOUTME: Lets the next container run for a group resume the agent session the last one left.

use anyhow::{Context, Result};
use corral_agent::BackendKind;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupSession {
    pub group_folder: String,
    pub session_id: String,
    /// Session ids only mean something to the backend that issued them
    pub backend: BackendKind,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct SessionStore {
    db: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SessionStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir).context("Failed to create data directory")?;

        let db_path = data_dir.join("sessions.db");
        let conn = Connection::open(&db_path).context("Failed to open SQLite database")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS group_sessions (
                group_folder TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                backend TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        tracing::info!(db = %db_path.display(), "SessionStore initialized");

        Ok(SessionStore {
            db: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }

    pub fn get(&self, group_folder: &str) -> Result<Option<GroupSession>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT group_folder, session_id, backend, updated_at
             FROM group_sessions WHERE group_folder = ?1",
        )?;

        let row = stmt.query_row(params![group_folder], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        });

        match row {
            Ok(row) => Ok(Some(into_session(row)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record the latest session id for a group (upserts)
    pub fn save(&self, group_folder: &str, session_id: &str, backend: BackendKind) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.conn()?;
        db.execute(
            "INSERT INTO group_sessions (group_folder, session_id, backend, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(group_folder) DO UPDATE SET session_id = ?2, backend = ?3, updated_at = ?4",
            params![group_folder, session_id, backend.as_str(), now],
        )?;
        tracing::debug!(group = %group_folder, session_id = %session_id, "Saved group session");
        Ok(())
    }

    /// Forget a group's session so its next run starts fresh
    pub fn clear(&self, group_folder: &str) -> Result<bool> {
        let db = self.conn()?;
        let removed = db.execute(
            "DELETE FROM group_sessions WHERE group_folder = ?1",
            params![group_folder],
        )?;
        if removed > 0 {
            tracing::info!(group = %group_folder, "Cleared group session");
        }
        Ok(removed > 0)
    }

    pub fn list(&self) -> Result<Vec<GroupSession>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT group_folder, session_id, backend, updated_at
             FROM group_sessions ORDER BY group_folder",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(into_session).collect()
    }
}

fn into_session(
    (group_folder, session_id, backend, updated_at): (String, String, String, String),
) -> Result<GroupSession> {
    let backend = backend
        .parse::<BackendKind>()
        .with_context(|| format!("Stored session for '{}' has an unknown backend", group_folder))?;
    Ok(GroupSession {
        group_folder,
        session_id,
        backend,
        updated_at,
    })
}
