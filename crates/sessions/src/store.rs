//! Session metadata store.
//!
//! Each session keeps one `metadata.json` under its own directory. The
//! transcript lives next to it (see [`crate::transcript`]). The store is
//! stateless over the filesystem: every operation is keyed by
//! `(agent_path, session_id)`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use va_domain::error::{Error, Result};
use va_domain::trace::TraceEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session metadata
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Error)
    }
}

/// One session tracked for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    pub agent_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub message_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Partial update merged into session metadata.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub updated_at: Option<DateTime<Utc>>,
    pub message_count: Option<u32>,
    pub title: Option<String>,
    pub status: Option<SessionStatus>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionStore {
    /// An `active` session idle longer than this is treated as ended.
    idle_expiry: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(24)
    }
}

impl SessionStore {
    pub fn new(idle_expiry_hours: u64) -> Self {
        Self {
            idle_expiry: Duration::hours(idle_expiry_hours as i64),
        }
    }

    /// Create a fresh `active` session for the agent.
    pub fn create_session(&self, agent_path: &Path, agent_id: &str) -> Result<SessionMetadata> {
        let now = Utc::now();
        let session = SessionMetadata {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_owned(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            message_count: 0,
            title: None,
        };

        let dir = session_dir(agent_path, &session.id);
        std::fs::create_dir_all(&dir)?;
        write_metadata(&dir, &session)?;

        TraceEvent::SessionCreated {
            session_id: session.id.clone(),
            agent_id: agent_id.to_owned(),
        }
        .emit();

        Ok(session)
    }

    /// Look up a session by id.
    pub fn get_session(
        &self,
        agent_path: &Path,
        session_id: &str,
    ) -> Result<Option<SessionMetadata>> {
        let path = session_dir(agent_path, session_id).join("metadata.json");
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Return the most recently updated `active` session, or create one.
    ///
    /// An active session that has been idle past the expiry horizon is
    /// ended in place rather than resumed.
    pub fn get_or_create_session(
        &self,
        agent_path: &Path,
        agent_id: &str,
    ) -> Result<SessionMetadata> {
        let now = Utc::now();
        let mut sessions = self.list_sessions(agent_path, agent_id)?;
        // list_sessions sorts by updated_at descending.
        for session in sessions.drain(..) {
            if session.status != SessionStatus::Active {
                continue;
            }
            if now - session.updated_at > self.idle_expiry {
                tracing::info!(
                    session_id = %session.id,
                    idle_hours = (now - session.updated_at).num_hours(),
                    "ending idle session"
                );
                self.end_session(agent_path, &session.id, SessionStatus::Ended)?;
                continue;
            }
            return Ok(session);
        }
        self.create_session(agent_path, agent_id)
    }

    /// Merge a patch into session metadata.
    pub fn update_session(
        &self,
        agent_path: &Path,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<SessionMetadata> {
        let mut session = self
            .get_session(agent_path, session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_owned()))?;

        session.updated_at = patch.updated_at.unwrap_or_else(Utc::now);
        if let Some(count) = patch.message_count {
            session.message_count = count;
        }
        if let Some(title) = patch.title {
            session.title = Some(title);
        }
        if let Some(status) = patch.status {
            session.status = status;
        }

        write_metadata(&session_dir(agent_path, session_id), &session)?;
        Ok(session)
    }

    /// Set a terminal status. Idempotent: re-ending an ended session is a no-op.
    pub fn end_session(
        &self,
        agent_path: &Path,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<()> {
        let Some(mut session) = self.get_session(agent_path, session_id)? else {
            return Err(Error::SessionNotFound(session_id.to_owned()));
        };
        if session.status.is_terminal() {
            return Ok(());
        }
        let status = if status.is_terminal() {
            status
        } else {
            SessionStatus::Ended
        };
        session.status = status;
        session.updated_at = Utc::now();
        write_metadata(&session_dir(agent_path, session_id), &session)?;

        TraceEvent::SessionEnded {
            session_id: session_id.to_owned(),
            status: format!("{status:?}").to_lowercase(),
        }
        .emit();
        Ok(())
    }

    /// All sessions for the agent, newest `updated_at` first.
    pub fn list_sessions(&self, agent_path: &Path, agent_id: &str) -> Result<Vec<SessionMetadata>> {
        let root = agent_path.join("sessions");
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            let meta_path = entry.path().join("metadata.json");
            if !meta_path.is_file() {
                continue;
            }
            let raw = std::fs::read_to_string(&meta_path)?;
            match serde_json::from_str::<SessionMetadata>(&raw) {
                Ok(session) if session.agent_id == agent_id => sessions.push(session),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        path = %meta_path.display(),
                        error = %e,
                        "skipping unreadable session metadata"
                    );
                }
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }
}

pub(crate) fn session_dir(agent_path: &Path, session_id: &str) -> PathBuf {
    agent_path.join("sessions").join(session_id)
}

fn write_metadata(dir: &Path, session: &SessionMetadata) -> Result<()> {
    let path = dir.join("metadata.json");
    let tmp = dir.join("metadata.json.tmp");
    let json = serde_json::to_string_pretty(session)?;
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}
