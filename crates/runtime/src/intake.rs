//! INTAKE — resolve the agent, select a session, take the lock.
//!
//! Fails with precise errors: `INVALID_INPUT` for an empty message,
//! `AGENT_NOT_FOUND` when the reference resolves to nothing, `LOCK_HELD`
//! when another run owns the session. No LLM work happens before the lock
//! is held.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use va_agents::{resolve_agent, AgentDefinition};
use va_domain::error::{Error, Result};
use va_sessions::{SessionLease, SessionLockMap, SessionMetadata, SessionStore};

#[derive(Debug, Clone)]
pub struct IntakeRequest {
    pub message: String,
    pub vault_path: PathBuf,
    /// Agent directory path (absolute or vault-relative) or agent id/name.
    pub agent: String,
    /// Resume this session instead of the most recent active one.
    pub session_id: Option<String>,
    /// Force a fresh session.
    pub new_session: bool,
}

#[derive(Debug)]
pub struct IntakeOutput {
    pub run_id: String,
    pub session: SessionMetadata,
    pub agent_path: PathBuf,
    pub definition: AgentDefinition,
    pub lease: SessionLease,
}

pub fn intake(
    request: &IntakeRequest,
    sessions: &SessionStore,
    locks: &SessionLockMap,
    lock_ttl: Duration,
    run_id: &str,
) -> Result<IntakeOutput> {
    if request.message.trim().is_empty() {
        return Err(Error::InvalidInput("message must not be empty".into()));
    }
    if request.agent.trim().is_empty() {
        return Err(Error::InvalidInput("agent reference must not be empty".into()));
    }

    let discovered = resolve_agent(&request.vault_path, &request.agent)?;
    let agent_path = discovered.path;
    let definition = discovered.definition;
    let agent_id = if definition.id.is_empty() {
        // Permissive descriptors may omit the id; fall back to the dir name.
        agent_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| request.agent.clone())
    } else {
        definition.id.clone()
    };

    let session = select_session(request, sessions, &agent_path, &agent_id)?;
    let lease = locks.acquire(&session.id, run_id, lock_ttl)?;

    Ok(IntakeOutput {
        run_id: run_id.to_owned(),
        session,
        agent_path,
        definition,
        lease,
    })
}

/// Fresh run identifier for one loop execution.
pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

fn select_session(
    request: &IntakeRequest,
    sessions: &SessionStore,
    agent_path: &std::path::Path,
    agent_id: &str,
) -> Result<SessionMetadata> {
    if request.new_session {
        return sessions.create_session(agent_path, agent_id);
    }
    if let Some(session_id) = &request.session_id {
        let session = sessions
            .get_session(agent_path, session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.clone()))?;
        if session.status.is_terminal() {
            // A turn never resumes a terminal session.
            return sessions.create_session(agent_path, agent_id);
        }
        return Ok(session);
    }
    sessions.get_or_create_session(agent_path, agent_id)
}
