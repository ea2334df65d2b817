//! Append-only JSONL transcripts.
//!
//! Every message is one JSON line in `sessions/<id>/transcript.jsonl`. Lines
//! are never rewritten; compaction and pruning operate on the in-memory view
//! only. A malformed line is skipped with a warning instead of poisoning the
//! whole file.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;

use va_domain::error::Result;
use va_domain::message::{Message, MessageDraft};
use va_domain::trace::TraceEvent;

use crate::store::session_dir;

/// Reads and appends session transcripts.
pub struct Transcript;

impl Transcript {
    fn path(agent_path: &Path, session_id: &str) -> PathBuf {
        session_dir(agent_path, session_id).join("transcript.jsonl")
    }

    /// Append one message, assigning its id and timestamp. Returns the
    /// stored message.
    pub fn append(agent_path: &Path, session_id: &str, draft: MessageDraft) -> Result<Message> {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            role: draft.role,
            content: draft.content,
            timestamp: Utc::now(),
            metadata: draft.metadata,
        };

        let path = Self::path(agent_path, session_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut line = serde_json::to_string(&message)?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(line.as_bytes())?;

        TraceEvent::TranscriptAppend {
            session_id: session_id.to_owned(),
            messages: 1,
        }
        .emit();

        Ok(message)
    }

    /// Read the full transcript in file order. A missing file yields an
    /// empty sequence, not an error.
    pub fn read(agent_path: &Path, session_id: &str) -> Result<Vec<Message>> {
        let path = Self::path(agent_path, session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(&path)?;
        let mut messages = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    tracing::warn!(
                        session_id = session_id,
                        error = %e,
                        "skipping malformed transcript line"
                    );
                }
            }
        }
        Ok(messages)
    }
}
