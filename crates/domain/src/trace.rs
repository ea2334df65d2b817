use serde::Serialize;

/// Structured trace events emitted across all VaultAgent crates.
///
/// These land in the operational log as single JSON lines; the typed loop
/// event bus is a separate, in-process surface.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionCreated {
        session_id: String,
        agent_id: String,
    },
    SessionEnded {
        session_id: String,
        status: String,
    },
    TranscriptAppend {
        session_id: String,
        messages: usize,
    },
    LockAcquired {
        session_id: String,
        run_id: String,
        reaped_expired: bool,
    },
    LockReleased {
        session_id: String,
        run_id: String,
    },
    MemorySaved {
        agent_id: String,
        version: u64,
        total_size: usize,
    },
    MailSent {
        message_id: String,
        from: String,
        to: String,
    },
    RetryEscalated {
        operation_id: String,
        attempts: u32,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "va_event");
    }
}
