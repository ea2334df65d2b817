//! PERSIST — make the turn durable and always let go of the session.
//!
//! Appends the turn's messages, patches session metadata, optionally
//! flushes memory updates, and releases the lock in a guaranteed-exit path.
//! Each step retries under the retry manager; memory failures are non-fatal
//! and lock release runs no matter what happened before it.

use std::path::Path;

use chrono::Utc;

use va_domain::config::PersistConfig;
use va_domain::message::{MessageDraft, MessageMetadata, Role};
use va_memory::{MemoryStore, MemoryUpdate};
use va_sessions::{SessionLockMap, SessionPatch, SessionStore, Transcript};

use crate::events::{EventBus, EventData, EventMeta, FlushReason};
use crate::execute::ExecuteOutput;
use crate::retry::{RetryManager, RetryPolicy};

pub struct PersistInput<'a> {
    pub agent_path: &'a Path,
    pub session_id: &'a str,
    pub run_id: &'a str,
    pub user_message: &'a str,
    pub execute: &'a ExecuteOutput,
    /// The final response text as shown to the caller.
    pub response: &'a str,
    pub flush_memory: bool,
    pub flush_reason: FlushReason,
    pub memory_updates: &'a [MemoryUpdate],
}

#[derive(Debug, Clone, Default)]
pub struct PersistOutput {
    pub transcript_updated: bool,
    pub session_updated: bool,
    pub memory_updated: bool,
    pub lock_released: bool,
    pub appended: u32,
    pub errors: Vec<String>,
}

impl PersistOutput {
    /// Every step landed and nothing errored.
    pub fn is_success(&self) -> bool {
        self.transcript_updated
            && self.session_updated
            && self.memory_updated
            && self.lock_released
            && self.errors.is_empty()
    }

    /// A failure the caller must not paper over: the lock is still held or
    /// the transcript lost messages.
    pub fn has_critical_failures(&self) -> bool {
        !self.lock_released || !self.transcript_updated
    }
}

pub async fn persist(
    input: PersistInput<'_>,
    sessions: &SessionStore,
    locks: &SessionLockMap,
    memory: &MemoryStore,
    config: &PersistConfig,
    retry: &RetryManager,
    bus: &EventBus,
    meta: &EventMeta,
) -> PersistOutput {
    let mut output = PersistOutput {
        // Vacuously true until a flush is attempted.
        memory_updated: true,
        ..Default::default()
    };
    let policy = RetryPolicy::with_attempts(
        config.max_retries,
        std::time::Duration::from_millis(config.retry_base_delay_ms),
    );

    // ── 1+2. Build and append the turn's messages ───────────────────
    let agent_path = input.agent_path;
    let session_id = input.session_id;
    let drafts = build_drafts(&input);
    let mut all_appended = true;
    for draft in drafts {
        let appended = retry
            .run_with_policy("persist.append", &policy, None, || {
                let draft = draft.clone();
                async move { Transcript::append(agent_path, session_id, draft).map(|_| ()) }
            })
            .await;
        match appended {
            Ok(()) => output.appended += 1,
            Err(e) => {
                all_appended = false;
                output.errors.push(format!("transcript append: {e}"));
            }
        }
    }
    output.transcript_updated = all_appended;

    // ── 3. Patch session metadata ───────────────────────────────────
    if output.appended > 0 {
        let appended = output.appended;
        let patched = retry
            .run_with_policy("persist.session", &policy, None, || async move {
                let current = sessions
                    .get_session(agent_path, session_id)?
                    .ok_or_else(|| va_domain::Error::SessionNotFound(session_id.to_owned()))?;
                sessions.update_session(
                    agent_path,
                    session_id,
                    SessionPatch {
                        updated_at: Some(Utc::now()),
                        message_count: Some(current.message_count + appended),
                        ..Default::default()
                    },
                )?;
                Ok(())
            })
            .await;
        match patched {
            Ok(()) => output.session_updated = true,
            Err(e) => output.errors.push(format!("session update: {e}")),
        }
    } else {
        output.session_updated = true;
    }

    // ── 4. Flush memory (non-fatal) ─────────────────────────────────
    if input.flush_memory && !input.memory_updates.is_empty() {
        match memory.apply_updates(input.agent_path, input.memory_updates) {
            Ok(outcomes) => {
                let memory_path = input.agent_path.join("MEMORY.md").display().to_string();
                for outcome in &outcomes {
                    bus.emit(
                        meta,
                        EventData::MemoryWrite {
                            memory_path: memory_path.clone(),
                            section: outcome.section.clone(),
                            size_used: outcome.size_used.unwrap_or(0),
                            size_limit: outcome.size_limit.unwrap_or(0),
                            truncated: outcome.truncated,
                            success: outcome.success,
                        },
                    );
                }
                output.memory_updated = outcomes.iter().all(|o| o.success);
                if !output.memory_updated {
                    tracing::warn!(
                        session_id = input.session_id,
                        "some memory updates were rejected"
                    );
                }
                bus.emit(
                    meta,
                    EventData::MemoryFlush {
                        reason: input.flush_reason,
                        updates_count: input.memory_updates.len(),
                        no_reply: true,
                    },
                );
            }
            Err(e) => {
                output.memory_updated = false;
                output.errors.push(format!("memory flush: {e}"));
            }
        }
    }

    // ── 5. Always release the lock ──────────────────────────────────
    let released = locks.release(input.session_id, input.run_id);
    output.lock_released = released
        || locks
            .holder(input.session_id)
            .is_none_or(|lease| lease.run_id != input.run_id);
    if !output.lock_released {
        output.errors.push(format!(
            "lock for session {} still held by run {}",
            input.session_id, input.run_id
        ));
    }

    output
}

/// Messages to append for one turn: the user turn; on tool use, one
/// assistant turn carrying the calls plus one system turn per result; and
/// the final assistant turn with usage.
fn build_drafts(input: &PersistInput<'_>) -> Vec<MessageDraft> {
    let mut drafts = Vec::new();
    drafts.push(MessageDraft::new(Role::User, input.user_message));

    if !input.execute.tool_calls.is_empty() {
        drafts.push(
            MessageDraft::new(Role::Assistant, "").with_metadata(MessageMetadata {
                tool_calls: Some(input.execute.tool_calls.clone()),
                ..Default::default()
            }),
        );
        for result in &input.execute.tool_results {
            let content = match &result.error {
                Some(error) => format!("Error: {error}"),
                None => serde_json::to_string(&result.result)
                    .unwrap_or_else(|_| result.result.to_string()),
            };
            drafts.push(MessageDraft::new(Role::System, content).with_metadata(
                MessageMetadata {
                    tool_result: true,
                    tool_call_id: Some(result.tool_call_id.clone()),
                    tool_name: Some(result.name.clone()),
                    duration_ms: Some(result.duration_ms),
                    ..Default::default()
                },
            ));
        }
    }

    drafts.push(
        MessageDraft::new(Role::Assistant, input.response).with_metadata(MessageMetadata {
            usage: Some(input.execute.usage),
            ..Default::default()
        }),
    );
    drafts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use va_domain::message::{TokenUsage, ToolCall, ToolOutcome};
    use va_memory::WriteOptions;

    fn harness() -> (
        tempfile::TempDir,
        SessionStore,
        SessionLockMap,
        MemoryStore,
        RetryManager,
        EventBus,
        EventMeta,
    ) {
        (
            tempfile::tempdir().unwrap(),
            SessionStore::default(),
            SessionLockMap::new(),
            MemoryStore::default(),
            RetryManager::default(),
            EventBus::new(),
            EventMeta::default(),
        )
    }

    fn execute_output_with_tools() -> ExecuteOutput {
        ExecuteOutput {
            response: "File: data".into(),
            tool_calls: vec![ToolCall {
                id: "c1".into(),
                name: "read_file".into(),
                arguments: serde_json::json!({"path": "/t"}),
            }],
            tool_results: vec![ToolOutcome {
                tool_call_id: "c1".into(),
                name: "read_file".into(),
                result: serde_json::json!("data"),
                error: None,
                duration_ms: 10,
            }],
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 20,
                total_tokens: 30,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn plain_turn_appends_user_and_assistant() {
        let (dir, sessions, locks, memory, retry, bus, meta) = harness();
        let session = sessions.create_session(dir.path(), "a1").unwrap();
        locks
            .acquire(&session.id, "r1", Duration::from_secs(60))
            .unwrap();

        let execute = ExecuteOutput {
            response: "Hi!".into(),
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 20,
                total_tokens: 30,
            },
            ..Default::default()
        };
        let output = persist(
            PersistInput {
                agent_path: dir.path(),
                session_id: &session.id,
                run_id: "r1",
                user_message: "Hello",
                execute: &execute,
                response: "Hi!",
                flush_memory: false,
                flush_reason: FlushReason::Threshold,
                memory_updates: &[],
            },
            &sessions,
            &locks,
            &memory,
            &PersistConfig::default(),
            &retry,
            &bus,
            &meta,
        )
        .await;

        assert!(output.is_success());
        assert_eq!(output.appended, 2);

        let transcript = Transcript::read(dir.path(), &session.id).unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, Role::User);
        assert_eq!(transcript[1].role, Role::Assistant);
        assert_eq!(
            transcript[1].metadata.as_ref().unwrap().usage.unwrap().total_tokens,
            30
        );

        let updated = sessions.get_session(dir.path(), &session.id).unwrap().unwrap();
        assert_eq!(updated.message_count, 2);
        assert!(locks.holder(&session.id).is_none());
    }

    #[tokio::test]
    async fn tool_turn_appends_in_contract_order() {
        let (dir, sessions, locks, memory, retry, bus, meta) = harness();
        let session = sessions.create_session(dir.path(), "a1").unwrap();
        locks
            .acquire(&session.id, "r1", Duration::from_secs(60))
            .unwrap();

        let execute = execute_output_with_tools();
        let output = persist(
            PersistInput {
                agent_path: dir.path(),
                session_id: &session.id,
                run_id: "r1",
                user_message: "read it",
                execute: &execute,
                response: "File: data",
                flush_memory: false,
                flush_reason: FlushReason::Threshold,
                memory_updates: &[],
            },
            &sessions,
            &locks,
            &memory,
            &PersistConfig::default(),
            &retry,
            &bus,
            &meta,
        )
        .await;
        assert!(output.is_success());

        let transcript = Transcript::read(dir.path(), &session.id).unwrap();
        let roles: Vec<Role> = transcript.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::System, Role::Assistant]
        );
        // The assistant tool turn carries the calls; the system turn is a
        // tool result; the final assistant turn carries usage.
        assert!(transcript[1].metadata.as_ref().unwrap().tool_calls.is_some());
        assert!(transcript[2].is_tool_result());
        assert_eq!(transcript[3].content, "File: data");
    }

    #[tokio::test]
    async fn memory_flush_failure_is_non_fatal() {
        let (dir, sessions, locks, _memory, retry, bus, meta) = harness();
        let session = sessions.create_session(dir.path(), "a1").unwrap();
        locks
            .acquire(&session.id, "r1", Duration::from_secs(60))
            .unwrap();

        // A tiny total limit guarantees the flush is rejected.
        let memory = MemoryStore::new(va_domain::config::MemoryConfig {
            total_limit: 10,
            ..Default::default()
        });
        memory
            .write_section(dir.path(), "Notes", "", WriteOptions {
                enforce_limits: false,
                ..Default::default()
            })
            .unwrap();

        let execute = ExecuteOutput {
            response: "done".into(),
            ..Default::default()
        };
        let updates = [MemoryUpdate {
            section: "Notes".into(),
            content: "far too much content for this limit".into(),
            append: false,
        }];
        let output = persist(
            PersistInput {
                agent_path: dir.path(),
                session_id: &session.id,
                run_id: "r1",
                user_message: "hi",
                execute: &execute,
                response: "done",
                flush_memory: true,
                flush_reason: FlushReason::Threshold,
                memory_updates: &updates,
            },
            &sessions,
            &locks,
            &memory,
            &PersistConfig::default(),
            &retry,
            &bus,
            &meta,
        )
        .await;

        assert!(!output.memory_updated);
        assert!(!output.is_success());
        // But nothing critical: transcript landed, lock released.
        assert!(!output.has_critical_failures());
        assert!(output.transcript_updated);
        assert!(output.lock_released);
    }

    #[tokio::test]
    async fn lock_release_happens_even_without_a_held_lock() {
        let (dir, sessions, locks, memory, retry, bus, meta) = harness();
        let session = sessions.create_session(dir.path(), "a1").unwrap();
        // No lock acquired: release is vacuous but reported as released.

        let execute = ExecuteOutput {
            response: "ok".into(),
            ..Default::default()
        };
        let output = persist(
            PersistInput {
                agent_path: dir.path(),
                session_id: &session.id,
                run_id: "r1",
                user_message: "hi",
                execute: &execute,
                response: "ok",
                flush_memory: false,
                flush_reason: FlushReason::Manual,
                memory_updates: &[],
            },
            &sessions,
            &locks,
            &memory,
            &PersistConfig::default(),
            &retry,
            &bus,
            &meta,
        )
        .await;
        assert!(output.lock_released);
    }

    #[tokio::test]
    async fn successful_flush_emits_memory_events() {
        let (dir, sessions, locks, memory, retry, bus, meta) = harness();
        let session = sessions.create_session(dir.path(), "a1").unwrap();
        locks
            .acquire(&session.id, "r1", Duration::from_secs(60))
            .unwrap();

        let captured: std::sync::Arc<parking_lot::Mutex<Vec<crate::events::EventKind>>> =
            Default::default();
        let captured2 = captured.clone();
        let _sub = bus.subscribe_all(move |e| captured2.lock().push(e.data.kind()));

        let execute = ExecuteOutput {
            response: "ok".into(),
            ..Default::default()
        };
        let updates = [MemoryUpdate {
            section: "Key Context".into(),
            content: "flushed".into(),
            append: false,
        }];
        let output = persist(
            PersistInput {
                agent_path: dir.path(),
                session_id: &session.id,
                run_id: "r1",
                user_message: "hi",
                execute: &execute,
                response: "ok",
                flush_memory: true,
                flush_reason: FlushReason::Threshold,
                memory_updates: &updates,
            },
            &sessions,
            &locks,
            &memory,
            &PersistConfig::default(),
            &retry,
            &bus,
            &meta,
        )
        .await;

        assert!(output.is_success());
        let kinds = captured.lock();
        assert!(kinds.contains(&crate::events::EventKind::MemoryWrite));
        assert!(kinds.contains(&crate::events::EventKind::MemoryFlush));

        let readout = memory.read_section(dir.path(), Some("Key Context")).unwrap();
        assert_eq!(readout.content, "flushed");
    }
}
