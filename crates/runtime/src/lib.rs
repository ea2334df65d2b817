//! The agent execution loop.
//!
//! One turn runs INTAKE → CONTEXT → EXECUTE → PERSIST. A fatal error at any
//! stage emits `loop:error` and jumps straight to PERSIST so the session
//! lock is always released and whatever was produced stays durable. The
//! event bus is emitted into at every boundary.

pub mod cancel;
pub mod compact;
pub mod context;
pub mod events;
pub mod execute;
pub mod intake;
pub mod persist;
pub mod prune;
pub mod retry;

pub use cancel::CancelToken;
pub use events::{EventBus, EventData, EventKind, EventMeta, FlushReason, LoopEvent, Stage};
pub use retry::{RetryManager, RetryPolicy, RetryState, RetryStats};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use va_domain::config::Config;
use va_domain::error::{Error, ErrorCode};
use va_domain::handler::{LlmHandler, ToolExecutor};
use va_domain::message::TokenUsage;
use va_memory::{MemoryStore, MemoryUpdate};
use va_sessions::{SessionLockMap, SessionStore};

use crate::compact::CompactionBudget;
use crate::context::{build_context, context_requires_action, ContextAction};
use crate::execute::{execute, ExecuteInput, ExecuteOutput};
use crate::intake::{intake, new_run_id, IntakeRequest};
use crate::persist::{persist, PersistInput, PersistOutput};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub vault_path: PathBuf,
    /// Agent directory path or agent id/name.
    pub agent: String,
    pub message: String,
    pub session_id: Option<String>,
    pub new_session: bool,
    /// Accumulated working-memory updates to flush when the loop decides to.
    pub memory_updates: Vec<MemoryUpdate>,
}

impl TurnRequest {
    pub fn new(vault_path: impl Into<PathBuf>, agent: &str, message: &str) -> Self {
        Self {
            vault_path: vault_path.into(),
            agent: agent.to_owned(),
            message: message.to_owned(),
            session_id: None,
            new_session: false,
            memory_updates: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub run_id: String,
    pub session_id: Option<String>,
    pub response: String,
    pub usage: TokenUsage,
    pub success: bool,
    pub aborted: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    /// Absent when the turn failed before acquiring a session.
    pub persist: Option<PersistOutput>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The vault-resident agent runtime: stores, lock map, event bus, retry
/// manager, and the two consumed capabilities.
pub struct Runtime {
    config: Config,
    sessions: SessionStore,
    locks: SessionLockMap,
    memory: MemoryStore,
    retry: RetryManager,
    bus: EventBus,
    llm: Arc<dyn LlmHandler>,
    tools: Arc<dyn ToolExecutor>,
}

impl Runtime {
    pub fn new(config: Config, llm: Arc<dyn LlmHandler>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            sessions: SessionStore::new(config.sessions.idle_expiry_hours),
            locks: SessionLockMap::new(),
            memory: MemoryStore::new(config.memory),
            retry: RetryManager::new(RetryPolicy::from_config(&config.retry)),
            bus: EventBus::new(),
            config,
            llm,
            tools,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn retry(&self) -> &RetryManager {
        &self.retry
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn locks(&self) -> &SessionLockMap {
        &self.locks
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Run one turn. Never panics across the boundary; every exit path has
    /// released the session lock and emitted `loop:end`.
    pub async fn run_turn(&self, request: TurnRequest, cancel: &CancelToken) -> TurnOutcome {
        let started = Instant::now();
        let run_id = new_run_id();
        let mut meta = EventMeta {
            run_id: run_id.clone(),
            ..Default::default()
        };

        // ── INTAKE ──────────────────────────────────────────────────
        let intake_request = IntakeRequest {
            message: request.message.clone(),
            vault_path: request.vault_path.clone(),
            agent: request.agent.clone(),
            session_id: request.session_id.clone(),
            new_session: request.new_session,
        };
        let lock_ttl = Duration::from_secs(self.config.lock.ttl_secs);
        let intake_output =
            match intake(&intake_request, &self.sessions, &self.locks, lock_ttl, &run_id) {
                Ok(output) => output,
                Err(error) => {
                    // No lock held yet; fail without a persist pass.
                    self.bus.emit(
                        &meta,
                        EventData::LoopError {
                            stage: Stage::Intake,
                            error: error.to_string(),
                            code: Some(error.code()),
                        },
                    );
                    return self.finish_turn(
                        started,
                        run_id,
                        &meta,
                        None,
                        format!("[Error: {error}]"),
                        TokenUsage::default(),
                        false,
                        Some(error),
                        None,
                    );
                }
            };

        meta.session_id = intake_output.session.id.clone();
        meta.agent_id = intake_output.session.agent_id.clone();
        self.bus.emit(
            &meta,
            EventData::LoopStart {
                message: request.message.clone(),
            },
        );

        // ── CONTEXT ─────────────────────────────────────────────────
        let context_output = build_context(
            &intake_output.definition,
            &intake_output.agent_path,
            &intake_output.session.id,
            &request.message,
            &self.memory,
            self.tools.as_ref(),
            &self.config.context,
            &self.bus,
            &meta,
        );
        let context_output = match context_output {
            Ok(output) => {
                self.bus.emit(
                    &meta,
                    EventData::LoopContext {
                        token_estimate: output.token_estimate,
                        history_length: output.history.len(),
                        needs_compaction: output.needs_compaction,
                        needs_flush: output.needs_flush,
                    },
                );
                output
            }
            Err(error) => {
                self.bus.emit(
                    &meta,
                    EventData::LoopError {
                        stage: Stage::Context,
                        error: error.to_string(),
                        code: Some(error.code()),
                    },
                );
                // Jump to PERSIST so the lock is released.
                let execute_output = ExecuteOutput::default();
                let response = format!("[Error: {error}]");
                let persist_output = self
                    .persist_turn(
                        &intake_output,
                        &request,
                        &execute_output,
                        &response,
                        false,
                        FlushReason::Manual,
                        &meta,
                    )
                    .await;
                return self.finish_turn(
                    started,
                    run_id,
                    &meta,
                    Some(intake_output.session.id.clone()),
                    response,
                    TokenUsage::default(),
                    false,
                    Some(error),
                    Some(persist_output),
                );
            }
        };

        // Compaction rewrites the in-memory view only; flushing is decided
        // here and performed by PERSIST.
        let action = context_requires_action(&context_output);
        let mut history = context_output.history;
        if action == ContextAction::Compact {
            let usable = self
                .config
                .context
                .context_window
                .saturating_sub(self.config.context.reserve_tokens);
            let budget = CompactionBudget {
                max_total_tokens: usable,
                summary_budget: self.config.compaction.summary_budget,
                preserve_recent: self.config.compaction.preserve_recent,
                preserve_important: self.config.compaction.preserve_important,
            };
            let result =
                compact::compact(&history, &budget, Some(self.llm.as_ref()), &self.bus, &meta)
                    .await;
            history = result.messages;
        }
        let flush_memory = action != ContextAction::None && !request.memory_updates.is_empty();
        let flush_reason = match action {
            ContextAction::Compact => FlushReason::CompactionPending,
            _ => FlushReason::Threshold,
        };

        // ── EXECUTE ─────────────────────────────────────────────────
        let execute_input = ExecuteInput {
            user_message: request.message.clone(),
            system_prompt: context_output.system_prompt,
            history,
            tools: context_output.tools,
            scope: intake_output.definition.scope.clone(),
        };
        let execute_output = execute(
            execute_input,
            self.llm.as_ref(),
            self.tools.as_ref(),
            &self.config.execute,
            &self.retry,
            cancel,
            &self.bus,
            &meta,
        )
        .await;

        self.bus.emit(
            &meta,
            EventData::LoopExecute {
                tool_call_count: execute_output.tool_calls.len(),
                usage: execute_output.usage,
            },
        );
        if let Some(error) = &execute_output.error {
            self.bus.emit(
                &meta,
                EventData::LoopError {
                    stage: Stage::Execute,
                    error: error.clone(),
                    code: execute_output.error_code,
                },
            );
        }

        // The user-visible response is always at least a tagged string.
        let response = if !execute_output.response.is_empty() {
            execute_output.response.clone()
        } else if execute_output.aborted {
            "[Aborted]".to_owned()
        } else if let Some(error) = &execute_output.error {
            format!("[Error: {error}]")
        } else {
            String::new()
        };

        // ── PERSIST ─────────────────────────────────────────────────
        let persist_output = self
            .persist_turn(
                &intake_output,
                &request,
                &execute_output,
                &response,
                flush_memory && !execute_output.aborted,
                flush_reason,
                &meta,
            )
            .await;

        let success = execute_output.error.is_none()
            && !execute_output.aborted
            && !persist_output.has_critical_failures();
        let error = execute_output.error.clone().map(Error::Other);

        let mut outcome = self.finish_turn(
            started,
            run_id,
            &meta,
            Some(intake_output.session.id.clone()),
            response,
            execute_output.usage,
            success,
            error,
            Some(persist_output),
        );
        outcome.aborted = execute_output.aborted;
        outcome.error_code = execute_output.error_code.or(outcome.error_code);
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_turn(
        &self,
        intake_output: &intake::IntakeOutput,
        request: &TurnRequest,
        execute_output: &ExecuteOutput,
        response: &str,
        flush_memory: bool,
        flush_reason: FlushReason,
        meta: &EventMeta,
    ) -> PersistOutput {
        let output = persist(
            PersistInput {
                agent_path: &intake_output.agent_path,
                session_id: &intake_output.session.id,
                run_id: &intake_output.run_id,
                user_message: &request.message,
                execute: execute_output,
                response,
                flush_memory,
                flush_reason,
                memory_updates: &request.memory_updates,
            },
            &self.sessions,
            &self.locks,
            &self.memory,
            &self.config.persist,
            &self.retry,
            &self.bus,
            meta,
        )
        .await;

        self.bus.emit(
            meta,
            EventData::LoopPersist {
                transcript_updated: output.transcript_updated,
                session_updated: output.session_updated,
                memory_updated: output.memory_updated,
                lock_released: output.lock_released,
            },
        );
        if output.has_critical_failures() {
            self.bus.emit(
                meta,
                EventData::LoopError {
                    stage: Stage::Persist,
                    error: output.errors.join("; "),
                    code: None,
                },
            );
        }
        output
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_turn(
        &self,
        started: Instant,
        run_id: String,
        meta: &EventMeta,
        session_id: Option<String>,
        response: String,
        usage: TokenUsage,
        success: bool,
        error: Option<Error>,
        persist: Option<PersistOutput>,
    ) -> TurnOutcome {
        let duration_ms = started.elapsed().as_millis() as u64;
        self.bus.emit(
            meta,
            EventData::LoopEnd {
                success,
                duration_ms,
                usage,
            },
        );
        TurnOutcome {
            run_id,
            session_id,
            response,
            usage,
            success,
            aborted: false,
            duration_ms,
            error_code: error.as_ref().map(|e| e.code()),
            error: error.map(|e| e.to_string()),
            persist,
        }
    }
}
