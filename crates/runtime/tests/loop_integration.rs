//! End-to-end loop tests: one vault, one agent, scripted handlers.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use va_domain::config::Config;
use va_domain::error::{ErrorCode, Result};
use va_domain::handler::{ChatRequest, ChatResponse, LlmHandler, ToolExecutor};
use va_domain::message::{Role, TokenUsage, ToolCall, ToolOutcome};
use va_runtime::{CancelToken, EventKind, LoopEvent, Runtime, TurnRequest};
use va_sessions::Transcript;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Test doubles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ScriptedLlm {
    responses: Mutex<VecDeque<ChatResponse>>,
}

impl ScriptedLlm {
    fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
        })
    }
}

#[async_trait::async_trait]
impl LlmHandler for ScriptedLlm {
    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse> {
        Ok(self.responses.lock().pop_front().unwrap_or_default())
    }
}

/// Always issues a tool call; used for the iteration-cap scenario.
struct ToolLoopLlm;

#[async_trait::async_trait]
impl LlmHandler for ToolLoopLlm {
    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse> {
        Ok(ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "again".into(),
                name: "spin".into(),
                arguments: serde_json::json!({}),
            }],
            usage: None,
        })
    }
}

struct StaticTools;

#[async_trait::async_trait]
impl ToolExecutor for StaticTools {
    async fn execute(
        &self,
        call: &ToolCall,
        _scope: Option<&str>,
        _timeout: Duration,
    ) -> ToolOutcome {
        ToolOutcome {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            result: serde_json::json!("data"),
            error: None,
            duration_ms: 10,
        }
    }

    fn has_tool(&self, _name: &str) -> bool {
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fixtures
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn vault_with_admin() -> tempfile::TempDir {
    let vault = tempfile::tempdir().unwrap();
    let dir = vault.path().join("agents/admin");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("AGENT.md"),
        "---\nid: agent_admin\nname: Admin\ntype: admin\nscope: vault\n---\n\nAdminister the vault.\n\n## identity\n\nThe vault admin.\n",
    )
    .unwrap();
    vault
}

fn agent_dir(vault: &Path) -> std::path::PathBuf {
    vault.join("agents/admin")
}

fn text_response(content: &str) -> ChatResponse {
    ChatResponse {
        content: content.into(),
        tool_calls: Vec::new(),
        usage: Some(TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
            total_tokens: 30,
        }),
    }
}

fn capture_events(runtime: &Runtime) -> Arc<Mutex<Vec<LoopEvent>>> {
    let captured: Arc<Mutex<Vec<LoopEvent>>> = Arc::default();
    let captured2 = captured.clone();
    runtime
        .bus()
        .subscribe_all(move |e| captured2.lock().push(e.clone()));
    captured
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn happy_path_turn() {
    let vault = vault_with_admin();
    let runtime = Runtime::new(
        Config::default(),
        ScriptedLlm::new(vec![text_response("Hi!")]),
        Arc::new(StaticTools),
    );
    let events = capture_events(&runtime);

    let outcome = runtime
        .run_turn(
            TurnRequest::new(vault.path(), "agent_admin", "Hello"),
            &CancelToken::new(),
        )
        .await;

    assert!(outcome.success, "turn failed: {:?}", outcome.error);
    assert_eq!(outcome.response, "Hi!");
    assert_eq!(outcome.usage.total_tokens, 30);

    let session_id = outcome.session_id.unwrap();
    let transcript = Transcript::read(&agent_dir(vault.path()), &session_id).unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[0].content, "Hello");
    assert_eq!(transcript[1].role, Role::Assistant);

    let session = runtime
        .sessions()
        .get_session(&agent_dir(vault.path()), &session_id)
        .unwrap()
        .unwrap();
    assert_eq!(session.message_count, 2);

    // Lock released, no memory written.
    assert!(runtime.locks().holder(&session_id).is_none());
    assert!(!agent_dir(vault.path()).join("MEMORY.md").exists());

    // loop:end carries success and the accumulated usage.
    let events = events.lock();
    let end = events
        .iter()
        .find(|e| e.data.kind() == EventKind::LoopEnd)
        .unwrap();
    match &end.data {
        va_runtime::EventData::LoopEnd { success, usage, .. } => {
            assert!(*success);
            assert_eq!(usage.total_tokens, 30);
        }
        _ => unreachable!(),
    }
    assert_eq!(end.run_id, outcome.run_id);
}

#[tokio::test]
async fn tool_loop_turn_orders_the_transcript() {
    let vault = vault_with_admin();
    let runtime = Runtime::new(
        Config::default(),
        ScriptedLlm::new(vec![
            ChatResponse {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: "c1".into(),
                    name: "read_file".into(),
                    arguments: serde_json::json!({"path": "/t"}),
                }],
                usage: None,
            },
            text_response("File: data"),
        ]),
        Arc::new(StaticTools),
    );

    let outcome = runtime
        .run_turn(
            TurnRequest::new(vault.path(), "agent_admin", "read it"),
            &CancelToken::new(),
        )
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.response, "File: data");

    let session_id = outcome.session_id.unwrap();
    let transcript = Transcript::read(&agent_dir(vault.path()), &session_id).unwrap();
    let roles: Vec<Role> = transcript.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::System, Role::Assistant]
    );
    let meta = transcript[1].metadata.as_ref().unwrap();
    assert_eq!(meta.tool_calls.as_ref().unwrap()[0].id, "c1");
    assert!(transcript[2].is_tool_result());
    assert_eq!(
        transcript[2].metadata.as_ref().unwrap().tool_name.as_deref(),
        Some("read_file")
    );
    assert_eq!(transcript[3].content, "File: data");
}

#[tokio::test]
async fn lock_conflict_fails_second_turn_until_first_finishes() {
    let vault = vault_with_admin();
    let runtime = Runtime::new(
        Config::default(),
        ScriptedLlm::new(vec![text_response("one"), text_response("two")]),
        Arc::new(StaticTools),
    );

    // Pre-create the session and hold its lock like an in-flight turn.
    let session = runtime
        .sessions()
        .create_session(&agent_dir(vault.path()), "agent_admin")
        .unwrap();
    runtime
        .locks()
        .acquire(&session.id, "other-run", Duration::from_secs(60))
        .unwrap();

    let outcome = runtime
        .run_turn(
            TurnRequest::new(vault.path(), "agent_admin", "second"),
            &CancelToken::new(),
        )
        .await;
    assert!(!outcome.success);
    assert_eq!(outcome.error_code, Some(ErrorCode::LockHeld));
    // Failed before any LLM call: nothing was appended.
    let transcript = Transcript::read(&agent_dir(vault.path()), &session.id).unwrap();
    assert!(transcript.is_empty());

    // Once the first run releases, a retry succeeds.
    runtime.locks().release(&session.id, "other-run");
    let retried = runtime
        .run_turn(
            TurnRequest::new(vault.path(), "agent_admin", "second again"),
            &CancelToken::new(),
        )
        .await;
    assert!(retried.success);
    assert!(runtime.locks().holder(&session.id).is_none());
}

#[tokio::test]
async fn iteration_cap_returns_the_literal_response() {
    let vault = vault_with_admin();
    let config: Config = toml::from_str(
        r#"
        [execute]
        max_tool_iterations = 3
        retry_base_delay_ms = 1
        "#,
    )
    .unwrap();
    let runtime = Runtime::new(config, Arc::new(ToolLoopLlm), Arc::new(StaticTools));

    let outcome = runtime
        .run_turn(
            TurnRequest::new(vault.path(), "agent_admin", "spin forever"),
            &CancelToken::new(),
        )
        .await;

    assert_eq!(outcome.response, "[Max tool iterations reached]");
    let session_id = outcome.session_id.unwrap();
    assert!(runtime.locks().holder(&session_id).is_none());
}

#[tokio::test]
async fn aborted_turn_still_persists_and_releases() {
    let vault = vault_with_admin();
    let runtime = Runtime::new(
        Config::default(),
        ScriptedLlm::new(vec![text_response("never")]),
        Arc::new(StaticTools),
    );

    let cancel = CancelToken::new();
    cancel.cancel();
    let outcome = runtime
        .run_turn(
            TurnRequest::new(vault.path(), "agent_admin", "please stop"),
            &cancel,
        )
        .await;

    assert!(outcome.aborted);
    assert!(!outcome.success);
    assert_eq!(outcome.response, "[Aborted]");

    // The partial transcript is durable and the lock is gone.
    let session_id = outcome.session_id.unwrap();
    let transcript = Transcript::read(&agent_dir(vault.path()), &session_id).unwrap();
    assert_eq!(transcript[0].content, "please stop");
    assert!(runtime.locks().holder(&session_id).is_none());
}

#[tokio::test]
async fn unknown_agent_is_a_user_error() {
    let vault = vault_with_admin();
    let runtime = Runtime::new(
        Config::default(),
        ScriptedLlm::new(Vec::new()),
        Arc::new(StaticTools),
    );
    let events = capture_events(&runtime);

    let outcome = runtime
        .run_turn(
            TurnRequest::new(vault.path(), "nobody", "hello"),
            &CancelToken::new(),
        )
        .await;
    assert!(!outcome.success);
    assert_eq!(outcome.error_code, Some(ErrorCode::AgentNotFound));
    assert!(outcome.response.starts_with("[Error:"));

    let events = events.lock();
    assert!(events.iter().any(|e| matches!(
        &e.data,
        va_runtime::EventData::LoopError {
            stage: va_runtime::Stage::Intake,
            ..
        }
    )));
}

#[tokio::test]
async fn consecutive_turns_grow_one_session() {
    let vault = vault_with_admin();
    let runtime = Runtime::new(
        Config::default(),
        ScriptedLlm::new(vec![text_response("first"), text_response("second")]),
        Arc::new(StaticTools),
    );

    let one = runtime
        .run_turn(
            TurnRequest::new(vault.path(), "agent_admin", "turn one"),
            &CancelToken::new(),
        )
        .await;
    let two = runtime
        .run_turn(
            TurnRequest::new(vault.path(), "agent_admin", "turn two"),
            &CancelToken::new(),
        )
        .await;

    assert_eq!(one.session_id, two.session_id);
    let session_id = two.session_id.unwrap();
    let session = runtime
        .sessions()
        .get_session(&agent_dir(vault.path()), &session_id)
        .unwrap()
        .unwrap();
    // Two turns, two messages each.
    assert_eq!(session.message_count, 4);

    let transcript = Transcript::read(&agent_dir(vault.path()), &session_id).unwrap();
    let contents: Vec<&str> = transcript.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["turn one", "first", "turn two", "second"]);
}
