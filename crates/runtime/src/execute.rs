//! EXECUTE — the bounded tool loop.
//!
//! One iteration: call the model (under the retry manager), run any tool
//! calls it issued, feed the results back, repeat until a final text
//! response lands or a limit is hit. Never throws across its boundary: the
//! output carries the accumulated state plus `aborted`/`error` flags.

use std::time::{Duration, Instant};

use va_domain::config::ExecuteConfig;
use va_domain::error::{Error, ErrorCode};
use va_domain::handler::{ChatMessage, ChatRequest, LlmHandler, ToolDefinition, ToolExecutor};
use va_domain::message::{Message, Role, TokenUsage, ToolCall, ToolOutcome};

use crate::cancel::CancelToken;
use crate::events::{EventBus, EventData, EventMeta};
use crate::retry::{RetryManager, RetryPolicy};

/// Response text when the iteration cap is hit without a final answer.
pub const MAX_ITERATIONS_RESPONSE: &str = "[Max tool iterations reached]";

pub struct ExecuteInput {
    pub user_message: String,
    pub system_prompt: String,
    pub history: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    /// Forwarded unchanged to the tool executor.
    pub scope: Option<String>,
}

#[derive(Debug, Default)]
pub struct ExecuteOutput {
    pub response: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolOutcome>,
    pub usage: TokenUsage,
    pub aborted: bool,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub iterations: u32,
}

impl ExecuteOutput {
    fn failed(mut self, error: Error) -> Self {
        self.error_code = Some(error.code());
        self.error = Some(error.to_string());
        self
    }
}

pub async fn execute(
    input: ExecuteInput,
    llm: &dyn LlmHandler,
    tools: &dyn ToolExecutor,
    config: &ExecuteConfig,
    retry: &RetryManager,
    cancel: &CancelToken,
    bus: &EventBus,
    meta: &EventMeta,
) -> ExecuteOutput {
    let started = Instant::now();
    let execution_timeout = Duration::from_millis(config.execution_timeout_ms);
    let tool_timeout = Duration::from_millis(config.tool_timeout_ms);
    let llm_policy = RetryPolicy::with_attempts(
        config.max_retries,
        Duration::from_millis(config.retry_base_delay_ms),
    );

    let mut output = ExecuteOutput::default();
    let mut messages: Vec<ChatMessage> = input
        .history
        .iter()
        .map(|m| ChatMessage::new(m.role, m.content.clone()))
        .collect();
    messages.push(ChatMessage::new(Role::User, input.user_message.clone()));

    for iteration in 1..=config.max_tool_iterations {
        output.iterations = iteration;

        // Abort wins over everything else.
        if cancel.is_cancelled() {
            output.aborted = true;
            return output;
        }
        if started.elapsed() > execution_timeout {
            return output.failed(Error::ExecutionTimeout(config.execution_timeout_ms));
        }

        bus.emit(meta, EventData::LlmStart { iteration });

        let request = ChatRequest {
            system_prompt: input.system_prompt.clone(),
            messages: messages.clone(),
            tools: input.tools.clone(),
        };
        let response = match retry
            .run_with_policy("llm.chat", &llm_policy, Some(cancel), || llm.chat(&request))
            .await
        {
            Ok(response) => response,
            Err(Error::Aborted) => {
                output.aborted = true;
                return output;
            }
            Err(error) => return output.failed(error),
        };

        if let Some(usage) = &response.usage {
            output.usage.accumulate(usage);
        }
        bus.emit(
            meta,
            EventData::LlmEnd {
                iteration,
                has_tool_calls: response.has_tool_calls(),
                usage: response.usage,
            },
        );

        if !response.has_tool_calls() {
            output.response = response.content;
            return output;
        }

        // Record the assistant turn, then run each call and feed the
        // result back as a tool message.
        messages.push(ChatMessage::new(Role::Assistant, response.content.clone()));
        for call in response.tool_calls {
            if cancel.is_cancelled() {
                output.aborted = true;
                return output;
            }

            bus.emit(
                meta,
                EventData::ToolStart {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            );

            let tool_started = Instant::now();
            let outcome = match tokio::time::timeout(
                tool_timeout,
                tools.execute(&call, input.scope.as_deref(), tool_timeout),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    let error = Error::ToolTimeout {
                        tool: call.name.clone(),
                        timeout_ms: config.tool_timeout_ms,
                    };
                    bus.emit(
                        meta,
                        EventData::ToolEnd {
                            tool_call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            duration_ms: tool_started.elapsed().as_millis() as u64,
                            success: false,
                            error: Some(error.to_string()),
                        },
                    );
                    output.tool_calls.push(call);
                    return output.failed(error);
                }
            };

            bus.emit(
                meta,
                EventData::ToolEnd {
                    tool_call_id: outcome.tool_call_id.clone(),
                    tool_name: outcome.name.clone(),
                    duration_ms: outcome.duration_ms,
                    success: !outcome.is_error(),
                    error: outcome.error.clone(),
                },
            );

            let content = match &outcome.error {
                Some(error) => format!("Error: {error}"),
                None => serde_json::to_string(&outcome.result)
                    .unwrap_or_else(|_| outcome.result.to_string()),
            };
            messages.push(ChatMessage::new(Role::Tool, content));

            output.tool_calls.push(call);
            output.tool_results.push(outcome);
        }
    }

    output.response = MAX_ITERATIONS_RESPONSE.to_owned();
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use va_domain::error::Result;
    use va_domain::handler::ChatResponse;

    /// LLM handler that pops scripted responses.
    struct ScriptedLlm {
        responses: Mutex<VecDeque<Result<ChatResponse>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<Result<ChatResponse>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmHandler for ScriptedLlm {
        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
            self.requests.lock().push(request.clone());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(ChatResponse::default()))
        }
    }

    struct EchoTools;

    #[async_trait::async_trait]
    impl ToolExecutor for EchoTools {
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

    fn text_response(content: &str, total: u32) -> Result<ChatResponse> {
        Ok(ChatResponse {
            content: content.into(),
            tool_calls: Vec::new(),
            usage: Some(TokenUsage {
                input_tokens: total / 3,
                output_tokens: total - total / 3,
                total_tokens: total,
            }),
        })
    }

    fn tool_response(id: &str, name: &str) -> Result<ChatResponse> {
        Ok(ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: id.into(),
                name: name.into(),
                arguments: serde_json::json!({"path": "/t"}),
            }],
            usage: None,
        })
    }

    fn input(message: &str) -> ExecuteInput {
        ExecuteInput {
            user_message: message.into(),
            system_prompt: "system".into(),
            history: Vec::new(),
            tools: Vec::new(),
            scope: None,
        }
    }

    fn harness() -> (ExecuteConfig, RetryManager, CancelToken, EventBus, EventMeta) {
        (
            ExecuteConfig {
                retry_base_delay_ms: 1,
                ..Default::default()
            },
            RetryManager::default(),
            CancelToken::new(),
            EventBus::new(),
            EventMeta::default(),
        )
    }

    #[tokio::test]
    async fn plain_answer_finishes_in_one_iteration() {
        let (config, retry, cancel, bus, meta) = harness();
        let llm = ScriptedLlm::new(vec![text_response("Hi!", 30)]);

        let output = execute(
            input("Hello"),
            &llm,
            &EchoTools,
            &config,
            &retry,
            &cancel,
            &bus,
            &meta,
        )
        .await;

        assert_eq!(output.response, "Hi!");
        assert_eq!(output.iterations, 1);
        assert_eq!(output.usage.total_tokens, 30);
        assert!(output.tool_calls.is_empty());
        assert!(!output.aborted);
        assert!(output.error.is_none());
    }

    #[tokio::test]
    async fn tool_loop_feeds_results_back() {
        let (config, retry, cancel, bus, meta) = harness();
        let llm = ScriptedLlm::new(vec![
            tool_response("c1", "read_file"),
            text_response("File: data", 20),
        ]);

        let output = execute(
            input("read it"),
            &llm,
            &EchoTools,
            &config,
            &retry,
            &cancel,
            &bus,
            &meta,
        )
        .await;

        assert_eq!(output.response, "File: data");
        assert_eq!(output.iterations, 2);
        assert_eq!(output.tool_calls.len(), 1);
        assert_eq!(output.tool_results.len(), 1);
        assert_eq!(output.tool_results[0].tool_call_id, "c1");

        // The second request carries the tool result message.
        let requests = llm.requests.lock();
        let last = requests.last().unwrap();
        assert!(last
            .messages
            .iter()
            .any(|m| m.role == Role::Tool && m.content == "\"data\""));
    }

    #[tokio::test]
    async fn iteration_cap_yields_the_literal_response() {
        let (mut config, retry, cancel, bus, meta) = harness();
        config.max_tool_iterations = 3;
        let llm = ScriptedLlm::new(
            (0..5)
                .map(|i| tool_response(&format!("c{i}"), "loop_tool"))
                .collect(),
        );

        let output = execute(
            input("go"),
            &llm,
            &EchoTools,
            &config,
            &retry,
            &cancel,
            &bus,
            &meta,
        )
        .await;

        assert_eq!(output.response, MAX_ITERATIONS_RESPONSE);
        assert_eq!(output.iterations, 3);
        assert_eq!(output.tool_calls.len(), 3);
    }

    #[tokio::test]
    async fn cancellation_before_llm_call_aborts() {
        let (config, retry, cancel, bus, meta) = harness();
        cancel.cancel();
        let llm = ScriptedLlm::new(vec![text_response("never", 1)]);

        let output = execute(
            input("go"),
            &llm,
            &EchoTools,
            &config,
            &retry,
            &cancel,
            &bus,
            &meta,
        )
        .await;
        assert!(output.aborted);
        assert!(output.response.is_empty());
        assert!(llm.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn llm_escalation_surfaces_as_structured_error() {
        let (config, retry, cancel, bus, meta) = harness();
        let llm = ScriptedLlm::new(vec![
            Err(Error::Llm("down".into())),
            Err(Error::Llm("down".into())),
            Err(Error::Llm("down".into())),
        ]);

        let output = execute(
            input("go"),
            &llm,
            &EchoTools,
            &config,
            &retry,
            &cancel,
            &bus,
            &meta,
        )
        .await;

        assert!(output.error.is_some());
        assert_eq!(output.error_code, Some(ErrorCode::Escalated));
        assert!(output.response.is_empty());
    }

    #[tokio::test]
    async fn tool_errors_are_fed_back_not_fatal() {
        struct FailingTools;

        #[async_trait::async_trait]
        impl ToolExecutor for FailingTools {
            async fn execute(
                &self,
                call: &ToolCall,
                _scope: Option<&str>,
                _timeout: Duration,
            ) -> ToolOutcome {
                ToolOutcome {
                    tool_call_id: call.id.clone(),
                    name: call.name.clone(),
                    result: serde_json::Value::Null,
                    error: Some("file missing".into()),
                    duration_ms: 2,
                }
            }

            fn has_tool(&self, _name: &str) -> bool {
                true
            }
        }

        let (config, retry, cancel, bus, meta) = harness();
        let llm = ScriptedLlm::new(vec![
            tool_response("c1", "read_file"),
            text_response("could not read", 5),
        ]);

        let output = execute(
            input("go"),
            &llm,
            &FailingTools,
            &config,
            &retry,
            &cancel,
            &bus,
            &meta,
        )
        .await;

        assert_eq!(output.response, "could not read");
        assert!(output.error.is_none());

        let requests = llm.requests.lock();
        assert!(requests
            .last()
            .unwrap()
            .messages
            .iter()
            .any(|m| m.role == Role::Tool && m.content == "Error: file missing"));
    }

    #[tokio::test]
    async fn slow_tool_hits_tool_timeout() {
        struct SlowTools;

        #[async_trait::async_trait]
        impl ToolExecutor for SlowTools {
            async fn execute(
                &self,
                call: &ToolCall,
                _scope: Option<&str>,
                _timeout: Duration,
            ) -> ToolOutcome {
                tokio::time::sleep(Duration::from_millis(200)).await;
                ToolOutcome {
                    tool_call_id: call.id.clone(),
                    name: call.name.clone(),
                    result: serde_json::Value::Null,
                    error: None,
                    duration_ms: 200,
                }
            }

            fn has_tool(&self, _name: &str) -> bool {
                true
            }
        }

        let (mut config, retry, cancel, bus, meta) = harness();
        config.tool_timeout_ms = 20;
        let llm = ScriptedLlm::new(vec![tool_response("c1", "slow_tool")]);

        let output = execute(
            input("go"),
            &llm,
            &SlowTools,
            &config,
            &retry,
            &cancel,
            &bus,
            &meta,
        )
        .await;
        assert_eq!(output.error_code, Some(ErrorCode::ToolTimeout));
    }
}
