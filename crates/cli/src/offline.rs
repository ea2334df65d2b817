//! Built-in offline capabilities.
//!
//! The CLI has no provider wired in; these stand-ins keep `chat`/`run`
//! usable end to end: the "model" acknowledges the message, and the tool
//! executor advertises nothing.

use std::time::Duration;

use va_domain::error::Result;
use va_domain::handler::{ChatRequest, ChatResponse, LlmHandler, ToolExecutor};
use va_domain::message::{Role, TokenUsage, ToolCall, ToolOutcome};

/// Echo handler: answers with the last user message, estimating usage the
/// same way the context stage does.
pub struct OfflineLlm;

#[async_trait::async_trait]
impl LlmHandler for OfflineLlm {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let content = format!("[offline] received: {last_user}");

        let input_tokens: u32 = request
            .messages
            .iter()
            .map(|m| (m.content.len() / 4) as u32 + 4)
            .sum();
        let output_tokens = (content.len() / 4) as u32 + 4;
        Ok(ChatResponse {
            content,
            tool_calls: Vec::new(),
            usage: Some(TokenUsage {
                input_tokens,
                output_tokens,
                total_tokens: input_tokens + output_tokens,
            }),
        })
    }
}

/// Tool executor with no tools.
pub struct NoTools;

#[async_trait::async_trait]
impl ToolExecutor for NoTools {
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
            error: Some(format!("unknown tool: {}", call.name)),
            duration_ms: 0,
        }
    }

    fn has_tool(&self, _name: &str) -> bool {
        false
    }
}
