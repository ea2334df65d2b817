//! Capability traits consumed by the runtime.
//!
//! The core never speaks HTTP or a provider wire format: it is handed an
//! [`LlmHandler`] and a [`ToolExecutor`] and drives them. `LlmHandler::chat`
//! must be idempotent under retry; the retry manager may call it again
//! after a transient failure.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::{Role, TokenUsage, ToolCall, ToolOutcome};

/// One entry in the message list sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A tool surface advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool arguments.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// The language-model capability.
#[async_trait::async_trait]
pub trait LlmHandler: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

/// The tool-execution capability.
///
/// `scope` is forwarded unchanged from the agent definition; its
/// interpretation is entirely the executor's concern.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        call: &ToolCall,
        scope: Option<&str>,
        timeout: Duration,
    ) -> ToolOutcome;

    fn has_tool(&self, name: &str) -> bool;

    /// Tool surfaces to advertise to the model. Defaults to none.
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }
}
