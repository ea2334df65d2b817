//! Transcript message model.
//!
//! A transcript is an append-only stream of [`Message`]s, one JSON line per
//! message. Tool activity and compaction both ride on `metadata` so plain
//! text messages stay plain on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// Token counters reported by the LLM handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A tool invocation issued by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// The outcome of executing one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool_call_id: String,
    pub name: String,
    pub result: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// How a compaction summary was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionMethod {
    Llm,
    Local,
}

/// Recognised metadata keys on a transcript message. Absent keys do not
/// appear on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Tool invocations issued by an assistant turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Set on a tool-result message: the call it answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Marks a tool-result message.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tool_result: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// `"compaction_summary"` on summary messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<CompactionMethod>,
    /// Set when a tool result was pruned from the in-memory view.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pruned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_length: Option<usize>,
}

/// One transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Whether this message carries a tool result.
    pub fn is_tool_result(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.tool_result)
    }

    /// Whether this message is a compaction summary.
    pub fn is_compaction_summary(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.kind.as_deref())
            .is_some_and(|k| k == "compaction_summary")
    }
}

/// A message as supplied by a caller; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub role: Role,
    pub content: String,
    pub metadata: Option<MessageMetadata>,
}

impl MessageDraft {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_message_serializes_without_metadata() {
        let msg = Message::user("hello");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("metadata"));
        assert!(json.contains("\"role\":\"user\""));
    }

    #[test]
    fn tool_result_metadata_round_trip() {
        let meta = MessageMetadata {
            tool_call_id: Some("c1".into()),
            tool_name: Some("read_file".into()),
            duration_ms: Some(10),
            tool_result: true,
            ..Default::default()
        };
        let msg = Message::system("data").with_metadata(meta);
        assert!(msg.is_tool_result());

        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert!(back.is_tool_result());
        let m = back.metadata.unwrap();
        assert_eq!(m.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(m.duration_ms, Some(10));
        // Unset flags stay off disk.
        assert!(!json.contains("pruned"));
    }

    #[test]
    fn compaction_summary_detection() {
        let meta = MessageMetadata {
            kind: Some("compaction_summary".into()),
            method: Some(CompactionMethod::Local),
            ..Default::default()
        };
        let msg = Message::system("summary").with_metadata(meta);
        assert!(msg.is_compaction_summary());
        assert!(!Message::system("plain").is_compaction_summary());
    }

    #[test]
    fn usage_accumulates() {
        let mut total = TokenUsage::default();
        total.accumulate(&TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
            total_tokens: 30,
        });
        total.accumulate(&TokenUsage {
            input_tokens: 1,
            output_tokens: 2,
            total_tokens: 3,
        });
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.total_tokens, 33);
    }
}
