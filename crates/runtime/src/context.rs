//! CONTEXT — load history and memory, assemble the system prompt, estimate
//! the token budget.
//!
//! Pruning here mutates only the in-memory view; the on-disk transcript is
//! the ground truth and is never rewritten.

use std::path::Path;

use chrono::Utc;

use va_agents::AgentDefinition;
use va_domain::config::ContextConfig;
use va_domain::error::Result;
use va_domain::handler::{ToolDefinition, ToolExecutor};
use va_domain::message::Message;
use va_memory::MemoryStore;
use va_sessions::Transcript;

use crate::compact::{estimate_text_tokens, estimate_tokens};
use crate::events::{EventBus, EventData, EventMeta};
use crate::prune::prune_tool_results;

/// What the loop should do about the budget before calling the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextAction {
    Compact,
    Flush,
    None,
}

pub struct ContextOutput {
    pub system_prompt: String,
    /// In-memory history view (tail-truncated, tool results pruned).
    pub history: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub token_estimate: usize,
    pub needs_flush: bool,
    pub needs_compaction: bool,
    pub pruned_count: usize,
}

pub fn context_requires_action(output: &ContextOutput) -> ContextAction {
    if output.needs_compaction {
        ContextAction::Compact
    } else if output.needs_flush {
        ContextAction::Flush
    } else {
        ContextAction::None
    }
}

pub fn build_context(
    definition: &AgentDefinition,
    agent_path: &Path,
    session_id: &str,
    user_message: &str,
    memory: &MemoryStore,
    tools: &dyn ToolExecutor,
    config: &ContextConfig,
    bus: &EventBus,
    meta: &EventMeta,
) -> Result<ContextOutput> {
    // 1. Transcript, tail-truncated to the history cap.
    let mut history = Transcript::read(agent_path, session_id)?;
    if history.len() > config.max_history_messages {
        history.drain(..history.len() - config.max_history_messages);
    }

    // 2. Working memory, when present.
    let memory_path = agent_path.join("MEMORY.md");
    let memory_doc = match memory.load(agent_path) {
        Ok(doc) => {
            if let Some(doc) = &doc {
                bus.emit(
                    meta,
                    EventData::MemoryRead {
                        memory_path: memory_path.display().to_string(),
                        section_count: doc.sections.len(),
                        total_size: doc.total_size(),
                        success: true,
                    },
                );
            }
            doc
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to load working memory");
            bus.emit(
                meta,
                EventData::MemoryRead {
                    memory_path: memory_path.display().to_string(),
                    section_count: 0,
                    total_size: 0,
                    success: false,
                },
            );
            None
        }
    };

    // 3. System prompt.
    let system_prompt = build_system_prompt(definition, memory_doc.as_ref());

    // 4. Tool definitions for the model.
    let tool_definitions = tools.tool_definitions();

    // 5. Prune old tool results (in-memory only).
    let pruned_count = prune_tool_results(&mut history, config.keep_recent_tool_results);

    // 6. Budget decision.
    let token_estimate = estimate_text_tokens(&system_prompt)
        + estimate_tokens(&history)
        + estimate_text_tokens(user_message);
    let usable = config.context_window.saturating_sub(config.reserve_tokens);
    let needs_flush = token_estimate as f64 >= config.flush_threshold * usable as f64;
    let needs_compaction = token_estimate as f64 >= config.compaction_threshold * usable as f64;

    Ok(ContextOutput {
        system_prompt,
        history,
        tools: tool_definitions,
        token_estimate,
        needs_flush,
        needs_compaction,
        pruned_count,
    })
}

/// Prompt sections the agent definition contributes, in order.
const PROMPT_SECTIONS: [&str; 4] = ["identity", "capabilities", "guidelines", "tools"];

fn build_system_prompt(
    definition: &AgentDefinition,
    memory: Option<&va_memory::MemoryDocument>,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !definition.instructions.is_empty() {
        parts.push(definition.instructions.clone());
    }

    for name in PROMPT_SECTIONS {
        if let Some(content) = definition.section(name) {
            if !content.is_empty() {
                parts.push(format!("## {}\n{content}", title_case(name)));
            }
        }
    }

    if let Some(scope) = &definition.scope {
        if !scope.is_empty() {
            parts.push(format!("## Scope\n{scope}"));
        }
    }

    let now = Utc::now();
    parts.push(format!(
        "## Current Context\nDate: {}\nTime: {} UTC",
        now.format("%Y-%m-%d"),
        now.format("%H:%M")
    ));

    if let Some(doc) = memory {
        let body = doc.body();
        if !body.is_empty() {
            parts.push(format!("## Working Memory\n{body}"));
        }
    }

    parts.join("\n\n")
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
