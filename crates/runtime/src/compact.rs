//! Session compaction — collapses old transcript messages into a single
//! summary system message when the token budget is tight.
//!
//! Compaction never touches the on-disk transcript; it rewrites the
//! in-memory view as `[summary, preserved-important, recent N]`. The
//! summary comes from the LLM handler when one is supplied, otherwise from
//! a deterministic local summariser.

use regex::Regex;

use va_domain::handler::{ChatMessage, ChatRequest, LlmHandler};
use va_domain::message::{CompactionMethod, Message, MessageMetadata, Role};
use va_memory::truncate_to_budget;

use crate::events::{EventBus, EventData, EventMeta};

/// Markers that flag a message as important enough to survive compaction
/// verbatim.
const IMPORTANT_MARKERS: [&str; 10] = [
    "important",
    "remember",
    "note:",
    "key point",
    "critical",
    "decision:",
    "action:",
    "todo:",
    "agreed:",
    "confirmed:",
];

/// Common words excluded from topic extraction.
const TOPIC_STOPWORDS: [&str; 18] = [
    "this", "that", "with", "from", "have", "will", "your", "about", "them", "then", "than",
    "they", "what", "when", "been", "were", "there", "which",
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token estimation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// 4-characters-per-token heuristic plus per-message role overhead.
pub fn estimate_text_tokens(text: &str) -> usize {
    text.len().div_ceil(4) + 4
}

pub fn estimate_message_tokens(message: &Message) -> usize {
    estimate_text_tokens(&message.content)
}

pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Whether a message carries one of the importance markers.
pub fn is_important(message: &Message) -> bool {
    let content = message.content.to_lowercase();
    IMPORTANT_MARKERS.iter().any(|m| content.contains(m))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct CompactionBudget {
    /// If the estimated tokens are at or under this, compaction is a no-op.
    pub max_total_tokens: usize,
    /// Token budget for the produced summary.
    pub summary_budget: usize,
    /// Recent messages kept verbatim.
    pub preserve_recent: usize,
    /// Keep marker-carrying messages verbatim after the summary.
    pub preserve_important: bool,
}

#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub messages: Vec<Message>,
    pub original_count: usize,
    pub compacted_count: usize,
    pub tokens_used: usize,
    /// `None` when no compaction was needed (output == input).
    pub method: Option<CompactionMethod>,
}

impl CompactionResult {
    pub fn was_compacted(&self) -> bool {
        self.method.is_some()
    }
}

/// Compact a transcript view against a budget.
///
/// Idempotent on transcripts under budget: the input comes back untouched.
pub async fn compact(
    messages: &[Message],
    budget: &CompactionBudget,
    llm: Option<&dyn LlmHandler>,
    bus: &EventBus,
    meta: &EventMeta,
) -> CompactionResult {
    let original_count = messages.len();
    let estimate = estimate_tokens(messages);
    if estimate <= budget.max_total_tokens || messages.len() <= budget.preserve_recent {
        return CompactionResult {
            messages: messages.to_vec(),
            original_count,
            compacted_count: original_count,
            tokens_used: estimate,
            method: None,
        };
    }

    let split = messages.len() - budget.preserve_recent;
    let (older, recent) = messages.split_at(split);

    let important: Vec<Message> = if budget.preserve_important {
        older.iter().filter(|m| is_important(m)).cloned().collect()
    } else {
        Vec::new()
    };

    // Summarise via the LLM when available, falling back to the local
    // summariser on handler failure.
    let (summary, method) = match llm {
        Some(handler) => match llm_summary(handler, older).await {
            Ok(text) => (text, CompactionMethod::Llm),
            Err(e) => {
                tracing::warn!(error = %e, "LLM summarisation failed, using local summariser");
                (local_summary(older), CompactionMethod::Local)
            }
        },
        None => (local_summary(older), CompactionMethod::Local),
    };

    // The summary obeys its own budget, truncated like memory sections.
    let (summary, _truncated) = truncate_to_budget(&summary, budget.summary_budget * 4);

    let summary_message = Message::system(summary).with_metadata(MessageMetadata {
        kind: Some("compaction_summary".into()),
        method: Some(method),
        ..Default::default()
    });

    let mut compacted = Vec::with_capacity(1 + important.len() + recent.len());
    compacted.push(summary_message);
    compacted.extend(important);
    compacted.extend_from_slice(recent);

    let tokens_used = estimate_tokens(&compacted);
    bus.emit(
        meta,
        EventData::MemoryCompact {
            original_count,
            compacted_count: compacted.len(),
            tokens_used,
            method,
        },
    );

    CompactionResult {
        compacted_count: compacted.len(),
        messages: compacted,
        original_count,
        tokens_used,
        method: Some(method),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Summarisers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn llm_summary(
    handler: &dyn LlmHandler,
    messages: &[Message],
) -> va_domain::Result<String> {
    let mut conversation = String::new();
    for message in messages {
        let label = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
            Role::Tool => "Tool",
        };
        conversation.push_str(label);
        conversation.push_str(": ");
        conversation.push_str(&message.content);
        conversation.push('\n');
    }

    let prompt = format!(
        "Summarize the following conversation history into a concise summary \
         that preserves:\n\
         1. The current goal or plan being worked on\n\
         2. Key decisions made\n\
         3. Open questions or threads\n\
         4. Important facts learned about the user or context\n\n\
         Be concise but preserve all actionable context. Write in present \
         tense. Omit greetings and pleasantries.\n\n\
         CONVERSATION:\n{conversation}"
    );

    let request = ChatRequest {
        system_prompt: String::new(),
        messages: vec![ChatMessage::new(Role::User, prompt)],
        tools: Vec::new(),
    };
    let response = handler.chat(&request).await?;
    Ok(response.content)
}

/// Deterministic fallback summariser: message counts, time range, extracted
/// key points, and the most frequent topic words. Same input bytes, same
/// output bytes.
pub fn local_summary(messages: &[Message]) -> String {
    let user_count = messages.iter().filter(|m| m.role == Role::User).count();
    let assistant_count = messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .count();

    let mut out = String::from("Conversation summary (compacted)\n");
    out.push_str(&format!(
        "Messages: {} ({user_count} user, {assistant_count} assistant)\n",
        messages.len()
    ));
    if let (Some(first), Some(last)) = (messages.first(), messages.last()) {
        out.push_str(&format!(
            "Range: {} to {}\n",
            first.timestamp.to_rfc3339(),
            last.timestamp.to_rfc3339()
        ));
    }

    let key_points: Vec<String> = messages
        .iter()
        .filter(|m| is_important(m))
        .flat_map(|m| m.content.lines())
        .filter(|line| {
            let lower = line.to_lowercase();
            IMPORTANT_MARKERS.iter().any(|marker| lower.contains(marker))
        })
        .take(8)
        .map(|line| {
            let line = line.trim();
            if line.len() > 120 {
                let mut end = 120;
                while !line.is_char_boundary(end) && end > 0 {
                    end -= 1;
                }
                format!("{}...", &line[..end])
            } else {
                line.to_owned()
            }
        })
        .collect();
    if !key_points.is_empty() {
        out.push_str("Key points:\n");
        for point in &key_points {
            out.push_str("- ");
            out.push_str(point);
            out.push('\n');
        }
    }

    let topics = topic_words(messages);
    if !topics.is_empty() {
        out.push_str("Topics: ");
        out.push_str(&topics.join(", "));
        out.push('\n');
    }
    out
}

/// Up to ten frequent words of four or more letters, ordered by frequency
/// then alphabetically.
fn topic_words(messages: &[Message]) -> Vec<String> {
    let word_re = Regex::new(r"[A-Za-z]{4,}").expect("static regex");
    let mut counts: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
    for message in messages {
        for word in word_re.find_iter(&message.content) {
            let word = word.as_str().to_lowercase();
            if TOPIC_STOPWORDS.contains(&word.as_str()) {
                continue;
            }
            *counts.entry(word).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(10).map(|(word, _)| word).collect()
}
