//! Tool-result pruning — trims old tool output from the in-memory view to
//! save context tokens.
//!
//! Only tool-result messages are touched; tool-call messages and everything
//! the model or user said stay intact. The newest `keep_recent` results are
//! protected. The on-disk transcript is never modified.

use va_domain::message::Message;

/// Replacement content for a pruned tool result.
pub const PRUNED_PLACEHOLDER: &str = "[tool result pruned]";

/// Prune old tool results in place. Returns how many messages were pruned
/// by this pass.
pub fn prune_tool_results(messages: &mut [Message], keep_recent: usize) -> usize {
    let result_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_tool_result())
        .map(|(i, _)| i)
        .collect();

    if result_indices.len() <= keep_recent {
        return 0;
    }

    let prune_until = result_indices.len() - keep_recent;
    let mut pruned = 0;
    for &index in &result_indices[..prune_until] {
        let message = &mut messages[index];
        let Some(metadata) = message.metadata.as_mut() else {
            continue;
        };
        if metadata.pruned {
            continue;
        }
        metadata.pruned = true;
        metadata.original_length = Some(message.content.len());
        message.content = PRUNED_PLACEHOLDER.to_owned();
        pruned += 1;
    }
    pruned
}
