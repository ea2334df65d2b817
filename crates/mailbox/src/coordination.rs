//! Multi-agent coordination on top of the mailbox.
//!
//! Delegation and handoff are fire-and-forget sends; distribution fans a
//! task out over several agents; collection polls the initiator's inbox for
//! the matching responses. None of these primitives touch the agent
//! loop; they only move envelopes.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use va_domain::error::Result;

use crate::inbox::{Mailbox, ReceiveFilter};
use crate::protocol::{self, create_request, MessageKind, Priority};

/// Inbox poll cadence while collecting results.
const COLLECT_POLL_INTERVAL: Duration = Duration::from_millis(200);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delegation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Payload of a `"Delegation: …"` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationPayload {
    pub delegation_id: String,
    pub task: String,
    pub context: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub expect_response: bool,
}

#[derive(Debug, Clone)]
pub struct DelegationOutcome {
    pub success: bool,
    pub delegation_id: String,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// An addressable coordination peer.
#[derive(Debug, Clone)]
pub struct AgentAddress {
    pub id: String,
    pub dir: PathBuf,
}

impl AgentAddress {
    pub fn new(id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            dir: dir.into(),
        }
    }
}

/// Send a delegation request without waiting for the result.
pub fn delegate(
    from: &AgentAddress,
    to: &AgentAddress,
    task: &str,
    context: serde_json::Value,
    deadline: Option<DateTime<Utc>>,
    expect_response: bool,
) -> DelegationOutcome {
    let started = Instant::now();
    let delegation_id = Uuid::new_v4().to_string();
    let payload = DelegationPayload {
        delegation_id: delegation_id.clone(),
        task: task.to_owned(),
        context,
        deadline,
        expect_response,
    };

    let message = create_request(
        &from.id,
        &to.id,
        &format!("Delegation: {task}"),
        "delegation",
        serde_json::to_value(payload).unwrap_or_default(),
        None,
    );

    let result = Mailbox::send_message(message, &from.dir, &to.dir);
    DelegationOutcome {
        success: result.is_ok(),
        delegation_id,
        duration_ms: started.elapsed().as_millis() as u64,
        error: result.err().map(|e| e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handoff
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the receiving agent needs to pick the conversation up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandoffContext {
    pub memory: serde_json::Value,
    pub current_state: String,
    pub pending_tasks: Vec<String>,
    pub important_notes: Vec<String>,
    pub conversation_summary: String,
}

/// Transfer a conversation to another agent with its working context.
pub fn handoff(
    from: &AgentAddress,
    to: &AgentAddress,
    reason: &str,
    context: HandoffContext,
) -> Result<()> {
    let mut message = create_request(
        &from.id,
        &to.id,
        &format!("Handoff: {reason}"),
        "handoff",
        serde_json::json!({}),
        None,
    );
    message.priority = Priority::High;
    // Re-wrap the payload with the handoff context while keeping the
    // request schema intact.
    if let Ok(mut request) =
        serde_json::from_value::<protocol::RequestPayload>(message.payload.clone())
    {
        request.payload = serde_json::to_value(context)?;
        message.payload = serde_json::to_value(request)?;
    }
    Mailbox::send_message(message, &from.dir, &to.dir)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Distribution & collection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct SubtaskDispatch {
    pub agent_id: String,
    pub delegation: DelegationOutcome,
}

/// Snapshot of one fan-out round.
#[derive(Debug, Clone)]
pub struct MultiAgentTask {
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub subtasks: Vec<SubtaskDispatch>,
}

impl MultiAgentTask {
    pub fn all_dispatched(&self) -> bool {
        self.subtasks.iter().all(|s| s.delegation.success)
    }
}

/// Delegate one subtask per target, in sequence.
pub fn distribute(
    from: &AgentAddress,
    targets: &[AgentAddress],
    subtask_for: impl Fn(&str) -> String,
    context: serde_json::Value,
) -> MultiAgentTask {
    let task_id = Uuid::new_v4().to_string();
    let started_at = Utc::now();
    let mut subtasks = Vec::with_capacity(targets.len());

    for target in targets {
        let task = subtask_for(&target.id);
        let delegation = delegate(from, target, &task, context.clone(), None, true);
        subtasks.push(SubtaskDispatch {
            agent_id: target.id.clone(),
            delegation,
        });
    }

    MultiAgentTask {
        task_id,
        started_at,
        subtasks,
    }
}

#[derive(Debug, Clone)]
pub struct CollectedResult {
    pub agent_id: String,
    pub message_id: String,
    pub success: bool,
    pub payload: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CollectReport {
    /// Responses in arrival order; ties broken by agent id.
    pub results: Vec<CollectedResult>,
    /// Agents that never answered within the timeout.
    pub missing: Vec<String>,
}

/// Poll the initiator's inbox for responses from the expected agents.
///
/// Each harvested envelope is marked processed. Agents still silent when
/// the timeout lapses are reported in `missing`.
pub async fn collect_results(
    initiator: &AgentAddress,
    expected: &[String],
    timeout: Duration,
) -> Result<CollectReport> {
    let deadline = Instant::now() + timeout;
    let mut outstanding: Vec<String> = expected.to_vec();
    let mut results: Vec<CollectedResult> = Vec::new();

    loop {
        let envelopes = Mailbox::receive_messages(
            &initiator.dir,
            &initiator.id,
            ReceiveFilter {
                kind: Some(MessageKind::Response),
                ..Default::default()
            },
        )?;

        // receive_messages is newest-first; walk oldest-first so results
        // come out in arrival order.
        let mut batch: Vec<CollectedResult> = Vec::new();
        for envelope in envelopes.iter().rev() {
            let from = &envelope.message.from;
            let Some(slot) = outstanding.iter().position(|a| a == from) else {
                continue;
            };
            outstanding.remove(slot);

            let response = protocol::response_payload(&envelope.message);
            batch.push(CollectedResult {
                agent_id: from.clone(),
                message_id: envelope.message.id.clone(),
                success: response.as_ref().is_some_and(|r| r.success),
                payload: response.as_ref().and_then(|r| r.payload.clone()),
                error: response.and_then(|r| r.error),
            });
            Mailbox::mark_as_processed(&initiator.dir, &envelope.message.id)?;
        }
        // Same-poll arrivals tie-break by agent id.
        batch.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        results.extend(batch);

        if outstanding.is_empty() || Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(COLLECT_POLL_INTERVAL).await;
    }

    outstanding.sort();
    Ok(CollectReport {
        results,
        missing: outstanding,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skill chain
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct ChainStep {
    pub agent: AgentAddress,
    pub task: String,
}

#[derive(Debug, Clone)]
pub struct ChainStepResult {
    pub agent_id: String,
    pub task: String,
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ChainReport {
    pub completed: Vec<ChainStepResult>,
    /// Index of the step that failed, if the chain stopped early.
    pub failed_step: Option<usize>,
    pub error: Option<String>,
}

/// Invoke skills in sequence, feeding each step's result payload into the
/// next step's context. Stops at the first failure and returns the partial
/// results.
pub async fn run_skill_chain(
    initiator: &AgentAddress,
    steps: &[ChainStep],
    step_timeout: Duration,
) -> Result<ChainReport> {
    let mut report = ChainReport::default();
    let mut carried: serde_json::Value = serde_json::json!(null);

    for (index, step) in steps.iter().enumerate() {
        let dispatch = delegate(
            initiator,
            &step.agent,
            &step.task,
            serde_json::json!({ "previous": carried }),
            None,
            true,
        );
        if !dispatch.success {
            report.failed_step = Some(index);
            report.error = dispatch.error;
            return Ok(report);
        }

        let collected =
            collect_results(initiator, &[step.agent.id.clone()], step_timeout).await?;
        match collected.results.into_iter().next() {
            Some(result) if result.success => {
                carried = result.payload.clone().unwrap_or(serde_json::Value::Null);
                report.completed.push(ChainStepResult {
                    agent_id: step.agent.id.clone(),
                    task: step.task.clone(),
                    payload: result.payload,
                });
            }
            Some(result) => {
                report.failed_step = Some(index);
                report.error = result.error;
                return Ok(report);
            }
            None => {
                report.failed_step = Some(index);
                report.error = Some(format!("no response from {}", step.agent.id));
                return Ok(report);
            }
        }
    }
    Ok(report)
}
