//! The loop event bus.
//!
//! One process-wide publisher with typed variants for every loop, tool,
//! memory, and error event. Delivery is synchronous and single-threaded
//! relative to the emitter, preserving emission order per subscriber. A
//! handler that overruns its time budget is warned about and dropped so it
//! cannot stall the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use va_domain::error::ErrorCode;
use va_domain::message::{CompactionMethod, TokenUsage};

/// Default per-handler time budget before ejection.
const SLOW_HANDLER_BUDGET: Duration = Duration::from_millis(50);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Intake,
    Context,
    Execute,
    Persist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    CompactionPending,
    SessionEnd,
    Manual,
    Threshold,
}

/// Discriminant used for typed subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LoopStart,
    LoopContext,
    LoopExecute,
    LoopPersist,
    LoopEnd,
    LoopError,
    ToolStart,
    ToolEnd,
    LlmStart,
    LlmEnd,
    MemoryRead,
    MemoryWrite,
    MemoryFlush,
    MemoryCompact,
}

/// Per-type payloads. The serialized tag matches the wire names
/// (`loop:start`, `tool:end`, …).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum EventData {
    #[serde(rename = "loop:start")]
    LoopStart { message: String },

    #[serde(rename = "loop:context")]
    LoopContext {
        token_estimate: usize,
        history_length: usize,
        needs_compaction: bool,
        needs_flush: bool,
    },

    #[serde(rename = "loop:execute")]
    LoopExecute {
        tool_call_count: usize,
        usage: TokenUsage,
    },

    #[serde(rename = "loop:persist")]
    LoopPersist {
        transcript_updated: bool,
        session_updated: bool,
        memory_updated: bool,
        lock_released: bool,
    },

    #[serde(rename = "loop:end")]
    LoopEnd {
        success: bool,
        duration_ms: u64,
        usage: TokenUsage,
    },

    #[serde(rename = "loop:error")]
    LoopError {
        stage: Stage,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },

    #[serde(rename = "tool:start")]
    ToolStart {
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    #[serde(rename = "tool:end")]
    ToolEnd {
        tool_call_id: String,
        tool_name: String,
        duration_ms: u64,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "llm:start")]
    LlmStart { iteration: u32 },

    #[serde(rename = "llm:end")]
    LlmEnd {
        iteration: u32,
        has_tool_calls: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },

    #[serde(rename = "memory:read")]
    MemoryRead {
        memory_path: String,
        section_count: usize,
        total_size: usize,
        success: bool,
    },

    #[serde(rename = "memory:write")]
    MemoryWrite {
        memory_path: String,
        section: String,
        size_used: usize,
        size_limit: usize,
        truncated: bool,
        success: bool,
    },

    #[serde(rename = "memory:flush")]
    MemoryFlush {
        reason: FlushReason,
        updates_count: usize,
        no_reply: bool,
    },

    #[serde(rename = "memory:compact")]
    MemoryCompact {
        original_count: usize,
        compacted_count: usize,
        tokens_used: usize,
        method: CompactionMethod,
    },
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::LoopStart { .. } => EventKind::LoopStart,
            Self::LoopContext { .. } => EventKind::LoopContext,
            Self::LoopExecute { .. } => EventKind::LoopExecute,
            Self::LoopPersist { .. } => EventKind::LoopPersist,
            Self::LoopEnd { .. } => EventKind::LoopEnd,
            Self::LoopError { .. } => EventKind::LoopError,
            Self::ToolStart { .. } => EventKind::ToolStart,
            Self::ToolEnd { .. } => EventKind::ToolEnd,
            Self::LlmStart { .. } => EventKind::LlmStart,
            Self::LlmEnd { .. } => EventKind::LlmEnd,
            Self::MemoryRead { .. } => EventKind::MemoryRead,
            Self::MemoryWrite { .. } => EventKind::MemoryWrite,
            Self::MemoryFlush { .. } => EventKind::MemoryFlush,
            Self::MemoryCompact { .. } => EventKind::MemoryCompact,
        }
    }
}

/// Identity fields carried by every event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventMeta {
    pub run_id: String,
    pub session_id: String,
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopEvent {
    pub run_id: String,
    pub session_id: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub data: EventData,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type Handler = Box<dyn Fn(&LoopEvent) + Send + Sync>;

struct Subscription {
    id: u64,
    /// `None` subscribes to every event.
    filter: Option<EventKind>,
    handler: Handler,
}

struct BusInner {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    slow_budget: Duration,
}

/// Synchronous pub/sub for loop events.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_slow_budget(SLOW_HANDLER_BUDGET)
    }

    pub fn with_slow_budget(slow_budget: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscriptions: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                slow_budget,
            }),
        }
    }

    /// Subscribe to one event type.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&LoopEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.register(Some(kind), Box::new(handler))
    }

    /// Subscribe to every event.
    pub fn subscribe_all(
        &self,
        handler: impl Fn(&LoopEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.register(None, Box::new(handler))
    }

    fn register(&self, filter: Option<EventKind>, handler: Handler) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscriptions.write().push(Subscription {
            id,
            filter,
            handler,
        });
        SubscriptionHandle {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to all matching subscribers, in registration order.
    /// Handlers that exceed the slow budget are dropped with a warning.
    pub fn emit(&self, meta: &EventMeta, data: EventData) {
        let event = LoopEvent {
            run_id: meta.run_id.clone(),
            session_id: meta.session_id.clone(),
            agent_id: meta.agent_id.clone(),
            timestamp: Utc::now(),
            data,
        };
        let kind = event.data.kind();

        let mut slow: Vec<u64> = Vec::new();
        {
            let subscriptions = self.inner.subscriptions.read();
            for sub in subscriptions.iter() {
                if sub.filter.is_some_and(|f| f != kind) {
                    continue;
                }
                let started = Instant::now();
                (sub.handler)(&event);
                if started.elapsed() > self.inner.slow_budget {
                    slow.push(sub.id);
                }
            }
        }

        if !slow.is_empty() {
            let mut subscriptions = self.inner.subscriptions.write();
            subscriptions.retain(|s| {
                let keep = !slow.contains(&s.id);
                if !keep {
                    tracing::warn!(
                        subscription_id = s.id,
                        budget_ms = self.inner.slow_budget.as_millis() as u64,
                        "dropping slow event handler"
                    );
                }
                keep
            });
        }
    }

    /// Remove every subscriber.
    pub fn reset(&self) {
        self.inner.subscriptions.write().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }
}

/// Cancels its subscription on [`SubscriptionHandle::cancel`].
pub struct SubscriptionHandle {
    id: u64,
    bus: Weak<BusInner>,
}

impl SubscriptionHandle {
    pub fn cancel(self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.subscriptions.write().retain(|s| s.id != self.id);
        }
    }
}
