//! Typed message envelopes.
//!
//! A message's `payload` is opaque JSON on the wire; the schemas here pin
//! its shape per message kind and are validated at the boundary. Reply
//! correlation: a response's `correlation_id` equals the request's `id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use va_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Delivery progression. The declaration order defines the monotone
/// ordering `pending < delivered < read < processed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Read,
    Processed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub subject: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// The inbox record wrapping a message with its delivery timestamps.
/// Timestamps are set once and never cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message: AgentMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn new(message: AgentMessage) -> Self {
        Self {
            message,
            delivered_at: None,
            read_at: None,
            processed_at: None,
        }
    }

    /// Advance the status monotonically; downgrades are ignored.
    pub fn advance(&mut self, status: DeliveryStatus) {
        if status <= self.message.status {
            return;
        }
        let now = Utc::now();
        match status {
            DeliveryStatus::Pending => {}
            DeliveryStatus::Delivered => {
                self.delivered_at.get_or_insert(now);
            }
            DeliveryStatus::Read => {
                self.delivered_at.get_or_insert(now);
                self.read_at.get_or_insert(now);
            }
            DeliveryStatus::Processed => {
                self.delivered_at.get_or_insert(now);
                self.read_at.get_or_insert(now);
                self.processed_at.get_or_insert(now);
            }
        }
        self.message.status = status;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Typed payload schemas
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    pub operation: String,
    pub payload: serde_json::Value,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub correlation_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub event: String,
    pub payload: serde_json::Value,
}

/// Check a message's payload against the schema for its kind.
pub fn validate(message: &AgentMessage) -> Result<()> {
    let check = match message.kind {
        MessageKind::Request => {
            serde_json::from_value::<RequestPayload>(message.payload.clone()).map(|_| ())
        }
        MessageKind::Response => {
            serde_json::from_value::<ResponsePayload>(message.payload.clone()).map(|_| ())
        }
        MessageKind::Notify => {
            serde_json::from_value::<NotifyPayload>(message.payload.clone()).map(|_| ())
        }
    };
    check.map_err(|e| Error::InvalidInput(format!("message {} payload: {e}", message.id)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Constructors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build a request. The embedded `correlation_id` equals the message id.
pub fn create_request(
    from: &str,
    to: &str,
    subject: &str,
    operation: &str,
    payload: serde_json::Value,
    timeout_ms: Option<u64>,
) -> AgentMessage {
    let id = Uuid::new_v4().to_string();
    let request = RequestPayload {
        operation: operation.to_owned(),
        payload,
        correlation_id: id.clone(),
        timeout_ms,
        metadata: None,
    };
    AgentMessage {
        id,
        from: from.to_owned(),
        to: to.to_owned(),
        kind: MessageKind::Request,
        subject: subject.to_owned(),
        payload: serde_json::to_value(request).unwrap_or_default(),
        priority: Priority::Normal,
        status: DeliveryStatus::Pending,
        timestamp: Utc::now(),
        reply_to: None,
        metadata: None,
    }
}

/// Build the response to a request: from/to swapped, subject prefixed with
/// `"Re: "`, `correlation_id` set to the request's id.
pub fn create_reply(
    request: &AgentMessage,
    success: bool,
    payload: Option<serde_json::Value>,
    error: Option<String>,
) -> AgentMessage {
    let response = ResponsePayload {
        correlation_id: request.id.clone(),
        success,
        payload,
        error,
    };
    AgentMessage {
        id: Uuid::new_v4().to_string(),
        from: request.to.clone(),
        to: request.from.clone(),
        kind: MessageKind::Response,
        subject: format!("Re: {}", request.subject),
        payload: serde_json::to_value(response).unwrap_or_default(),
        priority: request.priority,
        status: DeliveryStatus::Pending,
        timestamp: Utc::now(),
        reply_to: Some(request.id.clone()),
        metadata: None,
    }
}

pub fn create_notify(
    from: &str,
    to: &str,
    subject: &str,
    event: &str,
    payload: serde_json::Value,
) -> AgentMessage {
    let notify = NotifyPayload {
        event: event.to_owned(),
        payload,
    };
    AgentMessage {
        id: Uuid::new_v4().to_string(),
        from: from.to_owned(),
        to: to.to_owned(),
        kind: MessageKind::Notify,
        subject: subject.to_owned(),
        payload: serde_json::to_value(notify).unwrap_or_default(),
        priority: Priority::Normal,
        status: DeliveryStatus::Pending,
        timestamp: Utc::now(),
        reply_to: None,
        metadata: None,
    }
}

/// Extract a response's typed payload, if this is a response message.
pub fn response_payload(message: &AgentMessage) -> Option<ResponsePayload> {
    if message.kind != MessageKind::Response {
        return None;
    }
    serde_json::from_value(message.payload.clone()).ok()
}
