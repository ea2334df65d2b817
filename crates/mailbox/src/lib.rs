//! File-backed inter-agent messaging.
//!
//! Each agent owns one `inbox.json` (an ordered list of envelopes) and an
//! append-only `messages.log` audit stream. The protocol module defines the
//! typed request/response/notify schemas; coordination builds delegation,
//! handoff, and fan-out/collect on top of plain sends.

pub mod coordination;
pub mod inbox;
pub mod protocol;

pub use inbox::{InboxStats, Mailbox, ReceiveFilter};
pub use protocol::{
    create_notify, create_reply, create_request, AgentMessage, DeliveryStatus, Envelope,
    MessageKind, NotifyPayload, Priority, RequestPayload, ResponsePayload,
};
