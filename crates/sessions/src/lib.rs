//! Session persistence and concurrency control.
//!
//! A session is one conversational thread with an agent, laid out as
//! `<agentPath>/sessions/<sessionId>/` with a `metadata.json` record and an
//! append-only `transcript.jsonl` stream. The lock map hands out exclusive
//! TTL leases per session so concurrent turns for the same session
//! serialise.

pub mod lock;
pub mod store;
pub mod transcript;

pub use lock::{SessionLease, SessionLockMap};
pub use store::{SessionMetadata, SessionPatch, SessionStatus, SessionStore};
pub use transcript::Transcript;
