//! Per-agent inboxes.
//!
//! The inbox is one JSON document holding the ordered envelope list. Every
//! mutation is a read-modify-write of the whole file under a short advisory
//! lock, finished with write-to-temp + atomic rename. Send/receive events
//! additionally land in each side's append-only `messages.log`.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use va_domain::error::{Error, Result};
use va_domain::trace::TraceEvent;

use crate::protocol::{self, AgentMessage, DeliveryStatus, Envelope, MessageKind, Priority};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// On-disk shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Serialize, Deserialize)]
struct InboxFile {
    envelopes: Vec<Envelope>,
}

/// One line of the `messages.log` audit stream.
#[derive(Debug, Serialize, Deserialize)]
struct LogLine<'a> {
    direction: &'a str,
    message_id: &'a str,
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    timestamp: DateTime<Utc>,
}

/// Filters for [`Mailbox::receive_messages`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveFilter {
    pub kind: Option<MessageKind>,
    pub unread_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InboxStats {
    pub total: usize,
    pub unread: usize,
    pub pending: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mailbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Mailbox;

impl Mailbox {
    fn inbox_path(agent_dir: &Path) -> PathBuf {
        agent_dir.join("inbox.json")
    }

    fn log_path(agent_dir: &Path) -> PathBuf {
        agent_dir.join("messages.log")
    }

    /// Deliver a message into the recipient's inbox and record the audit
    /// lines on both sides. Fails when the recipient directory is missing.
    pub fn send_message(
        mut message: AgentMessage,
        sender_dir: &Path,
        recipient_dir: &Path,
    ) -> Result<()> {
        protocol::validate(&message)?;
        if !recipient_dir.is_dir() {
            return Err(Error::AgentNotFound(format!(
                "recipient directory {} does not exist",
                recipient_dir.display()
            )));
        }

        message.status = DeliveryStatus::Pending;
        let mut envelope = Envelope::new(message);
        envelope.advance(DeliveryStatus::Delivered);
        let message = envelope.message.clone();

        Self::with_inbox(recipient_dir, |inbox| {
            inbox.envelopes.push(envelope);
            Ok(())
        })?;

        Self::append_log(sender_dir, "sent", &message)?;
        Self::append_log(recipient_dir, "received", &message)?;

        TraceEvent::MailSent {
            message_id: message.id.clone(),
            from: message.from.clone(),
            to: message.to.clone(),
        }
        .emit();
        Ok(())
    }

    /// Envelopes addressed to `recipient_id`, newest first.
    pub fn receive_messages(
        recipient_dir: &Path,
        recipient_id: &str,
        filter: ReceiveFilter,
    ) -> Result<Vec<Envelope>> {
        let inbox = Self::load(recipient_dir)?;
        let mut envelopes: Vec<Envelope> = inbox
            .envelopes
            .into_iter()
            .filter(|e| e.message.to == recipient_id)
            .filter(|e| filter.kind.is_none_or(|k| e.message.kind == k))
            .filter(|e| !filter.unread_only || e.message.status < DeliveryStatus::Read)
            .collect();
        envelopes.reverse();
        Ok(envelopes)
    }

    pub fn mark_as_read(agent_dir: &Path, message_id: &str) -> Result<bool> {
        Self::advance_envelope(agent_dir, message_id, DeliveryStatus::Read)
    }

    pub fn mark_as_processed(agent_dir: &Path, message_id: &str) -> Result<bool> {
        Self::advance_envelope(agent_dir, message_id, DeliveryStatus::Processed)
    }

    /// Remove an envelope. Returns whether it existed.
    pub fn delete_message(agent_dir: &Path, message_id: &str) -> Result<bool> {
        Self::with_inbox(agent_dir, |inbox| {
            let before = inbox.envelopes.len();
            inbox.envelopes.retain(|e| e.message.id != message_id);
            Ok(inbox.envelopes.len() != before)
        })
    }

    pub fn get_message_by_id(agent_dir: &Path, message_id: &str) -> Result<Option<Envelope>> {
        let inbox = Self::load(agent_dir)?;
        Ok(inbox
            .envelopes
            .into_iter()
            .find(|e| e.message.id == message_id))
    }

    /// Counts by kind and priority plus unread/pending totals.
    pub fn inbox_stats(agent_dir: &Path) -> Result<InboxStats> {
        let inbox = Self::load(agent_dir)?;
        let mut stats = InboxStats {
            total: inbox.envelopes.len(),
            ..Default::default()
        };
        for envelope in &inbox.envelopes {
            let msg = &envelope.message;
            if msg.status < DeliveryStatus::Read {
                stats.unread += 1;
            }
            if msg.status == DeliveryStatus::Pending {
                stats.pending += 1;
            }
            *stats.by_kind.entry(kind_key(msg.kind)).or_insert(0) += 1;
            *stats
                .by_priority
                .entry(priority_key(msg.priority))
                .or_insert(0) += 1;
        }
        Ok(stats)
    }

    // ── internals ───────────────────────────────────────────────────

    fn advance_envelope(
        agent_dir: &Path,
        message_id: &str,
        status: DeliveryStatus,
    ) -> Result<bool> {
        Self::with_inbox(agent_dir, |inbox| {
            match inbox
                .envelopes
                .iter_mut()
                .find(|e| e.message.id == message_id)
            {
                Some(envelope) => {
                    envelope.advance(status);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn load(agent_dir: &Path) -> Result<InboxFile> {
        let path = Self::inbox_path(agent_dir);
        if !path.exists() {
            return Ok(InboxFile::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Read-modify-write of the whole inbox under a short file lock.
    fn with_inbox<T>(agent_dir: &Path, mutate: impl FnOnce(&mut InboxFile) -> Result<T>) -> Result<T> {
        std::fs::create_dir_all(agent_dir)?;
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(agent_dir.join(".inbox.lock"))?;
        lock.lock_exclusive()?;

        let result = (|| {
            let mut inbox = Self::load(agent_dir)?;
            let value = mutate(&mut inbox)?;

            let path = Self::inbox_path(agent_dir);
            let tmp = agent_dir.join("inbox.json.tmp");
            std::fs::write(&tmp, serde_json::to_string_pretty(&inbox)?)?;
            std::fs::rename(&tmp, &path)?;
            Ok(value)
        })();

        let _ = fs2::FileExt::unlock(&lock);
        result
    }

    fn append_log(agent_dir: &Path, direction: &str, message: &AgentMessage) -> Result<()> {
        std::fs::create_dir_all(agent_dir)?;
        let line = LogLine {
            direction,
            message_id: &message.id,
            from: &message.from,
            to: &message.to,
            subject: &message.subject,
            timestamp: Utc::now(),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::log_path(agent_dir))?;
        writeln!(file, "{}", serde_json::to_string(&line)?)?;
        Ok(())
    }
}

fn kind_key(kind: MessageKind) -> String {
    match kind {
        MessageKind::Request => "request",
        MessageKind::Response => "response",
        MessageKind::Notify => "notify",
    }
    .to_owned()
}

fn priority_key(priority: Priority) -> String {
    match priority {
        Priority::Low => "low",
        Priority::Normal => "normal",
        Priority::High => "high",
        Priority::Urgent => "urgent",
    }
    .to_owned()
}
