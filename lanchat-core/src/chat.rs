//! Chat log model: messages, delivery status, sequence allocation.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Seen,
    Failed,
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Peer answered `ACK`.
    Delivered,
    /// Connect, write, read or timeout failure. The message was queued for retry.
    Unreachable,
    /// Peer answered something other than `ACK`. Not queued.
    Rejected,
    /// Destination is not an IPv4 address. Nothing was sent or queued.
    InvalidDestination,
}

impl DeliveryOutcome {
    pub fn is_delivered(self) -> bool {
        self == DeliveryOutcome::Delivered
    }

    pub fn status(self) -> DeliveryStatus {
        match self {
            DeliveryOutcome::Delivered => DeliveryStatus::Delivered,
            DeliveryOutcome::Unreachable
            | DeliveryOutcome::Rejected
            | DeliveryOutcome::InvalidDestination => DeliveryStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Address of the author ("self" address for sent messages).
    pub sender: String,
    /// The other side of the conversation.
    pub peer: String,
    pub content: String,
    pub direction: Direction,
    pub status: DeliveryStatus,
    /// Sender-assigned sequence for sent messages; local arrival index for received ones.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// Allocates strictly increasing sequence numbers for one device.
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Resume after the highest sequence already used (e.g. restored from the offline queue).
    pub fn resume_after(last_used: Option<u64>) -> Self {
        Self::starting_at(last_used.map_or(1, |s| s.saturating_add(1)))
    }

    pub fn next_sequence(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Append-only conversation log held by a chat session.
#[derive(Debug, Default)]
pub struct ChatLog {
    local_address: String,
    messages: Vec<ChatMessage>,
    received: u64,
}

impl ChatLog {
    pub fn new(local_address: impl Into<String>) -> Self {
        Self {
            local_address: local_address.into(),
            messages: Vec::new(),
            received: 0,
        }
    }

    /// Record a message we are about to send, status `Sent`.
    pub fn record_sent(&mut self, peer: &str, content: &str, sequence: u64) -> &ChatMessage {
        self.push(ChatMessage {
            sender: self.local_address.clone(),
            peer: peer.to_string(),
            content: content.to_string(),
            direction: Direction::Sent,
            status: DeliveryStatus::Sent,
            sequence,
            timestamp: Utc::now(),
        })
    }

    /// Record a message a peer delivered to us.
    pub fn record_received(&mut self, peer: &str, content: &str) -> &ChatMessage {
        self.received += 1;
        self.push(ChatMessage {
            sender: peer.to_string(),
            peer: peer.to_string(),
            content: content.to_string(),
            direction: Direction::Received,
            status: DeliveryStatus::Delivered,
            sequence: self.received,
            timestamp: Utc::now(),
        })
    }

    fn push(&mut self, msg: ChatMessage) -> &ChatMessage {
        self.messages.push(msg);
        &self.messages[self.messages.len() - 1]
    }

    /// Apply the outcome of the send that produced message `sequence`.
    ///
    /// Only a message still in `Sent` moves; later outcomes for the same sequence (for
    /// example a retry from the offline queue) leave it untouched. Returns the new status.
    pub fn apply_outcome(&mut self, sequence: u64, outcome: DeliveryOutcome) -> Option<DeliveryStatus> {
        let msg = self.messages.iter_mut().find(|m| {
            m.direction == Direction::Sent
                && m.sequence == sequence
                && m.status == DeliveryStatus::Sent
        })?;
        msg.status = outcome.status();
        Some(msg.status)
    }

    /// Mark the most recent delivered message to `peer` with this content as seen.
    pub fn mark_seen(&mut self, peer: &str, content: &str) -> bool {
        let found = self.messages.iter_mut().rev().find(|m| {
            m.direction == Direction::Sent
                && m.peer == peer
                && m.content == content
                && m.status == DeliveryStatus::Delivered
        });
        match found {
            Some(m) => {
                m.status = DeliveryStatus::Seen;
                true
            }
            None => false,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn conversation<'a>(&'a self, peer: &'a str) -> impl Iterator<Item = &'a ChatMessage> + 'a {
        self.messages.iter().filter(move |m| m.peer == peer)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
