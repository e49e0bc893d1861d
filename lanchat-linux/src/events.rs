//! Events the node pushes to whoever drives the chat session.

use lanchat_core::DeliveryOutcome;

use crate::error::Component;

/// Events from the network side to the chat session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A peer delivered a message to us.
    MessageReceived { from: String, content: String },
    /// A peer reports it displayed a message we sent.
    Seen { from: String, content: String },
    /// Outcome of the first delivery attempt of a message sent via `Node::send`.
    Delivery {
        sequence: u64,
        destination: String,
        outcome: DeliveryOutcome,
    },
    /// A queued message got through on a later drain. New event; the original
    /// message's delivery status is not revisited.
    Redelivered {
        destination: String,
        sequence: u64,
        content: String,
    },
    /// A component loop ended with an error; the rest of the node keeps running.
    ComponentStopped { component: Component, error: String },
}
