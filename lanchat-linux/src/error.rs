//! Error types for node startup, component loops and the persisted outbox.

use std::fmt;

/// Long-running parts of a node. Each one fails independently of the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Broadcaster,
    Listener,
    Sweeper,
    Server,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Broadcaster => "presence broadcaster",
            Component::Listener => "presence listener",
            Component::Sweeper => "heartbeat sweep",
            Component::Server => "message server",
        };
        f.write_str(name)
    }
}

/// A component could not acquire its socket, or its loop died on an I/O error.
#[derive(Debug, thiserror::Error)]
#[error("{component}: {source}")]
pub struct ComponentError {
    pub component: Component,
    #[source]
    pub source: std::io::Error,
}

impl ComponentError {
    pub fn new(component: Component, source: std::io::Error) -> Self {
        Self { component, source }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("cannot determine local address: {0}")]
    Address(#[source] std::io::Error),
    #[error("no component could start ({} failures)", .0.len())]
    NothingStarted(Vec<ComponentError>),
}

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("queue file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue file format: {0}")]
    Format(#[from] serde_json::Error),
}
