//! LanChat for Linux: presence discovery, chat transport and offline queue on tokio.

pub mod addr;
pub mod config;
pub mod console;
pub mod error;
pub mod events;
pub mod node;
pub mod outbox;
pub mod peers;
pub mod presence;
pub mod server;
pub mod transport;

pub use config::Config;
pub use error::{Component, ComponentError, NodeError};
pub use events::NodeEvent;
pub use node::{Node, SendReceipt};
