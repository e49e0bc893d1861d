//! LanChat protocol reference implementation.
//! Host-driven: no I/O; host feeds sightings, outcomes and received lines, and reads back state.

pub mod chat;
pub mod peers;
pub mod protocol;
pub mod queue;

pub use chat::{
    ChatLog, ChatMessage, DeliveryOutcome, DeliveryStatus, Direction, SequenceCounter,
};
pub use peers::{Observed, Peer, PeerSet, Sighting};
pub use protocol::{
    encode_announcement, encode_chat_line, parse_announcement, parse_chat_line, AnnouncementError,
    ChatLine, ACK, DISCOVER_TAG, PING,
};
pub use queue::{OfflineQueue, QueueSnapshot, QueuedMessage};
