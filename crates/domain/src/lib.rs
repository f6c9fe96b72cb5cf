//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod buffer;
mod keys;
mod leader;
mod message;

pub use buffer::BufferEntry;
pub use keys::{ConversationKey, CoordinationKeys, leader_lock_key, resource_lock_key};
pub use leader::LeaderToken;
pub use message::{InboundMessage, MessageProvider, merge_message_texts};
