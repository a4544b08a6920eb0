//! Conversation identity: key derivation and event classification.

mod key;
mod resolver;

pub use key::{ConversationKey, PairKey};
pub use resolver::{Classification, RoomResolver};
