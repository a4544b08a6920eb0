//! Conversation synchronization: merge, optimistic sends, presence and the
//! engine that ties them to the transport.

pub mod conversation;
pub mod driver;
pub mod engine;
pub mod merge;
pub mod outbox;
pub mod presence;

pub use driver::{SyncCommand, SyncHandle, SyncUpdate};
pub use engine::{Effect, SyncEngine};
pub use outbox::SendFailure;
pub use presence::Presence;
