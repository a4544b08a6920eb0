//! Data models for conversations

mod message;
mod participant;
pub mod wire;

pub use message::*;
pub use participant::*;
