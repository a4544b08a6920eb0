//! Request/response API for conversation history and fallback sends

pub mod client;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::wire::{OutgoingMessage, WireMessage};
use crate::room::ConversationKey;

pub use client::HttpChatApi;

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Stored messages of a conversation, in whatever order the server keeps them.
    async fn fetch_history(&self, key: &ConversationKey) -> Result<Vec<WireMessage>>;

    /// Send without the push channel. Returns the server's copy.
    async fn send_message(
        &self,
        key: &ConversationKey,
        outgoing: &OutgoingMessage,
    ) -> Result<WireMessage>;
}
