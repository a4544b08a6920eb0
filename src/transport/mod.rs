//! Push channel transport.
//!
//! One persistent bidirectional channel per client session. The session
//! manager owns it, authenticates, keeps room subscriptions across
//! reconnects and feeds a single inbound event stream to the engine.

pub mod frame;
pub mod session;
pub mod websocket;

use anyhow::Result;
use async_trait::async_trait;

use frame::Frame;

/// Lifecycle of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Subscribed,
}

impl SessionState {
    /// Ready for room traffic.
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Subscribed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Authenticated => "authenticated",
            SessionState::Subscribed => "subscribed",
        }
    }
}

/// Everything the session reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    State(SessionState),
    /// An inbound event and its first argument.
    Inbound {
        name: String,
        payload: serde_json::Value,
    },
    /// An emit could not be written to the channel.
    Undelivered { client_id: Option<String> },
}

/// Opens channel links.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, session_token: &str) -> Result<Box<dyn Link>>;
}

/// An open channel.
#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Next frame, or `None` once the peer closed the channel.
    async fn recv(&mut self) -> Result<Option<Frame>>;

    async fn close(&mut self) -> Result<()>;
}
