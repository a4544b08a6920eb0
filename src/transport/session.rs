//! Transport session manager.
//!
//! Runs as one task that owns the channel:
//! `Connecting -> Connected -> Authenticated -> Subscribed`, back to
//! `Connecting` when the link drops, and `Disconnected` once retries are
//! exhausted or the session is shut down. Room membership is kept locally and
//! replayed after every authentication because the server forgets it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use super::frame::Frame;
use super::{Connector, Link, SessionEvent, SessionState};

/// Bounded retry with capped exponential delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(64),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub user_id: String,
    pub token: String,
    pub retry: RetryPolicy,
    /// `None` treats authentication as immediate.
    pub auth_ack_timeout: Option<Duration>,
    pub heartbeat: Duration,
}

#[derive(Debug)]
pub enum SessionCommand {
    Join(String),
    Leave(String),
    Emit {
        name: String,
        payload: Value,
        client_id: Option<String>,
    },
    Reconnect,
    Shutdown,
}

/// Cheap handle for issuing commands to the session task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    fn command(&self, cmd: SessionCommand) {
        if self.tx.send(cmd).is_err() {
            tracing::debug!("Session task has exited, command dropped");
        }
    }

    pub fn join(&self, room: impl Into<String>) {
        self.command(SessionCommand::Join(room.into()));
    }

    pub fn leave(&self, room: impl Into<String>) {
        self.command(SessionCommand::Leave(room.into()));
    }

    pub fn emit(&self, name: &str, payload: Value, client_id: Option<String>) {
        self.command(SessionCommand::Emit {
            name: name.to_string(),
            payload,
            client_id,
        });
    }

    pub fn reconnect(&self) {
        self.command(SessionCommand::Reconnect);
    }

    pub fn shutdown(&self) {
        self.command(SessionCommand::Shutdown);
    }
}

/// Start the session task.
pub fn spawn(
    connector: Arc<dyn Connector>,
    config: SessionConfig,
) -> (
    SessionHandle,
    mpsc::UnboundedReceiver<SessionEvent>,
    JoinHandle<()>,
) {
    let (tx, commands) = mpsc::unbounded_channel();
    let (events, events_rx) = mpsc::unbounded_channel();
    let session = Session {
        connector,
        config,
        rooms: BTreeSet::new(),
        commands,
        events,
        state: SessionState::Disconnected,
    };
    let task = tokio::spawn(session.run());
    (SessionHandle { tx }, events_rx, task)
}

/// Why a link stopped being served.
enum Exit {
    Shutdown,
    /// An established link went away.
    Dropped(anyhow::Error),
    /// The link never reached `authenticated`.
    Failed(anyhow::Error),
}

struct Session {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    rooms: BTreeSet<String>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: SessionState,
}

impl Session {
    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        tracing::info!("Session {} -> {}", self.state.as_str(), state.as_str());
        self.state = state;
        let _ = self.events.send(SessionEvent::State(state));
    }

    async fn run(mut self) {
        let mut attempt = 0u32;
        loop {
            self.set_state(SessionState::Connecting);
            let exit = match self.establish().await {
                Ok(link) => {
                    attempt = 0;
                    self.serve(link).await
                }
                Err(e) => Exit::Failed(e),
            };

            let resume = match exit {
                Exit::Shutdown => false,
                Exit::Dropped(e) => {
                    let delay = self.config.retry.initial_delay;
                    tracing::warn!("Channel dropped: {:#}. Reconnecting in {:?}...", e, delay);
                    self.set_state(SessionState::Connecting);
                    self.pause(delay).await
                }
                Exit::Failed(e) => {
                    attempt += 1;
                    if attempt >= self.config.retry.max_attempts {
                        tracing::warn!(
                            "Channel unavailable after {} attempts: {:#}. Waiting for reconnect request",
                            attempt,
                            e
                        );
                        self.set_state(SessionState::Disconnected);
                        attempt = 0;
                        self.idle().await
                    } else {
                        let delay = self.config.retry.delay_for(attempt);
                        tracing::warn!(
                            "Connect attempt {} failed: {:#}. Retrying in {:?}...",
                            attempt,
                            e,
                            delay
                        );
                        self.pause(delay).await
                    }
                }
            };
            if !resume {
                break;
            }
        }
        self.set_state(SessionState::Disconnected);
        tracing::info!("Session closed");
    }

    /// Connect, authenticate and replay room membership.
    async fn establish(&mut self) -> Result<Box<dyn Link>> {
        let mut link = self
            .connector
            .connect(&self.config.token)
            .await
            .context("Failed to open channel")?;
        self.set_state(SessionState::Connected);

        let auth = json!({ "userId": self.config.user_id, "token": self.config.token });
        link.send(Frame::event("authenticate", auth))
            .await
            .context("Failed to send authenticate")?;

        if let Some(timeout) = self.config.auth_ack_timeout {
            time::timeout(timeout, await_authenticated(&mut *link, &self.events))
                .await
                .map_err(|_| anyhow!("No authentication ack within {:?}", timeout))??;
        }
        self.set_state(SessionState::Authenticated);

        for room in &self.rooms {
            link.send(Frame::event("joinRoom", json!({ "room": room })))
                .await
                .with_context(|| format!("Failed to join {}", room))?;
        }
        self.set_state(SessionState::Subscribed);
        Ok(link)
    }

    async fn serve(&mut self, mut link: Box<dyn Link>) -> Exit {
        let mut heartbeat = time::interval(self.config.heartbeat);
        heartbeat.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                frame = link.recv() => {
                    match frame {
                        Ok(Some(frame)) => self.dispatch(frame),
                        Ok(None) => return Exit::Dropped(anyhow!("Channel closed by server")),
                        Err(e) => return Exit::Dropped(e.context("Channel recv error")),
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = link.send(Frame::Heartbeat).await {
                        return Exit::Dropped(e.context("Heartbeat send failed"));
                    }
                }
                cmd = self.commands.recv() => {
                    let cmd = cmd.unwrap_or(SessionCommand::Shutdown);
                    match cmd {
                        SessionCommand::Join(room) => {
                            if self.rooms.insert(room.clone()) {
                                let frame = Frame::event("joinRoom", json!({ "room": room }));
                                if let Err(e) = link.send(frame).await {
                                    return Exit::Dropped(e.context("joinRoom send failed"));
                                }
                            }
                        }
                        SessionCommand::Leave(room) => {
                            if self.rooms.remove(&room) {
                                let frame = Frame::event("leaveRoom", json!({ "room": room }));
                                if let Err(e) = link.send(frame).await {
                                    return Exit::Dropped(e.context("leaveRoom send failed"));
                                }
                            }
                        }
                        SessionCommand::Emit { name, payload, client_id } => {
                            if let Err(e) = link.send(Frame::event(&name, payload)).await {
                                self.undelivered(client_id);
                                return Exit::Dropped(e.context("Emit failed"));
                            }
                        }
                        SessionCommand::Reconnect => {
                            if let Err(e) = link.close().await {
                                tracing::debug!("Close before reconnect failed: {:#}", e);
                            }
                            return Exit::Dropped(anyhow!("Reconnect requested"));
                        }
                        SessionCommand::Shutdown => {
                            self.teardown(&mut *link).await;
                            return Exit::Shutdown;
                        }
                    }
                }
            }
        }
    }

    /// Leave every room and close the link.
    async fn teardown(&mut self, link: &mut dyn Link) {
        for room in std::mem::take(&mut self.rooms) {
            let frame = Frame::event("leaveRoom", json!({ "room": room }));
            if let Err(e) = link.send(frame).await {
                tracing::debug!("leaveRoom during teardown failed: {:#}", e);
                break;
            }
        }
        if let Err(e) = link.close().await {
            tracing::debug!("Close failed: {:#}", e);
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        match frame {
            Frame::Event { name, args, .. } => {
                if name == "authenticated" {
                    tracing::debug!("Repeated authentication ack");
                    return;
                }
                let payload = args.into_iter().next().unwrap_or(Value::Null);
                let _ = self.events.send(SessionEvent::Inbound { name, payload });
            }
            Frame::Heartbeat => tracing::debug!("Heartbeat from server"),
            other => tracing::debug!("Ignoring frame: {}", other.encode()),
        }
    }

    fn undelivered(&self, client_id: Option<String>) {
        let _ = self.events.send(SessionEvent::Undelivered { client_id });
    }

    /// Handle a command while no link is up. Returns `Some(resume)` when the
    /// command ends the wait.
    fn offline(&mut self, cmd: Option<SessionCommand>) -> Option<bool> {
        match cmd {
            None | Some(SessionCommand::Shutdown) => {
                self.rooms.clear();
                Some(false)
            }
            Some(SessionCommand::Reconnect) => Some(true),
            Some(SessionCommand::Join(room)) => {
                self.rooms.insert(room);
                None
            }
            Some(SessionCommand::Leave(room)) => {
                self.rooms.remove(&room);
                None
            }
            Some(SessionCommand::Emit { client_id, .. }) => {
                self.undelivered(client_id);
                None
            }
        }
    }

    /// Wait out a retry delay. Returns false on shutdown.
    async fn pause(&mut self, delay: Duration) -> bool {
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => {
                    if let Some(resume) = self.offline(cmd) {
                        return resume;
                    }
                }
            }
        }
    }

    /// Wait for an explicit reconnect. Returns false on shutdown.
    async fn idle(&mut self) -> bool {
        loop {
            let cmd = self.commands.recv().await;
            if let Some(resume) = self.offline(cmd) {
                return resume;
            }
        }
    }
}

/// Read frames until the server acknowledges authentication.
async fn await_authenticated(
    link: &mut dyn Link,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> Result<()> {
    loop {
        match link.recv().await? {
            Some(Frame::Event { name, .. }) if name == "authenticated" => return Ok(()),
            Some(Frame::Event { name, args, .. }) => {
                let payload = args.into_iter().next().unwrap_or(Value::Null);
                let _ = events.send(SessionEvent::Inbound { name, payload });
            }
            Some(_) => {}
            None => anyhow::bail!("Channel closed during authentication"),
        }
    }
}
