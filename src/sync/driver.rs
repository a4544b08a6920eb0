//! Async driver: owns the engine and feeds it every event in order.
//!
//! Uses an mpsc channel pair. The caller sends `SyncCommand` values, and a
//! background tokio task runs them through the engine together with session
//! events, API completions and the pending-send timer, then sends
//! `SyncUpdate` values back whenever something visible changed.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::engine::{Effect, SyncEngine};
use super::outbox::SendFailure;
use super::presence::Presence;
use crate::api::ChatApi;
use crate::error::SyncError;
use crate::models::wire::WireMessage;
use crate::models::{Message, MessageId};
use crate::room::ConversationKey;
use crate::transport::session::SessionHandle;
use crate::transport::{SessionEvent, SessionState};

/// Commands sent from the presentation layer to the driver.
#[derive(Debug)]
pub enum SyncCommand {
    Activate {
        participants: Vec<String>,
        scope: Option<String>,
    },
    Track {
        participants: Vec<String>,
        scope: Option<String>,
    },
    Untrack(ConversationKey),
    Send(String),
    Retry(MessageId),
    Deactivate,
    Reconnect,
    Shutdown,
}

/// Updates from the driver to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncUpdate {
    Messages {
        key: ConversationKey,
        messages: Vec<Message>,
    },
    Presence(Presence),
    Unread(Vec<(ConversationKey, u32)>),
    SendFailed(SendFailure),
    Error(SyncError),
    Closed,
}

/// Handle for interacting with the driver.
pub struct SyncHandle {
    cmd_tx: mpsc::UnboundedSender<SyncCommand>,
    update_rx: mpsc::UnboundedReceiver<SyncUpdate>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Start the driver. Spawns a tokio task that owns `engine`.
    pub fn start(
        engine: SyncEngine,
        api: Arc<dyn ChatApi>,
        session: SessionHandle,
        session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            engine,
            api,
            session,
            updates: update_tx,
            completions: completion_tx,
            shown: Shown::default(),
        };
        let task = tokio::spawn(driver.run(cmd_rx, session_rx, completion_rx));

        Self {
            cmd_tx,
            update_rx,
            task,
        }
    }

    /// Send a command to the driver (non-blocking).
    pub fn send(&self, cmd: SyncCommand) {
        if self.cmd_tx.send(cmd).is_err() {
            tracing::error!("Driver channel closed -- command dropped");
        }
    }

    /// Receive the next update. `None` once the driver has exited.
    pub async fn recv(&mut self) -> Option<SyncUpdate> {
        self.update_rx.recv().await
    }

    /// Shut down and wait for the driver task to finish.
    pub async fn close(self) {
        self.send(SyncCommand::Shutdown);
        if let Err(e) = self.task.await {
            tracing::error!("Driver task failed: {}", e);
        }
    }
}

/// Results of suspended API calls.
enum Completion {
    History {
        key: ConversationKey,
        generation: u64,
        request: u64,
        result: Result<Vec<WireMessage>, String>,
    },
    Sent {
        key: ConversationKey,
        generation: u64,
        placeholder: MessageId,
        result: Result<WireMessage, String>,
    },
}

/// What the caller has last been told.
#[derive(Default)]
struct Shown {
    key: Option<ConversationKey>,
    messages: Vec<Message>,
    presence: Option<Presence>,
    unread: Vec<(ConversationKey, u32)>,
}

struct Driver {
    engine: SyncEngine,
    api: Arc<dyn ChatApi>,
    session: SessionHandle,
    updates: mpsc::UnboundedSender<SyncUpdate>,
    completions: mpsc::UnboundedSender<Completion>,
    shown: Shown,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SyncCommand>,
        mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        let mut session_open = true;

        loop {
            let deadline = self.engine.next_deadline();
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        None | Some(SyncCommand::Shutdown) => break,
                        Some(cmd) => self.handle(cmd),
                    }
                }
                event = session_rx.recv(), if session_open => {
                    match event {
                        Some(event) => self.on_session(event),
                        None => {
                            tracing::warn!("Session task exited");
                            session_open = false;
                            self.engine.on_session_state(SessionState::Disconnected);
                        }
                    }
                }
                Some(done) = completions.recv() => self.complete(done),
                _ = wait_until(deadline) => self.engine.expire(Instant::now()),
            }
            self.execute_effects();
            self.publish();
        }

        self.engine.deactivate_conversation();
        self.execute_effects();
        self.session.shutdown();
        let _ = self.updates.send(SyncUpdate::Closed);
        tracing::info!("Driver stopped");
    }

    fn handle(&mut self, cmd: SyncCommand) {
        let result = match cmd {
            SyncCommand::Activate {
                participants,
                scope,
            } => {
                let ids: Vec<&str> = participants.iter().map(String::as_str).collect();
                self.engine
                    .activate_conversation(&ids, scope.as_deref())
                    .map(drop)
            }
            SyncCommand::Track {
                participants,
                scope,
            } => {
                let ids: Vec<&str> = participants.iter().map(String::as_str).collect();
                self.engine
                    .track_conversation(&ids, scope.as_deref())
                    .map(drop)
            }
            SyncCommand::Untrack(key) => {
                self.engine.untrack_conversation(&key);
                Ok(())
            }
            SyncCommand::Send(body) => self.engine.send_user_message(&body).map(drop),
            SyncCommand::Retry(placeholder) => self.engine.retry_failed(&placeholder).map(drop),
            SyncCommand::Deactivate => {
                self.engine.deactivate_conversation();
                Ok(())
            }
            SyncCommand::Reconnect => {
                self.session.reconnect();
                Ok(())
            }
            SyncCommand::Shutdown => Ok(()),
        };
        if let Err(e) = result {
            let _ = self.updates.send(SyncUpdate::Error(e));
        }
    }

    fn on_session(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::State(state) => self.engine.on_session_state(state),
            SessionEvent::Inbound { name, payload } => {
                self.engine.on_channel_event(&name, &payload, Utc::now())
            }
            SessionEvent::Undelivered { client_id } => {
                self.engine.on_undelivered(client_id.as_deref())
            }
        }
    }

    fn complete(&mut self, done: Completion) {
        let result = match done {
            Completion::History {
                key,
                generation,
                request,
                result,
            } => self
                .engine
                .on_history(&key, generation, request, result, Utc::now()),
            Completion::Sent {
                key,
                generation,
                placeholder,
                result,
            } => self
                .engine
                .on_send_result(&key, generation, &placeholder, result, Utc::now()),
        };
        match result {
            Err(e) if e.is_user_visible() => {
                let _ = self.updates.send(SyncUpdate::Error(e));
            }
            Err(e) => tracing::debug!("Completion discarded: {}", e),
            Ok(()) => {}
        }
    }

    /// Run queued effects until the engine stops producing new ones.
    fn execute_effects(&mut self) {
        loop {
            let effects = self.engine.take_effects();
            if effects.is_empty() {
                return;
            }
            for effect in effects {
                self.execute(effect);
            }
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Join(key) => self.session.join(key.to_string()),
            Effect::Leave(key) => self.session.leave(key.to_string()),
            Effect::Emit(outgoing) => match serde_json::to_value(&outgoing) {
                Ok(payload) => {
                    self.session
                        .emit("sendMessage", payload, Some(outgoing.client_id.clone()))
                }
                Err(e) => {
                    tracing::error!("Failed to encode {}: {}", outgoing.client_id, e);
                    self.engine.on_undelivered(Some(&outgoing.client_id));
                }
            },
            Effect::FetchHistory {
                key,
                generation,
                request,
            } => {
                let api = Arc::clone(&self.api);
                let tx = self.completions.clone();
                tokio::spawn(async move {
                    let result = api
                        .fetch_history(&key)
                        .await
                        .map_err(|e| format!("{:#}", e));
                    let _ = tx.send(Completion::History {
                        key,
                        generation,
                        request,
                        result,
                    });
                });
            }
            Effect::SendFallback {
                key,
                generation,
                placeholder,
                outgoing,
            } => {
                let api = Arc::clone(&self.api);
                let tx = self.completions.clone();
                tokio::spawn(async move {
                    let result = api
                        .send_message(&key, &outgoing)
                        .await
                        .map_err(|e| format!("{:#}", e));
                    let _ = tx.send(Completion::Sent {
                        key,
                        generation,
                        placeholder,
                        result,
                    });
                });
            }
        }
    }

    /// Tell the caller about whatever changed since the last round.
    fn publish(&mut self) {
        for failure in self.engine.take_failures() {
            let _ = self.updates.send(SyncUpdate::SendFailed(failure));
        }

        let key = self.engine.active_key().cloned();
        let messages = self.engine.messages();
        if key != self.shown.key || messages != self.shown.messages.as_slice() {
            self.shown.messages = messages.to_vec();
            self.shown.key = key.clone();
            if let Some(key) = key {
                let _ = self.updates.send(SyncUpdate::Messages {
                    key,
                    messages: self.shown.messages.clone(),
                });
            }
        }

        let presence = self.engine.presence();
        if self.shown.presence != Some(presence) {
            self.shown.presence = Some(presence);
            let _ = self.updates.send(SyncUpdate::Presence(presence));
        }

        let unread = self.engine.unread_counts();
        if unread != self.shown.unread {
            self.shown.unread = unread.clone();
            let _ = self.updates.send(SyncUpdate::Unread(unread));
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::models::wire::OutgoingMessage;
    use crate::models::{MessageStatus, Participant, Role};
    use crate::transport::session::{self, RetryPolicy, SessionConfig};
    use crate::transport::testing::MemoryConnector;

    struct FakeApi {
        history: Vec<WireMessage>,
        sent: Mutex<Vec<OutgoingMessage>>,
    }

    impl FakeApi {
        fn new(history: Vec<WireMessage>) -> Arc<Self> {
            Arc::new(Self {
                history,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatApi for FakeApi {
        async fn fetch_history(&self, _key: &ConversationKey) -> Result<Vec<WireMessage>> {
            Ok(self.history.clone())
        }

        async fn send_message(
            &self,
            _key: &ConversationKey,
            outgoing: &OutgoingMessage,
        ) -> Result<WireMessage> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(outgoing.clone());
            Ok(WireMessage {
                id: Some(format!("srv-{}", sent.len())),
                sender_id: Some(outgoing.sender_id.clone()),
                body: Some(outgoing.body.clone()),
                ..Default::default()
            })
        }
    }

    fn session_config(max_attempts: u32) -> SessionConfig {
        SessionConfig {
            user_id: "p1".into(),
            token: "secret".into(),
            retry: RetryPolicy {
                max_attempts,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(5),
            },
            auth_ack_timeout: Some(Duration::from_secs(5)),
            heartbeat: Duration::from_secs(30),
        }
    }

    fn engine() -> SyncEngine {
        SyncEngine::new(
            Participant::new("p1", "Pat", Role::Patient),
            Duration::from_secs(10),
        )
    }

    fn activate(handle: &SyncHandle) {
        handle.send(SyncCommand::Activate {
            participants: vec!["p1".into(), "p2".into()],
            scope: None,
        });
    }

    /// Next update satisfying `pred`, failing the test after a few seconds.
    async fn wait_for(handle: &mut SyncHandle, pred: impl Fn(&SyncUpdate) -> bool) -> SyncUpdate {
        let found = time::timeout(Duration::from_secs(5), async {
            loop {
                match handle.recv().await {
                    Some(update) if pred(&update) => return update,
                    Some(_) => continue,
                    None => panic!("driver exited"),
                }
            }
        })
        .await;
        found.expect("timed out waiting for update")
    }

    fn bodies(update: &SyncUpdate) -> Vec<(String, MessageStatus)> {
        match update {
            SyncUpdate::Messages { messages, .. } => messages
                .iter()
                .map(|m| (m.body.clone(), m.status))
                .collect(),
            _ => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_send_over_channel_confirmed_by_ack() {
        let (connector, mut accepted) = MemoryConnector::new();
        let (session, session_rx, _task) = session::spawn(Arc::new(connector), session_config(3));
        let history = vec![WireMessage {
            id: Some("h1".into()),
            sender_id: Some("p2".into()),
            body: Some("hello".into()),
            created_at: Some(json!("2024-05-01T12:00:00Z")),
            ..Default::default()
        }];
        let mut handle = SyncHandle::start(engine(), FakeApi::new(history), session, session_rx);
        activate(&handle);

        let mut server = accepted.recv().await.unwrap();
        let (name, _) = server.next_event().await;
        assert_eq!(name, "authenticate");
        server.push("authenticated", json!({}));
        let (name, payload) = server.next_event().await;
        assert_eq!(name, "joinRoom");
        assert_eq!(payload["room"], "p1_p2");

        // Presence and history arrive in either order.
        let (mut online, mut loaded) = (false, false);
        while !(online && loaded) {
            let update = wait_for(&mut handle, |_| true).await;
            online |= update == SyncUpdate::Presence(Presence::Online);
            loaded |= bodies(&update).len() == 1;
        }

        handle.send(SyncCommand::Send("hi".into()));
        let pending = wait_for(&mut handle, |u| bodies(u).len() == 2).await;
        assert_eq!(bodies(&pending)[1], ("hi".to_string(), MessageStatus::Pending));

        let (name, payload) = server.next_event().await;
        assert_eq!(name, "sendMessage");
        assert_eq!(payload["receiverId"], "p2");
        let client_id = payload["clientId"].as_str().unwrap().to_string();
        server.push(
            "messageAck",
            json!({
                "clientId": client_id,
                "message": { "id": "s1", "senderId": "p1", "receiverId": "p2", "body": "hi" }
            }),
        );

        let confirmed = wait_for(&mut handle, |u| {
            bodies(u).get(1).map(|b| b.1) == Some(MessageStatus::Confirmed)
        })
        .await;
        assert_eq!(
            bodies(&confirmed),
            vec![
                ("hello".to_string(), MessageStatus::Confirmed),
                ("hi".to_string(), MessageStatus::Confirmed),
            ]
        );

        handle.send(SyncCommand::Shutdown);
        wait_for(&mut handle, |u| *u == SyncUpdate::Closed).await;
    }

    #[tokio::test]
    async fn test_fallback_send_while_channel_down() {
        let (connector, _accepted) = MemoryConnector::new();
        connector.set_refuse(true);
        let (session, session_rx, _task) = session::spawn(Arc::new(connector), session_config(1));
        let api = FakeApi::new(Vec::new());
        let mut handle = SyncHandle::start(engine(), api.clone(), session, session_rx);
        activate(&handle);

        handle.send(SyncCommand::Send("offline".into()));
        let confirmed = wait_for(&mut handle, |u| {
            bodies(u) == vec![("offline".to_string(), MessageStatus::Confirmed)]
        })
        .await;
        match confirmed {
            SyncUpdate::Messages { key, messages } => {
                assert_eq!(key.to_string(), "p1_p2");
                assert_eq!(messages[0].id, MessageId::Server("srv-1".into()));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(api.sent.lock().unwrap().len(), 1);

        handle.send(SyncCommand::Send("  ".into()));
        wait_for(&mut handle, |u| *u == SyncUpdate::Error(SyncError::EmptyBody)).await;

        handle.close().await;
    }
}
