//! The synchronization engine.
//!
//! Pure state machine: every input (user action, session transition, inbound
//! event, fetch/send completion, timer tick) is a method call, and all I/O it
//! wants done is queued as an [`Effect`] for the driver to execute. Suspended
//! operations carry the generation they were issued under and their results
//! are discarded once the conversation they belong to is no longer active.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;

use super::conversation::Conversation;
use super::outbox::SendFailure;
use super::presence::{Presence, PresenceTracker};
use crate::error::SyncError;
use crate::models::wire::{self, Decoded, IncomingMessage, OutgoingMessage, WireMessage};
use crate::models::{Message, MessageId, MessageStatus, Participant};
use crate::room::{Classification, ConversationKey, RoomResolver};
use crate::transport::SessionState;

/// I/O requested by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Join(ConversationKey),
    Leave(ConversationKey),
    FetchHistory {
        key: ConversationKey,
        generation: u64,
        /// Orders fetches; an older batch never replaces a newer one.
        request: u64,
    },
    /// Send over the push channel.
    Emit(OutgoingMessage),
    /// Send through the request/response API.
    SendFallback {
        key: ConversationKey,
        generation: u64,
        placeholder: MessageId,
        outgoing: OutgoingMessage,
    },
}

pub struct SyncEngine {
    me: Participant,
    send_timeout: Duration,
    resolver: RoomResolver,
    active: Option<Conversation>,
    generation: u64,
    next_request: u64,
    /// Request id of the last history batch applied.
    history_request: u64,
    next_placeholder: u64,
    session: SessionState,
    ever_ready: bool,
    presence: PresenceTracker,
    /// placeholder -> body, for failures of the active conversation
    retryable: HashMap<MessageId, String>,
    effects: Vec<Effect>,
    failures: Vec<SendFailure>,
}

impl SyncEngine {
    pub fn new(me: Participant, send_timeout: Duration) -> Self {
        Self {
            me,
            send_timeout,
            resolver: RoomResolver::new(),
            active: None,
            generation: 0,
            next_request: 1,
            history_request: 0,
            next_placeholder: 1,
            session: SessionState::Disconnected,
            ever_ready: false,
            presence: PresenceTracker::default(),
            retryable: HashMap::new(),
            effects: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn me(&self) -> &Participant {
        &self.me
    }

    fn own_key(&self, participants: &[&str], scope: Option<&str>) -> Result<ConversationKey, SyncError> {
        let key = ConversationKey::derive(participants, scope)?;
        if !key.pair().contains(&self.me.id) {
            return Err(SyncError::InvalidParticipants(format!(
                "{} is not part of {}",
                self.me.id, key
            )));
        }
        Ok(key)
    }

    /// Make the conversation between `participants` (optionally scoped) the
    /// active one. Subscribes to its room and requests its history.
    pub fn activate_conversation(
        &mut self,
        participants: &[&str],
        scope: Option<&str>,
    ) -> Result<ConversationKey, SyncError> {
        let key = self.own_key(participants, scope)?;
        if self.active_key() == Some(&key) {
            return Ok(key);
        }
        self.deactivate_conversation();

        self.generation += 1;
        self.resolver.activate(key.clone());
        self.active = Some(Conversation::new(key.clone(), self.send_timeout));
        tracing::info!("Activated conversation {}", key);

        self.effects.push(Effect::Join(key.clone()));
        self.request_history(key.clone());
        Ok(key)
    }

    /// Tear down the active conversation. Its pending sends and timers go
    /// with it; late completions become stale.
    pub fn deactivate_conversation(&mut self) -> Option<ConversationKey> {
        let conversation = self.active.take()?;
        self.resolver.deactivate();
        self.generation += 1;
        self.retryable.clear();

        let key = conversation.key().clone();
        if conversation.pending_count() > 0 {
            tracing::debug!(
                "Dropping {} pending sends of {}",
                conversation.pending_count(),
                key
            );
        }
        if !self.resolver.is_tracked(&key) {
            self.effects.push(Effect::Leave(key.clone()));
        }
        tracing::info!("Deactivated conversation {}", key);
        Some(key)
    }

    /// Count unread messages for an inactive conversation.
    pub fn track_conversation(
        &mut self,
        participants: &[&str],
        scope: Option<&str>,
    ) -> Result<ConversationKey, SyncError> {
        let key = self.own_key(participants, scope)?;
        if self.resolver.track(key.clone()) && self.active_key() != Some(&key) {
            self.effects.push(Effect::Join(key.clone()));
        }
        Ok(key)
    }

    fn request_history(&mut self, key: ConversationKey) {
        let request = self.next_request;
        self.next_request += 1;
        self.effects.push(Effect::FetchHistory {
            key,
            generation: self.generation,
            request,
        });
    }

    pub fn untrack_conversation(&mut self, key: &ConversationKey) -> bool {
        if !self.resolver.untrack(key) {
            return false;
        }
        if self.active_key() != Some(key) {
            self.effects.push(Effect::Leave(key.clone()));
        }
        true
    }

    /// Submit a message in the active conversation. It shows up immediately
    /// as pending under the returned placeholder id.
    pub fn send_user_message(&mut self, body: &str) -> Result<MessageId, SyncError> {
        self.send_user_message_at(body, Instant::now(), Utc::now())
    }

    pub fn send_user_message_at(
        &mut self,
        body: &str,
        now: Instant,
        created_at: DateTime<Utc>,
    ) -> Result<MessageId, SyncError> {
        let conversation = self
            .active
            .as_mut()
            .ok_or(SyncError::NoActiveConversation)?;
        if body.trim().is_empty() {
            return Err(SyncError::EmptyBody);
        }

        let placeholder = MessageId::Placeholder(self.next_placeholder);
        let key = conversation.key().clone();
        let message = Message {
            id: placeholder.clone(),
            conversation_key: key.clone(),
            sender: self.me.clone(),
            body: body.to_string(),
            created_at,
            scope_token: key.scope().map(String::from),
            status: MessageStatus::Pending,
        };
        let outgoing = OutgoingMessage::from_pending(&message);
        conversation.stage(message, now)?;
        self.next_placeholder += 1;

        if self.session.is_ready() {
            self.effects.push(Effect::Emit(outgoing));
        } else {
            let reason = SyncError::TransportUnavailable(self.session.as_str().to_string());
            tracing::debug!("{}, sending {} via fallback", reason, placeholder);
            self.effects.push(Effect::SendFallback {
                key,
                generation: self.generation,
                placeholder: placeholder.clone(),
                outgoing,
            });
        }
        Ok(placeholder)
    }

    /// Resubmit a failed message under a fresh placeholder.
    pub fn retry_failed(&mut self, placeholder: &MessageId) -> Result<MessageId, SyncError> {
        let body = self
            .retryable
            .get(placeholder)
            .cloned()
            .ok_or_else(|| SyncError::UnknownFailure(placeholder.clone()))?;
        let id = self.send_user_message(&body)?;
        self.retryable.remove(placeholder);
        Ok(id)
    }

    pub fn on_session_state(&mut self, state: SessionState) {
        let was_ready = self.session.is_ready();
        self.session = state;
        if self.presence.apply(state) {
            tracing::info!("Presence: {}", self.presence.current().as_str());
        }

        if state.is_ready() && !was_ready {
            // Events sent while the channel was down are lost; refetch.
            if self.ever_ready {
                if let Some(key) = self.active_key().cloned() {
                    tracing::info!("Resynchronizing {} after reconnect", key);
                    self.request_history(key);
                }
            }
            self.ever_ready = true;
        }
    }

    /// Inbound channel event.
    pub fn on_channel_event(&mut self, name: &str, payload: &Value, received_at: DateTime<Utc>) {
        match name {
            "message" | "receiveMessage" | "newMessage" => self.on_push(payload, received_at),
            "messageAck" => {
                let message = payload.get("message").unwrap_or(payload);
                let client_id = payload.get("clientId").and_then(Value::as_str);
                self.on_echo(client_id, message, received_at);
            }
            "messageError" => {
                let client_id = payload.get("clientId").and_then(Value::as_str);
                let reason = payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("rejected by server");
                match client_id.and_then(MessageId::parse_placeholder) {
                    Some(placeholder) => self.reject(&placeholder, reason.to_string()),
                    None => tracing::debug!("messageError without a usable clientId: {}", payload),
                }
            }
            other => tracing::debug!("Ignoring channel event {}", other),
        }
    }

    fn on_push(&mut self, payload: &Value, received_at: DateTime<Utc>) {
        let incoming = match decode_event(payload, received_at) {
            Some(incoming) => incoming,
            None => return,
        };
        // A push carrying our correlation id is a direct echo.
        let placeholder = incoming
            .client_id
            .as_deref()
            .and_then(MessageId::parse_placeholder);
        self.admit(incoming, placeholder);
    }

    fn on_echo(&mut self, client_id: Option<&str>, payload: &Value, received_at: DateTime<Utc>) {
        let incoming = match decode_event(payload, received_at) {
            Some(incoming) => incoming,
            None => return,
        };
        let placeholder = client_id
            .or(incoming.client_id.as_deref())
            .and_then(MessageId::parse_placeholder);
        self.admit(incoming, placeholder);
    }

    /// Route a decoded message to the active conversation or an unread counter.
    fn admit(&mut self, incoming: IncomingMessage, placeholder: Option<MessageId>) {
        match self.resolver.classify(&incoming) {
            Classification::Active(key) => {
                let message = incoming.into_message(key);
                if let Some(conversation) = self.active.as_mut() {
                    match placeholder {
                        Some(placeholder) => {
                            conversation.confirm(&placeholder, message);
                        }
                        None => {
                            conversation.apply_push(message);
                        }
                    }
                }
            }
            Classification::Other(key) => {
                let count = self.resolver.record_unread(&key, &incoming.id);
                tracing::debug!("{} unread in {}", count, key);
            }
            Classification::Reject(reason) => {
                tracing::debug!("Dropping event {}: {}", incoming.id, reason);
            }
        }
    }

    fn reject(&mut self, placeholder: &MessageId, reason: String) {
        let error = SyncError::SendRejected {
            placeholder: placeholder.clone(),
            reason,
        };
        let failure = self
            .active
            .as_mut()
            .and_then(|c| c.fail(placeholder, error));
        match failure {
            Some(failure) => self.record_failure(failure),
            None => tracing::debug!("Rejection for unknown or settled {}", placeholder),
        }
    }

    fn record_failure(&mut self, failure: SendFailure) {
        tracing::warn!("{}", failure.error);
        self.retryable
            .insert(failure.placeholder.clone(), failure.body.clone());
        self.failures.push(failure);
    }

    fn stale(&self, key: &ConversationKey, generation: u64) -> Option<SyncError> {
        if self.is_current(key, generation) {
            return None;
        }
        let error = SyncError::StaleCompletion(key.to_string());
        tracing::debug!("{}", error);
        Some(error)
    }

    /// History fetch completed.
    pub fn on_history(
        &mut self,
        key: &ConversationKey,
        generation: u64,
        request: u64,
        result: Result<Vec<WireMessage>, String>,
        received_at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        if let Some(error) = self.stale(key, generation) {
            return Err(error);
        }
        if request < self.history_request {
            tracing::debug!(
                "History request {} superseded by {} for {}",
                request,
                self.history_request,
                key
            );
            return Err(SyncError::StaleCompletion(key.to_string()));
        }
        let batch = match result {
            Ok(batch) => batch,
            Err(reason) => {
                let error = SyncError::HistoryFetchFailed(reason);
                tracing::warn!("{} ({})", error, key);
                return Err(error);
            }
        };

        let mut messages = Vec::with_capacity(batch.len());
        for item in batch {
            let incoming = match wire::decode(item, received_at) {
                Decoded::Message(incoming) => incoming,
                Decoded::Malformed(reason) => {
                    tracing::debug!("Skipping history item: {}", reason);
                    continue;
                }
            };
            if !key.pair().contains(&incoming.sender.id) {
                tracing::debug!("Skipping history item from outsider {}", incoming.sender.id);
                continue;
            }
            if incoming.scope_token.is_some() && incoming.scope_token.as_deref() != key.scope() {
                tracing::debug!("Skipping history item from another scope");
                continue;
            }
            let mut message = incoming.into_message(key.clone());
            message.scope_token = key.scope().map(String::from);
            messages.push(message);
        }

        tracing::debug!("Loaded {} history messages for {}", messages.len(), key);
        if let Some(conversation) = self.active.as_mut() {
            conversation.apply_history(messages);
        }
        self.history_request = request;
        Ok(())
    }

    /// Fallback send completed.
    pub fn on_send_result(
        &mut self,
        key: &ConversationKey,
        generation: u64,
        placeholder: &MessageId,
        result: Result<WireMessage, String>,
        received_at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        if let Some(error) = self.stale(key, generation) {
            return Err(error);
        }
        let wire = match result {
            Ok(wire) => wire,
            Err(reason) => {
                self.reject(placeholder, reason);
                return Ok(());
            }
        };
        match wire::decode(wire, received_at) {
            Decoded::Message(incoming) => {
                let mut message = incoming.into_message(key.clone());
                if message.scope_token.is_none() {
                    message.scope_token = key.scope().map(String::from);
                }
                if let Some(conversation) = self.active.as_mut() {
                    conversation.confirm(placeholder, message);
                }
            }
            Decoded::Malformed(reason) => {
                // Accepted, but the echo is unusable. Wait for the push.
                tracing::debug!("Unusable send response for {}: {}", placeholder, reason);
            }
        }
        Ok(())
    }

    /// The session could not write an emit. Retry it through the fallback.
    pub fn on_undelivered(&mut self, client_id: Option<&str>) {
        let placeholder = match client_id.and_then(MessageId::parse_placeholder) {
            Some(placeholder) => placeholder,
            None => return,
        };
        let conversation = match self.active.as_ref() {
            Some(conversation) => conversation,
            None => return,
        };
        if let Some(message) = conversation.pending(&placeholder) {
            tracing::debug!("Emit of {} undelivered, using fallback", placeholder);
            self.effects.push(Effect::SendFallback {
                key: conversation.key().clone(),
                generation: self.generation,
                placeholder: placeholder.clone(),
                outgoing: OutgoingMessage::from_pending(message),
            });
        }
    }

    /// Fail pending sends whose confirmation window has passed.
    pub fn expire(&mut self, now: Instant) {
        let failures = match self.active.as_mut() {
            Some(conversation) => conversation.expire(now),
            None => return,
        };
        for failure in failures {
            self.record_failure(failure);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.active.as_ref().and_then(|c| c.next_deadline())
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn take_failures(&mut self) -> Vec<SendFailure> {
        std::mem::take(&mut self.failures)
    }

    /// Rendered sequence of the active conversation.
    pub fn messages(&self) -> &[Message] {
        match &self.active {
            Some(conversation) => conversation.messages(),
            None => &[],
        }
    }

    pub fn active_key(&self) -> Option<&ConversationKey> {
        self.active.as_ref().map(|c| c.key())
    }

    pub fn presence(&self) -> Presence {
        self.presence.current()
    }

    pub fn unread_counts(&self) -> Vec<(ConversationKey, u32)> {
        self.resolver.unread_counts()
    }

    /// Whether a completion issued under `generation` for `key` may still apply.
    pub fn is_current(&self, key: &ConversationKey, generation: u64) -> bool {
        generation == self.generation && self.active_key() == Some(key)
    }
}

fn decode_event(payload: &Value, received_at: DateTime<Utc>) -> Option<IncomingMessage> {
    match wire::decode_value(payload, received_at) {
        Decoded::Message(incoming) => Some(incoming),
        Decoded::Malformed(reason) => {
            tracing::debug!("{}", SyncError::MalformedEvent(reason));
            None
        }
    }
}
