//! Event router: classify push frames and apply them to the store.
//!
//! Two vocabularies are accepted. The legacy one uses discrete event names
//! (`chat.message`, `chat.delta`, `chat.complete`, `session.updated`) keyed by
//! `sessionId`; the current one is a single `chat` event with a `state`
//! discriminator keyed by `sessionKey`. Both are normalized into one
//! [`SessionEvent`] before the store is touched.

use serde::Deserialize;
use serde_json::{json, Value};

use super::protocol::WsEvent;
use crate::files::extract_file_touches;
use crate::message::{normalize_message, text_fragments, Message, Role};
use crate::session::{SessionPatch, SessionStatus, Store};

/// A push event as it arrived, in either vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Legacy(LegacyEvent),
    Chat(ChatEvent),
}

/// Discrete legacy events. Tag and payload come from the frame's `event` and `payload`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum LegacyEvent {
    #[serde(rename = "chat.message")]
    Message {
        #[serde(rename = "sessionId", alias = "sessionKey")]
        session_id: String,
        message: Value,
    },
    #[serde(rename = "chat.delta")]
    Delta {
        #[serde(rename = "sessionId", alias = "sessionKey")]
        session_id: String,
        delta: String,
    },
    #[serde(rename = "chat.complete")]
    Complete {
        #[serde(rename = "sessionId", alias = "sessionKey")]
        session_id: String,
    },
    #[serde(rename = "session.updated")]
    SessionUpdated { session: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    Delta,
    Final,
    Aborted,
    Error,
}

/// Payload of the unified `chat` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub session_key: String,
    pub state: ChatState,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
}

/// What an event does to one session, independent of vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// A complete message to append (streaming is left alone).
    Append(Message),
    /// A token fragment for the streaming buffer.
    Delta(String),
    /// The stream finished, optionally with the finished message.
    Final(Option<Message>),
    /// The stream ended without a message (completed, aborted or failed).
    Ended { error: Option<String> },
    /// Metadata update for the session record.
    Updated(SessionPatch),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub session_key: String,
    pub kind: EventKind,
}

impl InboundEvent {
    /// Classify a push frame. Unknown event names, unknown `chat` states and payloads
    /// missing required fields yield `None` (logged at debug).
    pub fn from_frame(ev: &WsEvent) -> Option<Self> {
        let parsed = match ev.event.as_str() {
            "chat" => serde_json::from_value::<ChatEvent>(ev.payload.clone()).map(InboundEvent::Chat),
            "chat.message" | "chat.delta" | "chat.complete" | "session.updated" => {
                serde_json::from_value::<LegacyEvent>(json!({
                    "event": ev.event,
                    "payload": ev.payload,
                }))
                .map(InboundEvent::Legacy)
            }
            other => {
                log::debug!("ignoring unhandled event {}", other);
                return None;
            }
        };
        match parsed {
            Ok(event) => Some(event),
            Err(e) => {
                log::debug!("ignoring {} event: {}", ev.event, e);
                None
            }
        }
    }

    /// Convert into the vocabulary-independent shape.
    pub fn normalize(self) -> Option<SessionEvent> {
        let (session_key, kind) = match self {
            InboundEvent::Legacy(LegacyEvent::Message {
                session_id,
                message,
            }) => (session_id, EventKind::Append(normalize_message(&message))),
            InboundEvent::Legacy(LegacyEvent::Delta { session_id, delta }) => {
                (session_id, EventKind::Delta(delta))
            }
            InboundEvent::Legacy(LegacyEvent::Complete { session_id }) => {
                (session_id, EventKind::Ended { error: None })
            }
            InboundEvent::Legacy(LegacyEvent::SessionUpdated { session }) => {
                let key = ["id", "key", "sessionKey"]
                    .iter()
                    .find_map(|f| session.get(*f).and_then(|v| v.as_str()))
                    .unwrap_or_default()
                    .to_string();
                (key, EventKind::Updated(SessionPatch::from_value(&session)))
            }
            InboundEvent::Chat(chat) => {
                let kind = match chat.state {
                    ChatState::Delta => EventKind::Delta(
                        chat.message.as_ref().map(text_fragments).unwrap_or_default(),
                    ),
                    ChatState::Final => {
                        EventKind::Final(chat.message.as_ref().map(normalize_message))
                    }
                    ChatState::Aborted | ChatState::Error => EventKind::Ended {
                        error: chat.error_message,
                    },
                };
                (chat.session_key, kind)
            }
        };
        if session_key.is_empty() {
            log::debug!("ignoring event without a session key");
            return None;
        }
        Some(SessionEvent { session_key, kind })
    }
}

/// Applies push events to the store. Processing is serialized by the connection's
/// receive loop, so events for a session are applied in arrival order.
#[derive(Clone)]
pub struct EventRouter {
    store: Store,
}

impl EventRouter {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Classify, normalize and apply one push frame. Never fails.
    pub async fn dispatch(&self, ev: WsEvent) {
        let Some(event) = InboundEvent::from_frame(&ev).and_then(InboundEvent::normalize) else {
            return;
        };
        self.apply(event).await;
    }

    pub async fn apply(&self, event: SessionEvent) {
        let key = event.session_key.as_str();
        match event.kind {
            EventKind::Append(message) => {
                self.append(key, message).await;
            }
            EventKind::Delta(fragment) => {
                if !fragment.is_empty() {
                    self.store.append_streaming(key, &fragment).await;
                }
                self.store
                    .update_session(key, &SessionPatch::status(SessionStatus::Streaming))
                    .await;
            }
            EventKind::Final(message) => {
                if let Some(message) = message {
                    // A final user turn (usually the echo of a local send) does not
                    // end the assistant's pending reply.
                    let user_turn = message.role == Role::User;
                    self.append(key, message).await;
                    if user_turn {
                        return;
                    }
                }
                self.store.clear_streaming(key).await;
                self.store
                    .update_session(key, &SessionPatch::status(SessionStatus::Idle))
                    .await;
            }
            EventKind::Ended { error } => {
                self.store.clear_streaming(key).await;
                self.store
                    .update_session(key, &SessionPatch::status(SessionStatus::Idle))
                    .await;
                if let Some(error) = error {
                    log::info!("stream for {} ended with error: {}", key, error);
                    self.store.set_stream_error(key, error).await;
                }
            }
            EventKind::Updated(patch) => {
                if !self.store.update_session(key, &patch).await {
                    log::debug!("session.updated for unknown session {}", key);
                }
            }
        }
    }

    async fn append(&self, key: &str, message: Message) {
        let touches = extract_file_touches(&message);
        if self.store.reconcile_message(key, message).await {
            self.store.record_file_touches(key, touches).await;
        }
    }
}
