//! Chat workflow: sending user messages, loading history, session labels, and tab restore.
//!
//! Every request failure is caught here. Only in-flight state (the streaming buffer and
//! session status) is reverted; optimistic messages stay.

use base64::Engine;
use serde_json::Value;

use crate::cache::TabCache;
use crate::files::{extract_file_touches, FileTouch};
use crate::gateway::{
    ChatAttachment, ChatSendParams, ClientError, GatewayRequester, HistoryParams,
    METHOD_CHAT_HISTORY, METHOD_CHAT_SEND, METHOD_SESSIONS_HISTORY,
};
use crate::message::{normalize_message, ContentBlock, Message};
use crate::session::{SessionPatch, SessionStatus, Store};

/// Longest label derived from a first message, in characters.
const LABEL_MAX_CHARS: usize = 40;
/// A truncated label is cut at a space only if one exists past this position.
const LABEL_MIN_CUT: usize = 20;

/// Conversational openers dropped from the start of a derived label. Longest first.
const FILLERS: &[&str] = &[
    "i need you to",
    "i want you to",
    "can you",
    "could you",
    "would you",
    "will you",
    "please",
    "hello",
    "okay",
    "hey",
    "hi",
    "ok",
    "so",
];

/// An image to send with a message: MIME type plus raw base64 payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub media_type: String,
    pub data: String,
}

impl ImageAttachment {
    /// Parse a `data:<mime>;base64,<payload>` URL.
    pub fn from_data_url(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("data:")?;
        let (media_type, data) = rest.split_once(";base64,")?;
        if media_type.is_empty() || data.is_empty() {
            return None;
        }
        Some(Self {
            media_type: media_type.to_string(),
            data: data.to_string(),
        })
    }

    pub fn from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    fn content_block(&self) -> ContentBlock {
        ContentBlock::image(self.media_type.clone(), self.data.clone())
    }

    fn wire_attachment(&self) -> ChatAttachment {
        ChatAttachment {
            typ: "image".to_string(),
            media_type: self.media_type.clone(),
            data: self.data.clone(),
        }
    }
}

/// Result of [`ChatWorkflow::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing to send (blank text and no images); the store was not touched.
    Empty,
    /// The gateway accepted the message.
    Sent { idempotency_key: String },
    /// The request failed; streaming state was reverted, the user message kept.
    Failed(ClientError),
}

fn is_filler_boundary(rest: &str) -> bool {
    rest.chars()
        .next()
        .map_or(true, |c| !c.is_alphanumeric())
}

fn strip_filler(text: &str) -> Option<&str> {
    FILLERS.iter().find_map(|filler| {
        let head = text.get(..filler.len())?;
        if !head.eq_ignore_ascii_case(filler) || !is_filler_boundary(&text[filler.len()..]) {
            return None;
        }
        Some(
            text[filler.len()..]
                .trim_start_matches(|c: char| c == ',' || c == '!' || c == '.' || c.is_whitespace()),
        )
    })
}

/// Derive a session label from the first message text: strip leading filler, bound
/// the length (preferring a word boundary), and capitalize. `None` if nothing is left.
pub fn derive_label(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut rest = collapsed.as_str();
    while let Some(stripped) = strip_filler(rest) {
        rest = stripped;
    }

    let mut label: String = if rest.chars().count() > LABEL_MAX_CHARS {
        let cut: String = rest.chars().take(LABEL_MAX_CHARS).collect();
        match cut.rfind(' ') {
            Some(i) if cut[..i].chars().count() > LABEL_MIN_CUT => cut[..i].to_string(),
            _ => cut,
        }
    } else {
        rest.to_string()
    };
    label = label.trim_end().to_string();

    let mut chars = label.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}

/// Messages array of a history result: `{ messages: [...] }` or a bare array.
fn history_entries(result: &Value) -> &[Value] {
    match result {
        Value::Array(items) => items.as_slice(),
        other => other
            .get("messages")
            .and_then(|v| v.as_array())
            .map(Vec::as_slice)
            .unwrap_or(&[]),
    }
}

/// Drives user-initiated chat operations against the gateway and the store.
pub struct ChatWorkflow<R> {
    requester: R,
    store: Store,
    history_limit: u32,
}

impl<R: GatewayRequester> ChatWorkflow<R> {
    pub fn new(requester: R, store: Store, history_limit: u32) -> Self {
        Self {
            requester,
            store,
            history_limit,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn requester(&self) -> &R {
        &self.requester
    }

    async fn canonical_key(&self, key_or_id: &str) -> String {
        self.store
            .session(key_or_id)
            .await
            .map(|s| s.key)
            .unwrap_or_else(|| key_or_id.to_string())
    }

    /// Send a user message: append it optimistically, label the session on its first
    /// message, open the streaming buffer, then issue `chat.send`.
    pub async fn send_message(
        &self,
        session_key: &str,
        text: &str,
        images: &[ImageAttachment],
    ) -> SendOutcome {
        let mut content: Vec<ContentBlock> = images.iter().map(ImageAttachment::content_block).collect();
        if !text.trim().is_empty() {
            content.push(ContentBlock::text(text));
        }
        if content.is_empty() {
            return SendOutcome::Empty;
        }

        let key = self.canonical_key(session_key).await;
        let first_message = self.store.messages(&key).await.is_empty();
        self.store.add_message(&key, Message::user(content)).await;

        let mut patch = SessionPatch::touched(SessionStatus::Active);
        if first_message {
            let placeholder = self
                .store
                .session(&key)
                .await
                .map(|s| s.has_placeholder_label())
                .unwrap_or(false);
            if placeholder {
                patch.label = derive_label(text);
            }
        }
        self.store.update_session(&key, &patch).await;
        self.store.start_streaming(&key).await;

        let idempotency_key = uuid::Uuid::new_v4().to_string();
        let params = ChatSendParams {
            session_key: key.clone(),
            message: text.to_string(),
            idempotency_key: idempotency_key.clone(),
            attachments: if images.is_empty() {
                None
            } else {
                Some(images.iter().map(ImageAttachment::wire_attachment).collect())
            },
        };
        let result = match serde_json::to_value(params) {
            Ok(params) => self.requester.request(METHOD_CHAT_SEND, params).await,
            Err(e) => Err(ClientError::MalformedFrame(e.to_string())),
        };
        match result {
            Ok(_) => SendOutcome::Sent { idempotency_key },
            Err(e) => {
                log::warn!("chat.send for {} failed: {}", key, e);
                self.store.clear_streaming(&key).await;
                self.store
                    .update_session(&key, &SessionPatch::status(SessionStatus::Idle))
                    .await;
                SendOutcome::Failed(e)
            }
        }
    }

    async fn request_history(&self, key: &str) -> Result<Value, ClientError> {
        let params = HistoryParams {
            session_key: key.to_string(),
            limit: self.history_limit,
            include_tools: Some(true),
        };
        let params =
            serde_json::to_value(params).map_err(|e| ClientError::MalformedFrame(e.to_string()))?;
        match self.requester.request(METHOD_CHAT_HISTORY, params.clone()).await {
            Err(ClientError::Gateway { code, message }) => {
                log::debug!(
                    "chat.history rejected ({}: {}), trying sessions.history",
                    code,
                    message
                );
                self.requester.request(METHOD_SESSIONS_HISTORY, params).await
            }
            other => other,
        }
    }

    /// Load a page of history into the store, replacing the session's messages, and
    /// record the file touches it contains. Failures are logged and yield `None`.
    pub async fn load_history(&self, session_key: &str) -> Option<usize> {
        let key = self.canonical_key(session_key).await;
        let result = match self.request_history(&key).await {
            Ok(result) => result,
            Err(e) => {
                log::debug!("no history for {}: {}", key, e);
                return None;
            }
        };
        let messages: Vec<Message> = history_entries(&result)
            .iter()
            .map(normalize_message)
            .collect();
        let touches: Vec<FileTouch> = messages.iter().flat_map(extract_file_touches).collect();
        let count = messages.len();
        self.store.set_messages(&key, messages).await;
        self.store.record_file_touches(&key, touches).await;
        Some(count)
    }

    /// Reopen cached tabs and selection, then load history for every restored tab
    /// that has no messages yet. Returns the number of tabs restored.
    pub async fn restore(&self, cache: &TabCache) -> usize {
        for key in &cache.active_sessions {
            self.store.open_session(key).await;
        }
        if let Some(ref current) = cache.current_session_id {
            self.store.set_current_session(Some(current)).await;
        } else if !cache.active_sessions.is_empty() {
            self.store.set_current_session(None).await;
        }
        self.load_missing_history().await;
        cache.active_sessions.len()
    }

    /// Load history for every open tab that has no messages yet, e.g. tabs restored
    /// while the gateway was unreachable. Returns how many loads succeeded.
    pub async fn load_missing_history(&self) -> usize {
        let mut loaded = 0;
        for key in self.store.active_sessions().await {
            if self.store.messages(&key).await.is_empty() && self.load_history(&key).await.is_some() {
                loaded += 1;
            }
        }
        loaded
    }
}
