//! Sessions and the local store: session records, per-session message lists,
//! per-session streaming buffers, recent files, and the open-tab selection.
//!
//! Every mutation, whether from a local user action or a gateway event, goes through
//! [`Store`]. Readers take committed snapshots and can subscribe to change
//! notifications to know when to re-render.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::files::FileTouch;
use crate::message::{parse_timestamp, Message, Role};

/// Prefix of the placeholder label given to locally created sessions.
pub const PLACEHOLDER_LABEL_PREFIX: &str = "Session ";

/// How far back (in messages) a gateway echo of a local user message is looked for.
const ECHO_WINDOW_MESSAGES: usize = 10;
/// Maximum timestamp distance between a local user message and its gateway echo.
const ECHO_WINDOW_SECS: i64 = 120;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    #[default]
    Idle,
    Streaming,
}

/// One conversation thread. `key` is the identity; `id` is an alias for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub key: String,
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_active: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub status: SessionStatus,
}

impl Session {
    /// True when `key_or_id` names this session by either identifier.
    pub fn matches(&self, key_or_id: &str) -> bool {
        self.key == key_or_id || self.id == key_or_id
    }

    fn same_entity(&self, other: &Session) -> bool {
        self.key == other.key || self.id == other.id
    }

    /// Label shown to the user; falls back to a short form of the key.
    pub fn display_label(&self) -> String {
        match self.label.as_deref().map(str::trim) {
            Some(l) if !l.is_empty() => l.to_string(),
            _ => format!(
                "{}{}",
                PLACEHOLDER_LABEL_PREFIX,
                self.key.chars().take(8).collect::<String>()
            ),
        }
    }

    /// Whether the label is still the auto-generated placeholder (or missing).
    pub fn has_placeholder_label(&self) -> bool {
        match self.label.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(l) => l.starts_with(PLACEHOLDER_LABEL_PREFIX),
        }
    }
}

fn non_empty(label: &Option<String>) -> bool {
    label.as_deref().map(|l| !l.trim().is_empty()).unwrap_or(false)
}

/// Partial update to a session record. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub label: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub message_count: Option<u64>,
    pub status: Option<SessionStatus>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Status change plus a `lastActive` refresh.
    pub fn touched(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            last_active: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Build a patch from a gateway session record (as pushed by `session.updated`).
    pub fn from_value(raw: &Value) -> Self {
        let status = raw
            .get("status")
            .and_then(|v| serde_json::from_value::<SessionStatus>(v.clone()).ok());
        Self {
            label: first_str(raw, &["label", "displayName"]).map(str::to_string),
            created: first_timestamp(raw, &["created", "createdAt"]),
            last_active: first_timestamp(raw, &["lastActive", "updatedAt"]),
            message_count: raw.get("messageCount").and_then(|v| v.as_u64()),
            status,
        }
    }

    fn apply(&self, session: &mut Session) {
        if let Some(ref label) = self.label {
            session.label = Some(label.clone());
        }
        if let Some(created) = self.created {
            session.created = Some(created);
        }
        if let Some(last_active) = self.last_active {
            session.last_active = Some(last_active);
        }
        if let Some(count) = self.message_count {
            session.message_count = count;
        }
        if let Some(status) = self.status {
            session.status = status;
        }
    }
}

fn first_str<'a>(raw: &'a Value, fields: &[&str]) -> Option<&'a str> {
    fields
        .iter()
        .find_map(|f| raw.get(*f).and_then(|v| v.as_str()))
        .filter(|s| !s.is_empty())
}

fn first_timestamp(raw: &Value, fields: &[&str]) -> Option<DateTime<Utc>> {
    fields
        .iter()
        .find_map(|f| raw.get(*f).and_then(parse_timestamp))
}

/// Normalize one `sessions.list` entry. `key` and `id` default to each other; entries
/// with neither are dropped. Listed sessions always start out idle.
pub fn normalize_session(raw: &Value) -> Option<Session> {
    let key = first_str(raw, &["key", "sessionKey", "id"])?.to_string();
    let id = first_str(raw, &["id"]).unwrap_or(&key).to_string();
    Some(Session {
        key,
        id,
        label: first_str(raw, &["label", "displayName"]).map(str::to_string),
        created: first_timestamp(raw, &["created", "createdAt"]),
        last_active: first_timestamp(raw, &["lastActive", "updatedAt"]),
        message_count: raw
            .get("messageCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        status: SessionStatus::Idle,
    })
}

/// Normalize a `sessions.list` result: either an array or `{ sessions: [...] }`.
pub fn normalize_session_list(result: &Value) -> Vec<Session> {
    let entries = match result {
        Value::Array(items) => items.as_slice(),
        other => match other.get("sessions").and_then(|v| v.as_array()) {
            Some(items) => items.as_slice(),
            None => &[],
        },
    };
    entries.iter().filter_map(normalize_session).collect()
}

/// What part of the store changed (sent to subscribers after each commit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Connection,
    Sessions,
    Tabs,
    Messages(String),
    Streaming(String),
    Files(String),
}

/// The committed store contents. Cloned out as a snapshot for readers.
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    pub connected: bool,
    pub connection_error: Option<String>,
    pub sessions: Vec<Session>,
    /// Open tabs, in the order they were opened.
    pub active_sessions: Vec<String>,
    /// Focused tab; always a member of `active_sessions` when set.
    pub current_session_id: Option<String>,
    pub messages: HashMap<String, Vec<Message>>,
    /// Most-recent-first, one entry per path.
    pub recent_files: HashMap<String, Vec<FileTouch>>,
    /// In-progress assistant reply per session.
    pub streaming: HashMap<String, String>,
    /// Last stream failure message per session, for display only.
    pub stream_errors: HashMap<String, String>,
}

impl StoreState {
    /// Map a key or id alias to the session's key. Unknown names map to themselves.
    pub fn resolve_key(&self, key_or_id: &str) -> String {
        self.sessions
            .iter()
            .find(|s| s.matches(key_or_id))
            .map(|s| s.key.clone())
            .unwrap_or_else(|| key_or_id.to_string())
    }

    pub fn session(&self, key_or_id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.matches(key_or_id))
    }

    pub fn messages(&self, key_or_id: &str) -> &[Message] {
        self.messages
            .get(&self.resolve_key(key_or_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn set_sessions(&mut self, sessions: Vec<Session>) {
        self.sessions = sessions;
    }

    /// Merge gateway sessions into the local list without dropping local-only sessions.
    /// Matching records (by id or key) take the gateway's fields, except that a
    /// non-empty local label is kept and the local status is preserved.
    pub fn merge_sessions(&mut self, incoming: Vec<Session>) {
        let mut to_add: Vec<Session> = Vec::new();
        for remote in incoming {
            if let Some(local) = self.sessions.iter_mut().find(|s| s.same_entity(&remote)) {
                if !non_empty(&local.label) {
                    local.label = remote.label.clone();
                }
                if remote.created.is_some() {
                    local.created = remote.created;
                }
                if remote.last_active.is_some() {
                    local.last_active = remote.last_active;
                }
                local.message_count = remote.message_count;
                continue;
            }
            if !to_add.iter().any(|s| s.same_entity(&remote)) {
                to_add.push(remote);
            }
        }
        self.sessions.extend(to_add);
    }

    /// Add a session, or refresh the existing record with the same key/id.
    pub fn add_session(&mut self, session: Session) {
        match self.sessions.iter_mut().find(|s| s.same_entity(&session)) {
            Some(existing) => {
                let label = if non_empty(&session.label) {
                    session.label.clone()
                } else {
                    existing.label.clone()
                };
                *existing = Session { label, ..session };
            }
            None => self.sessions.push(session),
        }
    }

    pub fn update_session(&mut self, key_or_id: &str, patch: &SessionPatch) -> bool {
        match self.sessions.iter_mut().find(|s| s.matches(key_or_id)) {
            Some(session) => {
                patch.apply(session);
                true
            }
            None => false,
        }
    }

    /// Remove the session record and every tab/selection pointer to it.
    pub fn delete_session(&mut self, key_or_id: &str) {
        let key = self.resolve_key(key_or_id);
        let aliases: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.matches(key_or_id))
            .flat_map(|s| [s.key.clone(), s.id.clone()])
            .chain([key.clone(), key_or_id.to_string()])
            .collect();
        self.sessions.retain(|s| !s.matches(key_or_id));
        self.active_sessions.retain(|k| !aliases.contains(k));
        if let Some(ref current) = self.current_session_id {
            if aliases.contains(current) {
                self.current_session_id = self.active_sessions.first().cloned();
            }
        }
        self.messages.remove(&key);
        self.recent_files.remove(&key);
        self.streaming.remove(&key);
        self.stream_errors.remove(&key);
    }

    /// Open a tab (no duplicates) and focus it.
    pub fn open_session(&mut self, key_or_id: &str) {
        let key = self.resolve_key(key_or_id);
        if !self.active_sessions.contains(&key) {
            self.active_sessions.push(key.clone());
        }
        self.current_session_id = Some(key);
    }

    /// Close a tab. Closing the focused tab focuses the first remaining one, or nothing.
    pub fn close_session(&mut self, key_or_id: &str) {
        let key = self.resolve_key(key_or_id);
        self.active_sessions.retain(|k| k != &key);
        if self.current_session_id.as_deref() == Some(key.as_str()) {
            self.current_session_id = self.active_sessions.first().cloned();
        }
    }

    /// Focus a tab, opening it first when it is not open yet.
    pub fn set_current_session(&mut self, key_or_id: Option<&str>) {
        match key_or_id {
            Some(k) => self.open_session(k),
            None => self.current_session_id = None,
        }
    }

    /// Replace a session's message list (history load).
    pub fn set_messages(&mut self, key_or_id: &str, messages: Vec<Message>) {
        let key = self.resolve_key(key_or_id);
        let count = messages.len() as u64;
        if let Some(session) = self.sessions.iter_mut().find(|s| s.key == key) {
            session.message_count = session.message_count.max(count);
        }
        self.messages.insert(key, messages);
    }

    /// Append a message. A message whose id is already stored is ignored.
    /// Bumps the session's message count and `lastActive`.
    pub fn add_message(&mut self, key_or_id: &str, message: Message) -> bool {
        let key = self.resolve_key(key_or_id);
        let list = self.messages.entry(key.clone()).or_default();
        if list.iter().any(|m| m.id == message.id) {
            return false;
        }
        list.push(message);
        if let Some(session) = self.sessions.iter_mut().find(|s| s.key == key) {
            session.message_count += 1;
            session.last_active = Some(Utc::now());
        }
        true
    }

    /// Append a message that came from the gateway. Besides id duplicates, a user
    /// message that echoes a recent identical local user message is suppressed.
    pub fn reconcile_message(&mut self, key_or_id: &str, message: Message) -> bool {
        if message.role == Role::User {
            let echoed = self
                .messages(key_or_id)
                .iter()
                .rev()
                .take(ECHO_WINDOW_MESSAGES)
                .any(|m| {
                    m.role == Role::User
                        && m.content == message.content
                        && (m.timestamp - message.timestamp).num_seconds().abs()
                            <= ECHO_WINDOW_SECS
                });
            if echoed {
                log::debug!("suppressing gateway echo of local user message {}", message.id);
                return false;
            }
        }
        self.add_message(key_or_id, message)
    }

    /// Record a file touch: any older entry for the same path is evicted and the new
    /// one goes to the front.
    pub fn add_file_touch(&mut self, key_or_id: &str, touch: FileTouch) {
        let key = self.resolve_key(key_or_id);
        let files = self.recent_files.entry(key).or_default();
        files.retain(|f| f.path != touch.path);
        files.insert(0, touch);
    }

    /// Open (or reset) the streaming buffer for a session.
    pub fn start_streaming(&mut self, key_or_id: &str) {
        let key = self.resolve_key(key_or_id);
        self.stream_errors.remove(&key);
        self.streaming.insert(key, String::new());
    }

    pub fn append_streaming(&mut self, key_or_id: &str, fragment: &str) {
        let key = self.resolve_key(key_or_id);
        self.streaming.entry(key).or_default().push_str(fragment);
    }

    pub fn clear_streaming(&mut self, key_or_id: &str) {
        let key = self.resolve_key(key_or_id);
        self.streaming.remove(&key);
    }
}

/// Shared handle to the store. Cheap to clone; all clones see the same state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<StoreState>>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RwLock::new(StoreState::default())),
            changes,
        }
    }

    /// Receive a notification after every committed mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: StoreChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    /// Run `f` against the state under the write lock, then announce `change`.
    async fn mutate<R>(&self, change: StoreChange, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let out = {
            let mut g = self.inner.write().await;
            f(&mut g)
        };
        self.notify(change);
        out
    }

    async fn resolve(&self, key_or_id: &str) -> String {
        self.inner.read().await.resolve_key(key_or_id)
    }

    /// Clone of the committed state.
    pub async fn snapshot(&self) -> StoreState {
        self.inner.read().await.clone()
    }

    pub async fn connection(&self) -> (bool, Option<String>) {
        let g = self.inner.read().await;
        (g.connected, g.connection_error.clone())
    }

    pub async fn set_connected(&self, connected: bool) {
        self.mutate(StoreChange::Connection, |s| s.connected = connected)
            .await
    }

    pub async fn set_connection_error(&self, error: Option<String>) {
        self.mutate(StoreChange::Connection, |s| s.connection_error = error)
            .await
    }

    pub async fn session(&self, key_or_id: &str) -> Option<Session> {
        self.inner.read().await.session(key_or_id).cloned()
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.inner.read().await.sessions.clone()
    }

    pub async fn set_sessions(&self, sessions: Vec<Session>) {
        self.mutate(StoreChange::Sessions, |s| s.set_sessions(sessions))
            .await
    }

    pub async fn merge_sessions(&self, sessions: Vec<Session>) {
        self.mutate(StoreChange::Sessions, |s| s.merge_sessions(sessions))
            .await
    }

    pub async fn add_session(&self, session: Session) {
        self.mutate(StoreChange::Sessions, |s| s.add_session(session))
            .await
    }

    pub async fn update_session(&self, key_or_id: &str, patch: &SessionPatch) -> bool {
        self.mutate(StoreChange::Sessions, |s| s.update_session(key_or_id, patch))
            .await
    }

    pub async fn delete_session(&self, key_or_id: &str) {
        self.mutate(StoreChange::Tabs, |s| s.delete_session(key_or_id))
            .await;
        self.notify(StoreChange::Sessions);
    }

    /// Create a pending local session (no gateway record until its first message),
    /// open it as the current tab, and return its key.
    pub async fn create_local_session(&self) -> String {
        let key = format!("conductor-{}", uuid::Uuid::new_v4());
        let now = Utc::now();
        let session = Session {
            key: key.clone(),
            id: key.clone(),
            label: Some(format!(
                "{}{}",
                PLACEHOLDER_LABEL_PREFIX,
                chrono::Local::now().format("%H:%M:%S")
            )),
            created: Some(now),
            last_active: Some(now),
            message_count: 0,
            status: SessionStatus::Idle,
        };
        self.mutate(StoreChange::Sessions, |s| {
            s.add_session(session);
            s.open_session(&key);
        })
        .await;
        self.notify(StoreChange::Tabs);
        key
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        self.inner.read().await.active_sessions.clone()
    }

    pub async fn current_session_id(&self) -> Option<String> {
        self.inner.read().await.current_session_id.clone()
    }

    pub async fn open_session(&self, key_or_id: &str) {
        self.mutate(StoreChange::Tabs, |s| s.open_session(key_or_id))
            .await
    }

    pub async fn close_session(&self, key_or_id: &str) {
        self.mutate(StoreChange::Tabs, |s| s.close_session(key_or_id))
            .await
    }

    pub async fn set_current_session(&self, key_or_id: Option<&str>) {
        self.mutate(StoreChange::Tabs, |s| s.set_current_session(key_or_id))
            .await
    }

    pub async fn messages(&self, key_or_id: &str) -> Vec<Message> {
        self.inner.read().await.messages(key_or_id).to_vec()
    }

    pub async fn set_messages(&self, key_or_id: &str, messages: Vec<Message>) {
        let key = self.resolve(key_or_id).await;
        self.mutate(StoreChange::Messages(key.clone()), |s| {
            s.set_messages(&key, messages)
        })
        .await
    }

    pub async fn add_message(&self, key_or_id: &str, message: Message) -> bool {
        let key = self.resolve(key_or_id).await;
        self.mutate(StoreChange::Messages(key.clone()), |s| {
            s.add_message(&key, message)
        })
        .await
    }

    pub async fn reconcile_message(&self, key_or_id: &str, message: Message) -> bool {
        let key = self.resolve(key_or_id).await;
        self.mutate(StoreChange::Messages(key.clone()), |s| {
            s.reconcile_message(&key, message)
        })
        .await
    }

    pub async fn recent_files(&self, key_or_id: &str) -> Vec<FileTouch> {
        let g = self.inner.read().await;
        g.recent_files
            .get(&g.resolve_key(key_or_id))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn add_file_touch(&self, key_or_id: &str, touch: FileTouch) {
        let key = self.resolve(key_or_id).await;
        self.mutate(StoreChange::Files(key.clone()), |s| {
            s.add_file_touch(&key, touch)
        })
        .await
    }

    /// Record several touches in order (the last one ends up most recent).
    pub async fn record_file_touches(&self, key_or_id: &str, touches: Vec<FileTouch>) {
        if touches.is_empty() {
            return;
        }
        let key = self.resolve(key_or_id).await;
        self.mutate(StoreChange::Files(key.clone()), |s| {
            for touch in touches {
                s.add_file_touch(&key, touch);
            }
        })
        .await
    }

    pub async fn streaming_content(&self, key_or_id: &str) -> Option<String> {
        let g = self.inner.read().await;
        g.streaming.get(&g.resolve_key(key_or_id)).cloned()
    }

    pub async fn start_streaming(&self, key_or_id: &str) {
        let key = self.resolve(key_or_id).await;
        self.mutate(StoreChange::Streaming(key.clone()), |s| {
            s.start_streaming(&key)
        })
        .await
    }

    pub async fn append_streaming(&self, key_or_id: &str, fragment: &str) {
        let key = self.resolve(key_or_id).await;
        self.mutate(StoreChange::Streaming(key.clone()), |s| {
            s.append_streaming(&key, fragment)
        })
        .await
    }

    pub async fn clear_streaming(&self, key_or_id: &str) {
        let key = self.resolve(key_or_id).await;
        self.mutate(StoreChange::Streaming(key.clone()), |s| {
            s.clear_streaming(&key)
        })
        .await
    }

    /// Drop every streaming buffer (a fresh connection never inherits one).
    pub async fn clear_all_streaming(&self) {
        let keys: Vec<String> = {
            let mut g = self.inner.write().await;
            g.streaming.drain().map(|(k, _)| k).collect()
        };
        for key in keys {
            self.notify(StoreChange::Streaming(key));
        }
    }

    pub async fn stream_error(&self, key_or_id: &str) -> Option<String> {
        let g = self.inner.read().await;
        g.stream_errors.get(&g.resolve_key(key_or_id)).cloned()
    }

    pub async fn set_stream_error(&self, key_or_id: &str, error: String) {
        let key = self.resolve(key_or_id).await;
        self.mutate(StoreChange::Streaming(key.clone()), |s| {
            s.stream_errors.insert(key.clone(), error);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::FileAction;
    use crate::message::ContentBlock;
    use serde_json::json;

    fn session(key: &str, label: Option<&str>) -> Session {
        Session {
            key: key.to_string(),
            id: key.to_string(),
            label: label.map(str::to_string),
            created: None,
            last_active: None,
            message_count: 0,
            status: SessionStatus::Idle,
        }
    }

    fn touch(path: &str, action: FileAction) -> FileTouch {
        FileTouch {
            path: path.to_string(),
            action,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn open_session_never_duplicates_and_focuses_last() {
        let mut state = StoreState::default();
        for key in ["a", "b", "a", "c", "b"] {
            state.open_session(key);
        }
        assert_eq!(state.active_sessions, vec!["a", "b", "c"]);
        assert_eq!(state.current_session_id.as_deref(), Some("b"));
    }

    #[test]
    fn closing_only_tab_clears_selection() {
        let mut state = StoreState::default();
        state.open_session("only");
        state.close_session("only");
        assert!(state.active_sessions.is_empty());
        assert_eq!(state.current_session_id, None);
    }

    #[test]
    fn closing_current_tab_selects_first_remaining() {
        let mut state = StoreState::default();
        for key in ["a", "b", "c"] {
            state.open_session(key);
        }
        state.close_session("c");
        assert_eq!(state.current_session_id.as_deref(), Some("a"));

        state.close_session("b");
        assert_eq!(state.current_session_id.as_deref(), Some("a"));
        assert_eq!(state.active_sessions, vec!["a"]);
    }

    #[test]
    fn set_current_session_keeps_selection_inside_active_set() {
        let mut state = StoreState::default();
        state.open_session("a");
        state.set_current_session(Some("z"));
        assert_eq!(state.active_sessions, vec!["a", "z"]);
        assert_eq!(state.current_session_id.as_deref(), Some("z"));
        state.set_current_session(None);
        assert_eq!(state.current_session_id, None);
    }

    #[test]
    fn delete_current_session_moves_selection_to_remaining_tab() {
        let mut state = StoreState::default();
        state.add_session(session("a", None));
        state.add_session(session("b", None));
        state.open_session("a");
        state.open_session("b");
        state.set_current_session(Some("a"));
        state.delete_session("a");
        assert_eq!(state.sessions.len(), 1);
        assert_eq!(state.active_sessions, vec!["b"]);
        assert_eq!(state.current_session_id.as_deref(), Some("b"));
    }

    #[test]
    fn merge_keeps_local_label_and_pending_sessions() {
        let mut state = StoreState::default();
        state.add_session(session("s1", Some("Refactor auth")));
        state.add_session(session("local-pending", Some("Session 10:00:00")));

        let mut remote = session("s1", None);
        remote.message_count = 12;
        state.merge_sessions(vec![remote, session("s2", Some("From server"))]);

        assert_eq!(state.sessions.len(), 3);
        let s1 = state.session("s1").unwrap();
        assert_eq!(s1.label.as_deref(), Some("Refactor auth"));
        assert_eq!(s1.message_count, 12);
        assert!(state.session("local-pending").is_some());
        assert_eq!(state.session("s2").unwrap().label.as_deref(), Some("From server"));
    }

    #[test]
    fn merge_matches_on_id_or_key() {
        let mut state = StoreState::default();
        let mut local = session("agent:main:abc", None);
        local.id = "abc".to_string();
        state.add_session(local);

        let mut by_id = session("other-key", Some("Remote label"));
        by_id.id = "abc".to_string();
        state.merge_sessions(vec![by_id.clone(), by_id]);

        assert_eq!(state.sessions.len(), 1);
        assert_eq!(state.sessions[0].label.as_deref(), Some("Remote label"));
        assert_eq!(state.resolve_key("abc"), "agent:main:abc");
    }

    #[test]
    fn file_touch_same_path_keeps_one_entry_first() {
        let mut state = StoreState::default();
        state.add_file_touch("s", touch("a.rs", FileAction::Read));
        state.add_file_touch("s", touch("b.rs", FileAction::Read));
        state.add_file_touch("s", touch("a.rs", FileAction::Edit));
        let files = &state.recent_files["s"];
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "a.rs");
        assert_eq!(files[0].action, FileAction::Edit);
        assert_eq!(files[1].path, "b.rs");
    }

    #[test]
    fn streaming_buffers_are_per_session() {
        let mut state = StoreState::default();
        state.start_streaming("a");
        state.start_streaming("b");
        state.append_streaming("a", "Hel");
        state.append_streaming("b", "Wor");
        state.append_streaming("a", "lo");
        assert_eq!(state.streaming["a"], "Hello");
        assert_eq!(state.streaming["b"], "Wor");
        state.clear_streaming("a");
        assert!(!state.streaming.contains_key("a"));
        assert_eq!(state.streaming["b"], "Wor");
    }

    #[test]
    fn gateway_echo_of_local_user_message_is_suppressed() {
        let mut state = StoreState::default();
        state.add_session(session("s", None));
        let local = Message::user(vec![ContentBlock::text("hello")]);
        assert!(state.add_message("s", local.clone()));

        let mut echo = local.clone();
        echo.id = "server-id".to_string();
        assert!(!state.reconcile_message("s", echo));

        let reply = crate::message::normalize_message(&json!({
            "role": "assistant",
            "content": "hello"
        }));
        assert!(state.reconcile_message("s", reply));
        assert_eq!(state.messages("s").len(), 2);
        assert_eq!(state.session("s").unwrap().message_count, 2);
    }

    #[test]
    fn repeated_local_sends_are_both_kept() {
        let mut state = StoreState::default();
        assert!(state.add_message("s", Message::user(vec![ContentBlock::text("again")])));
        assert!(state.add_message("s", Message::user(vec![ContentBlock::text("again")])));
        assert_eq!(state.messages("s").len(), 2);
    }

    #[test]
    fn same_message_id_is_stored_once() {
        let mut state = StoreState::default();
        let msg = Message::user(vec![ContentBlock::text("x")]);
        assert!(state.add_message("s", msg.clone()));
        assert!(!state.add_message("s", msg));
    }

    #[test]
    fn normalizes_session_listing_shapes() {
        let wrapped = json!({ "sessions": [
            { "key": "agent:main:1", "label": "One", "messageCount": 3 },
            { "id": "two" },
            { "label": "no identity" }
        ]});
        let sessions = normalize_session_list(&wrapped);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, "agent:main:1");
        assert_eq!(sessions[0].message_count, 3);
        assert_eq!(sessions[1].key, "two");
        assert!(sessions.iter().all(|s| s.status == SessionStatus::Idle));

        let bare = json!([{ "key": "k", "id": "i" }]);
        let sessions = normalize_session_list(&bare);
        assert_eq!((sessions[0].key.as_str(), sessions[0].id.as_str()), ("k", "i"));
    }

    #[test]
    fn placeholder_label_detection() {
        assert!(session("a", None).has_placeholder_label());
        assert!(session("a", Some("Session 12:01:02")).has_placeholder_label());
        assert!(!session("a", Some("Fix login")).has_placeholder_label());
    }

    #[tokio::test]
    async fn store_notifies_subscribers() {
        let store = Store::new();
        let mut changes = store.subscribe();
        let key = store.create_local_session().await;
        assert_eq!(changes.recv().await.unwrap(), StoreChange::Sessions);
        assert_eq!(changes.recv().await.unwrap(), StoreChange::Tabs);

        store.append_streaming(&key, "tok").await;
        assert_eq!(
            changes.recv().await.unwrap(),
            StoreChange::Streaming(key.clone())
        );
        assert_eq!(store.streaming_content(&key).await.as_deref(), Some("tok"));
        assert_eq!(store.current_session_id().await, Some(key));
    }
}
