//! Conversation messages and their content blocks, plus normalization of the
//! loosely-shaped messages the gateway sends (history entries and `final` events).

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One block of message content. Order within a message is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
    },
}

/// Inline image payload: `{ type: "base64", media_type, data }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type", default = "default_source_kind")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

fn default_source_kind() -> String {
    "base64".to_string()
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        ContentBlock::Image {
            source: ImageSource {
                kind: default_source_kind(),
                media_type: media_type.into(),
                data: data.into(),
            },
        }
    }
}

/// A single stored turn in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// A locally authored user message with a fresh id and the current time.
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            content,
            timestamp: Utc::now(),
        }
    }

    /// Concatenation of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Normalize a raw message object: missing `id` gets a fresh id, non-array `content`
/// becomes a single text block, missing `timestamp` becomes now. Roles other than
/// "user" are shown as assistant turns.
pub fn normalize_message(raw: &Value) -> Message {
    let id = match raw.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    };
    let role = match raw.get("role").and_then(|v| v.as_str()) {
        Some("user") => Role::User,
        _ => Role::Assistant,
    };
    let content = normalize_content(raw.get("content").unwrap_or(&Value::Null));
    let timestamp = raw
        .get("timestamp")
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);
    Message {
        id,
        role,
        content,
        timestamp,
    }
}

/// Normalize message content. Arrays keep every recognizable block in order;
/// anything else is coerced into one text block.
pub fn normalize_content(raw: &Value) -> Vec<ContentBlock> {
    match raw {
        Value::Array(items) => items.iter().filter_map(normalize_block).collect(),
        Value::String(s) => vec![ContentBlock::text(s.clone())],
        Value::Null => vec![ContentBlock::text("")],
        Value::Object(obj) => match normalize_block(raw) {
            Some(block) => vec![block],
            None => vec![ContentBlock::text(
                obj.get("text")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| raw.to_string()),
            )],
        },
        other => vec![ContentBlock::text(other.to_string())],
    }
}

fn normalize_block(raw: &Value) -> Option<ContentBlock> {
    if let Value::String(s) = raw {
        return Some(ContentBlock::text(s.clone()));
    }
    match serde_json::from_value::<ContentBlock>(raw.clone()) {
        Ok(block) => Some(block),
        Err(_) => match raw.get("text").and_then(|v| v.as_str()) {
            Some(text) => Some(ContentBlock::text(text)),
            None => {
                log::debug!(
                    "skipping unrecognized content block type {:?}",
                    raw.get("type")
                );
                None
            }
        },
    }
}

/// Text fragments carried by a partial (streaming) message payload, concatenated.
pub fn text_fragments(raw: &Value) -> String {
    match raw.get("content") {
        Some(Value::Array(items)) => items
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect(),
        Some(Value::String(s)) => s.clone(),
        _ => raw
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string(),
    }
}

/// Parse an RFC 3339 string or a Unix timestamp (seconds or milliseconds).
pub fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        Value::Number(n) => {
            let n = n.as_f64()?;
            // Anything past year 5138 in seconds is treated as milliseconds.
            let millis = if n.abs() >= 1e11 { n } else { n * 1000.0 };
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        _ => None,
    }
}
