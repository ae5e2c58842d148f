//! Gateway WebSocket protocol types (frames, connect handshake, method params).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ClientConfig;

/// Protocol version this client speaks (sent as min/max by default).
pub const PROTOCOL_VERSION: u32 = 3;

pub const METHOD_CONNECT: &str = "connect";
pub const METHOD_SESSIONS_LIST: &str = "sessions.list";
pub const METHOD_CHAT_SEND: &str = "chat.send";
pub const METHOD_CHAT_HISTORY: &str = "chat.history";
pub const METHOD_SESSIONS_HISTORY: &str = "sessions.history";
pub const METHOD_GATEWAY_EXEC: &str = "gateway.exec";

/// Any frame on the wire, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(WsRequest),
    #[serde(rename = "res")]
    Response(WsResponse),
    #[serde(rename = "event")]
    Event(WsEvent),
}

impl Frame {
    /// Parse one text frame. Anything that is not a well-formed frame is an error.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Wire request: `{ "type": "req", "id", "method", "params"? }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsRequest {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Wire response: `{ "type": "res", "id", "result"?, "error"? }`.
///
/// Gateways that answer with `ok` + `payload` are accepted too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, alias = "payload", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Error carried by a response: `{ code, message }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl ErrorShape {
    /// Accepts `{code, message}` objects (numeric codes included) and bare strings.
    fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => Self {
                code: "ERROR".to_string(),
                message: s.clone(),
            },
            Value::Object(obj) => {
                let code = match obj.get("code") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => "ERROR".to_string(),
                };
                let message = obj
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                Self { code, message }
            }
            other => Self {
                code: "ERROR".to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl WsResponse {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            ok: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: None,
            result: None,
            error: Some(serde_json::json!({ "code": code.into(), "message": message.into() })),
        }
    }

    /// Split into the result payload or the server-reported error.
    pub fn into_result(self) -> Result<Value, ErrorShape> {
        if let Some(ref error) = self.error {
            if !error.is_null() {
                return Err(ErrorShape::from_value(error));
            }
        }
        if self.ok == Some(false) {
            return Err(ErrorShape {
                code: "ERROR".to_string(),
                message: "request failed".to_string(),
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Wire event: `{ "type": "event", "event", "payload", "seq"?, "stateVersion"? }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsEvent {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_version: Option<Value>,
}

/// Params for the `connect` handshake request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ConnectClient,
    pub role: String,
    pub scopes: Vec<String>,
    pub auth: ConnectAuth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectClient {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ConnectParams {
    pub fn new(client: &ClientConfig, token: Option<String>) -> Self {
        Self {
            min_protocol: client.min_protocol,
            max_protocol: client.max_protocol,
            client: ConnectClient {
                id: client.id.clone(),
                version: client.version.clone(),
                platform: client.platform.clone(),
                mode: client.mode.clone(),
            },
            role: client.role.clone(),
            scopes: client.scopes.clone(),
            auth: ConnectAuth { token },
        }
    }
}

/// Server hello-ok payload after a successful connect. Every field is optional;
/// only used for logging the negotiated protocol.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(default)]
    pub protocol: Option<u32>,
    #[serde(default)]
    pub policy: Option<HelloPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    #[serde(default)]
    pub tick_interval_ms: Option<u64>,
}

/// Params for `sessions.list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsListParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_global: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Params for `chat.send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    pub session_key: String,
    pub message: String,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<ChatAttachment>>,
}

/// Attachment sent with `chat.send`: `{ type: "image", mediaType, data }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAttachment {
    #[serde(rename = "type")]
    pub typ: String,
    pub media_type: String,
    pub data: String,
}

/// Params for `chat.history` / `sessions.history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    pub session_key: String,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_tools: Option<bool>,
}

/// Params for `gateway.exec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecParams {
    pub command: String,
    pub args: Vec<String>,
}

/// Result of `gateway.exec`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecResult {
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
}
