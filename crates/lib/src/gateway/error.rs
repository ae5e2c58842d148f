//! Errors surfaced by the gateway client.

use super::protocol::ErrorShape;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// No open channel when a frame or request was sent.
    #[error("gateway not connected")]
    NotConnected,
    /// The gateway rejected the connect handshake.
    #[error("gateway handshake failed: {0}")]
    HandshakeFailed(String),
    /// Application error reported in a response's `error` field.
    #[error("gateway error {code}: {message}")]
    Gateway { code: String, message: String },
    /// The connection closed while the request was waiting; its continuation was abandoned.
    #[error("gateway connection closed")]
    TransportClosed,
    /// Inbound data that is not a valid frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// Opening the WebSocket failed.
    #[error("gateway connect failed: {0}")]
    Connect(String),
}

impl From<ErrorShape> for ClientError {
    fn from(e: ErrorShape) -> Self {
        ClientError::Gateway {
            code: e.code,
            message: e.message,
        }
    }
}
