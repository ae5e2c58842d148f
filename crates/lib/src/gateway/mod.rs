//! Gateway: WebSocket client for the remote control plane.
//!
//! One connection carries correlated requests (req/res) and pushed events. The first
//! frame on every connection is `connect`; after a successful handshake the session
//! list is fetched and merged into the store. Abnormal closes are retried forever
//! according to the configured [`ReconnectPolicy`].

mod client;
mod error;
mod events;
mod pending;
mod protocol;
mod reconnect;

pub use client::{connection_url, ConnectOptions, GatewayClient, GatewayRequester};
pub use error::ClientError;
pub use events::{ChatEvent, ChatState, EventKind, EventRouter, InboundEvent, LegacyEvent, SessionEvent};
pub use pending::{PendingRequests, Reply};
pub use protocol::{
    ChatAttachment, ChatSendParams, ConnectAuth, ConnectClient, ConnectParams, ErrorShape,
    ExecParams, ExecResult, Frame, HelloOk, HelloPolicy, HistoryParams, SessionsListParams,
    WsEvent, WsRequest, WsResponse, METHOD_CHAT_HISTORY, METHOD_CHAT_SEND, METHOD_CONNECT,
    METHOD_GATEWAY_EXEC, METHOD_SESSIONS_HISTORY, METHOD_SESSIONS_LIST, PROTOCOL_VERSION,
};
pub use reconnect::ReconnectPolicy;
