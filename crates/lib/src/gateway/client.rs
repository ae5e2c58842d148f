//! Gateway client: one logical WebSocket connection with handshake, request/response
//! correlation, event dispatch into the store, and automatic reconnection.
//!
//! The connection task owns the socket. Requests are queued to it over an mpsc
//! channel; responses are matched through the per-connection [`PendingRequests`]
//! table, which is replaced wholesale on every new connection.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::error::ClientError;
use super::events::EventRouter;
use super::pending::{PendingRequests, Reply};
use super::protocol::{
    ConnectParams, Frame, HelloOk, SessionsListParams, WsRequest, METHOD_CONNECT,
    METHOD_SESSIONS_LIST,
};
use super::reconnect::ReconnectPolicy;
use crate::config::{resolve_gateway_token, resolve_gateway_url, ClientConfig, Config};
use crate::session::{normalize_session_list, Store};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Correlated request seam. Implemented by [`GatewayClient`]; the chat workflow and
/// remote file reads only depend on this.
#[async_trait::async_trait]
pub trait GatewayRequester: Send + Sync {
    /// Send `method` with `params` and wait for the matching response.
    async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError>;
}

/// Everything needed to open (and reopen) the connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: String,
    pub token: Option<String>,
    pub client: ClientConfig,
    pub reconnect: ReconnectPolicy,
}

impl ConnectOptions {
    /// Resolve URL and token (env overrides included) from config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: resolve_gateway_url(config),
            token: resolve_gateway_token(config),
            client: config.client.clone(),
            reconnect: config.reconnect.policy(),
        }
    }
}

/// Attach the token as a `token` query parameter. A bare host gets the root path.
pub fn connection_url(base: &str, token: Option<&str>) -> Result<String, ClientError> {
    let mut url = url::Url::parse(base)
        .map_err(|e| ClientError::Connect(format!("invalid gateway url {}: {}", base, e)))?;
    if let Some(t) = token.filter(|t| !t.is_empty()) {
        url.query_pairs_mut().append_pair("token", t);
    }
    Ok(url.into())
}

/// Per-connection state. Replaced atomically when a new channel opens.
#[derive(Default)]
struct Link {
    outbound: Option<mpsc::UnboundedSender<Message>>,
    pending: PendingRequests,
    /// Bumped by every `open_link`; handshake waiters only act on their own link.
    generation: u64,
    /// Set when the gateway refused the handshake. The channel stays open until
    /// the gateway closes it, but nothing more is sent over it.
    rejected: bool,
}

impl Link {
    fn sender(&self) -> Option<&mpsc::UnboundedSender<Message>> {
        if self.rejected {
            None
        } else {
            self.outbound.as_ref()
        }
    }
}

struct Inner {
    store: Store,
    link: Mutex<Link>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the gateway connection. Clones share the same connection.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl GatewayClient {
    /// Start the connection task and return immediately. The task keeps
    /// reconnecting after abnormal closes until [`GatewayClient::close`] is called.
    pub async fn connect(options: ConnectOptions, store: Store) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            store,
            link: Mutex::new(Link::default()),
            shutdown,
            task: Mutex::new(None),
        });
        let task = tokio::spawn(run(inner.clone(), options, shutdown_rx));
        *inner.task.lock().await = Some(task);
        Self { inner }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// True while a usable channel is open (the handshake may still be in flight).
    pub async fn is_open(&self) -> bool {
        self.inner.link.lock().await.sender().is_some()
    }

    /// Write a raw frame. Fails with `NotConnected` when no channel is open.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), ClientError> {
        let text = frame
            .to_text()
            .map_err(|e| ClientError::MalformedFrame(e.to_string()))?;
        let link = self.inner.link.lock().await;
        let outbound = link.sender().ok_or(ClientError::NotConnected)?;
        outbound
            .send(Message::Text(text))
            .map_err(|_| ClientError::NotConnected)
    }

    /// Correlated request. Resolves with the result payload, fails with the
    /// gateway's error, `NotConnected` when no channel is open, or
    /// `TransportClosed` when the connection drops before the response arrives.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        self.inner.request(method, params).await
    }

    /// Close the connection and stop reconnecting. Returns once the connection task
    /// has finished.
    pub async fn close(&self) {
        self.inner.shutdown.send_replace(true);
        let task = self.inner.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("gateway task ended abnormally: {}", e);
            }
        }
    }
}

#[async_trait::async_trait]
impl GatewayRequester for GatewayClient {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        GatewayClient::request(self, method, params).await
    }
}

fn request_message(id: &str, method: &str, params: Value) -> Result<Message, ClientError> {
    let frame = Frame::Request(WsRequest {
        id: id.to_string(),
        method: method.to_string(),
        params: if params.is_null() { None } else { Some(params) },
    });
    frame
        .to_text()
        .map(Message::Text)
        .map_err(|e| ClientError::MalformedFrame(e.to_string()))
}

impl Inner {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let rx = self.enqueue_request(method, params).await?;
        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(shape)) => Err(shape.into()),
            Err(_) => Err(ClientError::TransportClosed),
        }
    }

    /// Register a continuation and queue the frame, in that order.
    async fn enqueue_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<oneshot::Receiver<Reply>, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = request_message(&id, method, params)?;
        let mut link = self.link.lock().await;
        let Some(outbound) = link.sender().cloned() else {
            return Err(ClientError::NotConnected);
        };
        let rx = link.pending.register(id.clone());
        if outbound.send(msg).is_err() {
            link.pending.forget(&id);
            return Err(ClientError::NotConnected);
        }
        Ok(rx)
    }

    /// Install a fresh link for a newly opened channel. The `connect` request is
    /// queued before the sender becomes visible, so it is always the first frame.
    async fn open_link(
        &self,
        outbound: mpsc::UnboundedSender<Message>,
        options: &ConnectOptions,
    ) -> Result<(u64, oneshot::Receiver<Reply>), ClientError> {
        let params = serde_json::to_value(ConnectParams::new(&options.client, options.token.clone()))
            .map_err(|e| ClientError::MalformedFrame(e.to_string()))?;
        let id = uuid::Uuid::new_v4().to_string();
        let msg = request_message(&id, METHOD_CONNECT, params)?;
        let mut link = self.link.lock().await;
        let mut pending = PendingRequests::new();
        let rx = pending.register(id);
        outbound.send(msg).map_err(|_| ClientError::NotConnected)?;
        let generation = link.generation.wrapping_add(1);
        *link = Link {
            outbound: Some(outbound),
            pending,
            generation,
            rejected: false,
        };
        Ok((generation, rx))
    }

    /// Mark the connection usable, unless the link that sent this handshake is gone.
    /// The store is updated under the link lock so a concurrent teardown cannot be
    /// overwritten.
    async fn accept_handshake(&self, generation: u64) -> bool {
        let link = self.link.lock().await;
        if link.generation != generation || link.sender().is_none() {
            return false;
        }
        self.store.set_connection_error(None).await;
        self.store.set_connected(true).await;
        true
    }

    /// Record a refused handshake and stop sending on that link.
    async fn reject_handshake(&self, generation: u64, err: &ClientError) {
        let mut link = self.link.lock().await;
        if link.generation != generation || link.outbound.is_none() {
            return;
        }
        link.rejected = true;
        self.store.set_connected(false).await;
        self.store.set_connection_error(Some(err.to_string())).await;
    }

    /// Tear down the current link: no more sends, every waiter abandoned.
    async fn drop_link(&self) {
        let mut link = self.link.lock().await;
        link.outbound = None;
        link.rejected = false;
        let abandoned = link.pending.abandon_all();
        if abandoned > 0 {
            log::debug!("abandoned {} pending request(s)", abandoned);
        }
        self.store.set_connected(false).await;
    }

    async fn handle_text(&self, text: &str, router: &EventRouter) {
        match Frame::parse(text) {
            Ok(Frame::Response(res)) => {
                self.link.lock().await.pending.resolve(res);
            }
            Ok(Frame::Event(ev)) => router.dispatch(ev).await,
            Ok(Frame::Request(req)) => {
                log::debug!("ignoring request frame from gateway: {}", req.method)
            }
            Err(e) => log::debug!("{}", ClientError::MalformedFrame(e.to_string())),
        }
    }
}

/// Wait for the handshake reply, then hydrate sessions. Runs beside the receive loop
/// so the loop can deliver the responses.
async fn finish_handshake(inner: Arc<Inner>, generation: u64, reply: oneshot::Receiver<Reply>) {
    match reply.await {
        Ok(Ok(hello)) => {
            let hello: HelloOk = serde_json::from_value(hello).unwrap_or_default();
            log::info!(
                "gateway handshake ok (protocol {:?}, tick {:?}ms)",
                hello.protocol,
                hello.policy.and_then(|p| p.tick_interval_ms)
            );
            if !inner.accept_handshake(generation).await {
                log::debug!("handshake completed on a closed link");
                return;
            }

            let params = serde_json::to_value(SessionsListParams::default()).unwrap_or(Value::Null);
            match inner.request(METHOD_SESSIONS_LIST, params).await {
                Ok(result) => {
                    let sessions = normalize_session_list(&result);
                    log::info!("hydrated {} session(s) from gateway", sessions.len());
                    inner.store.merge_sessions(sessions).await;
                }
                Err(e) => log::warn!("sessions.list failed: {}", e),
            }
        }
        Ok(Err(shape)) => {
            let err = ClientError::HandshakeFailed(shape.message);
            log::warn!("{}", err);
            inner.reject_handshake(generation, &err).await;
        }
        Err(_) => log::debug!("handshake abandoned: connection closed"),
    }
}

/// Connection loop: connect, serve until close, wait, repeat. Exits on shutdown or
/// when the configured URL cannot be parsed.
async fn run(inner: Arc<Inner>, options: ConnectOptions, mut shutdown: watch::Receiver<bool>) {
    let url = match connection_url(&options.url, options.token.as_deref()) {
        Ok(url) => url,
        Err(e) => {
            log::error!("{}", e);
            inner.store.set_connection_error(Some(e.to_string())).await;
            return;
        }
    };
    let mut attempt: u32 = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let connected = tokio::select! {
            r = tokio_tungstenite::connect_async(url.as_str()) => r,
            _ = shutdown.changed() => break,
        };
        match connected {
            Ok((ws, _)) => {
                attempt = 0;
                log::info!("connected to gateway {}", options.url);
                if serve(&inner, ws, &options, &mut shutdown).await {
                    break;
                }
                log::warn!("gateway connection lost");
            }
            Err(e) => {
                let err = ClientError::Connect(e.to_string());
                log::warn!("{}", err);
                inner.store.set_connection_error(Some(err.to_string())).await;
            }
        }

        let delay = options.reconnect.delay_for(attempt);
        attempt = attempt.saturating_add(1);
        log::warn!("reconnecting to gateway in {:?} (attempt {})", delay, attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    log::info!("gateway connection closed");
}

/// Serve one open channel. Returns true when the close was requested locally.
async fn serve(
    inner: &Arc<Inner>,
    ws: WsStream,
    options: &ConnectOptions,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // A new channel never inherits a partial reply.
    inner.store.clear_all_streaming().await;

    let (generation, handshake) = match inner.open_link(tx, options).await {
        Ok(opened) => opened,
        Err(e) => {
            log::warn!("could not queue connect request: {}", e);
            inner.drop_link().await;
            return false;
        }
    };
    tokio::spawn(finish_handshake(inner.clone(), generation, handshake));

    let router = EventRouter::new(inner.store.clone());
    let local_close = loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => inner.handle_text(&text, &router).await,
                Some(Ok(Message::Close(frame))) => {
                    log::info!("gateway closed the connection: {:?}", frame);
                    break false;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("gateway read error: {}", e);
                    break false;
                }
                None => break false,
            },
            out = rx.recv() => match out {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        log::warn!("gateway write error: {}", e);
                        break false;
                    }
                }
                None => break false,
            },
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break true;
            }
        }
    };

    inner.drop_link().await;
    local_close
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_options() -> ConnectOptions {
        ConnectOptions {
            // Nothing listens on port 9; the client stays disconnected.
            url: "ws://127.0.0.1:9".to_string(),
            token: Some("t".to_string()),
            client: ClientConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Connection state without a connection task, for driving links by hand.
    fn idle_inner(store: Store) -> Arc<Inner> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Inner {
            store,
            link: Mutex::new(Link::default()),
            shutdown,
            task: Mutex::new(None),
        })
    }

    #[test]
    fn token_is_attached_as_query_parameter() {
        assert_eq!(
            connection_url("ws://127.0.0.1:18789", Some("a b&c")).unwrap(),
            "ws://127.0.0.1:18789/?token=a+b%26c"
        );
        assert_eq!(
            connection_url("ws://host/ws?x=1", Some("t")).unwrap(),
            "ws://host/ws?x=1&token=t"
        );
        assert_eq!(connection_url("ws://host", None).unwrap(), "ws://host/");
        assert_eq!(connection_url("ws://host/ws", Some("")).unwrap(), "ws://host/ws");
    }

    #[test]
    fn invalid_url_is_a_connect_error() {
        assert!(matches!(
            connection_url("not a url", Some("t")),
            Err(ClientError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn request_without_channel_fails_fast() {
        let store = Store::new();
        let client = GatewayClient::connect(unreachable_options(), store.clone()).await;
        let err = client
            .request(METHOD_SESSIONS_LIST, Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::NotConnected);
        assert!(!client.is_open().await);
        assert!(store.sessions().await.is_empty());
        client.close().await;
    }

    #[tokio::test]
    async fn handshake_for_a_dropped_link_does_not_mark_connected() {
        let store = Store::new();
        let inner = idle_inner(store.clone());
        let options = unreachable_options();

        let (tx, _first_rx) = mpsc::unbounded_channel();
        let (first, _) = inner.open_link(tx, &options).await.unwrap();
        inner.drop_link().await;
        assert!(!inner.accept_handshake(first).await);
        assert!(!store.connection().await.0);

        let (tx, _second_rx) = mpsc::unbounded_channel();
        let (second, _) = inner.open_link(tx, &options).await.unwrap();
        assert!(!inner.accept_handshake(first).await);
        assert!(!store.connection().await.0);
        assert!(inner.accept_handshake(second).await);
        assert!(store.connection().await.0);
    }

    #[tokio::test]
    async fn rejected_handshake_stops_outbound_requests() {
        let store = Store::new();
        let inner = idle_inner(store.clone());
        let (tx, mut sent) = mpsc::unbounded_channel();
        let (generation, _) = inner.open_link(tx, &unreachable_options()).await.unwrap();
        assert!(matches!(sent.try_recv(), Ok(Message::Text(_))));

        let err = ClientError::HandshakeFailed("invalid token".to_string());
        inner.reject_handshake(generation, &err).await;

        assert_eq!(
            inner.request("echo", Value::Null).await.unwrap_err(),
            ClientError::NotConnected
        );
        assert!(sent.try_recv().is_err());
        assert_eq!(
            store.connection().await,
            (false, Some("gateway handshake failed: invalid token".to_string()))
        );
        assert!(!inner.accept_handshake(generation).await);
    }
}
