use crate::bot::socketio::{
    decode_engine_handshake, decode_engine_packet, decode_socket_packet, encode_pong,
    EngineHandshake, EnginePacket, SocketPacket, CONNECT_DEFAULT_NAMESPACE,
    DISCONNECT_DEFAULT_NAMESPACE,
};
use crate::bot::types::SymbolUpdate;
use crate::error::AppError;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::{SinkExt, StreamExt};
use simd_json::OwnedValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SYMBOLS_DATA_EVENT: &str = "symbolsData";
pub const ERROR_EVENT: &str = "error";

pub type SocketIoWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Time a cancelled stream gets to say goodbye to the server before it is dropped.
const LEAVE_GRACE: Duration = Duration::from_secs(1);

/// Inbound traffic of an open stream. The end of the stream is the transport ending.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Update(SymbolUpdate),
    Error(String),
}

pub type MessageStream = BoxStream<'static, StreamMessage>;

/// Events surfaced to the owner of a connection, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Update(SymbolUpdate),
    Error(String),
    Closed,
}

pub type EventHandler = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Opens the transport and completes any handshake before returning.
    ///
    /// Once `shutdown` is cancelled the returned stream should leave the server cleanly
    /// and end.
    async fn open(
        &self,
        endpoint: &str,
        shutdown: CancellationToken,
    ) -> Result<MessageStream, AppError>;
}

/// Socket.IO client for the monitoring service, joining the default namespace over the
/// websocket transport.
#[derive(Debug, Clone, Default)]
pub struct SocketIoConnector;

#[async_trait]
impl StreamConnector for SocketIoConnector {
    async fn open(
        &self,
        endpoint: &str,
        shutdown: CancellationToken,
    ) -> Result<MessageStream, AppError> {
        let ws_config = WebSocketConfig {
            max_message_size: Some(16 << 20),
            max_frame_size: Some(4 << 20),
            ..Default::default()
        };

        let (mut ws, _) = connect_async_with_config(endpoint, Some(ws_config), true)
            .await
            .map_err(|error| AppError::Connection(format!("websocket connect failed: {error}")))?;
        let engine = socket_io_handshake(&mut ws)
            .await
            .map_err(into_connection_error)?;
        info!(
            sid = %engine.sid,
            ping_interval_ms = engine.ping_interval,
            ping_timeout_ms = engine.ping_timeout,
            "socket.io namespace joined"
        );

        let session = SocketIoSession {
            ws,
            heartbeat: engine.heartbeat_window(),
            shutdown,
            finished: false,
        };
        let messages = stream::unfold(session, |mut session| async move {
            session
                .next_message()
                .await
                .map(|message| (message, session))
        });
        Ok(messages.boxed())
    }
}

fn into_connection_error(error: AppError) -> AppError {
    match error {
        AppError::Connection(_) => error,
        other => AppError::Connection(format!("socket.io handshake failed: {other}")),
    }
}

async fn socket_io_handshake(ws: &mut SocketIoWsStream) -> Result<EngineHandshake, AppError> {
    let mut engine: Option<EngineHandshake> = None;

    while let Some(frame) = ws.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        match decode_engine_packet(&text)? {
            EnginePacket::Open(data) => {
                engine = Some(decode_engine_handshake(data)?);
                ws.send(Message::Text(CONNECT_DEFAULT_NAMESPACE.to_string()))
                    .await?;
            }
            EnginePacket::Ping(data) => {
                ws.send(Message::Text(encode_pong(data))).await?;
            }
            EnginePacket::Message(data) => match decode_socket_packet(data)? {
                SocketPacket::Connect { .. } if engine.is_some() => {
                    return engine.ok_or_else(|| {
                        AppError::Connection("socket.io connect before engine open".to_string())
                    });
                }
                SocketPacket::ConnectError { message, .. } => {
                    return Err(AppError::Connection(format!(
                        "socket.io connection refused: {message}"
                    )));
                }
                _ => {}
            },
            EnginePacket::Close => break,
            _ => {}
        }
    }

    Err(AppError::Connection(
        "stream closed during socket.io handshake".to_string(),
    ))
}

enum SessionStep {
    Emit(StreamMessage),
    Continue,
    End,
}

struct SocketIoSession {
    ws: SocketIoWsStream,
    heartbeat: Option<Duration>,
    shutdown: CancellationToken,
    finished: bool,
}

impl SocketIoSession {
    async fn next_message(&mut self) -> Option<StreamMessage> {
        if self.finished {
            return None;
        }

        loop {
            let heartbeat = self.heartbeat;
            let inbound = {
                let ws = &mut self.ws;
                let shutdown = &self.shutdown;
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    inbound = async {
                        match heartbeat {
                            Some(window) => tokio::time::timeout(window, ws.next()).await,
                            None => Ok(ws.next().await),
                        }
                    } => Some(inbound),
                }
            };

            let frame = match inbound {
                None => {
                    self.leave().await;
                    return None;
                }
                Some(Err(_)) => {
                    self.finished = true;
                    let window_ms = heartbeat
                        .map(|window| window.as_millis() as u64)
                        .unwrap_or_default();
                    warn!(window_ms, "socket.io heartbeat missed; dropping connection");
                    return Some(StreamMessage::Error(format!(
                        "no traffic from server within {window_ms}ms heartbeat window"
                    )));
                }
                Some(Ok(Some(Ok(frame)))) => frame,
                Some(Ok(Some(Err(error)))) => {
                    self.finished = true;
                    return Some(StreamMessage::Error(format!("websocket frame error: {error}")));
                }
                Some(Ok(None)) => return None,
            };

            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => return None,
                _ => continue,
            };

            match self.handle_text(&text).await {
                SessionStep::Emit(message) => return Some(message),
                SessionStep::Continue => {}
                SessionStep::End => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    async fn leave(&mut self) {
        self.finished = true;
        let _ = self
            .ws
            .send(Message::Text(DISCONNECT_DEFAULT_NAMESPACE.to_string()))
            .await;
        let _ = self.ws.send(Message::Close(None)).await;
        debug!("left socket.io namespace");
    }

    async fn handle_text(&mut self, text: &str) -> SessionStep {
        let packet = match decode_engine_packet(text) {
            Ok(packet) => packet,
            Err(error) => return SessionStep::Emit(StreamMessage::Error(error.to_string())),
        };

        match packet {
            EnginePacket::Ping(data) => {
                if let Err(error) = self.ws.send(Message::Text(encode_pong(data))).await {
                    self.finished = true;
                    return SessionStep::Emit(StreamMessage::Error(format!(
                        "failed to answer engine ping: {error}"
                    )));
                }
                SessionStep::Continue
            }
            EnginePacket::Message(data) => match decode_socket_packet(data) {
                Ok(packet) => socket_packet_step(packet),
                Err(error) => SessionStep::Emit(StreamMessage::Error(error.to_string())),
            },
            EnginePacket::Close => SessionStep::End,
            EnginePacket::Open(_)
            | EnginePacket::Pong(_)
            | EnginePacket::Upgrade
            | EnginePacket::Noop => SessionStep::Continue,
        }
    }
}

fn socket_packet_step(packet: SocketPacket) -> SessionStep {
    if !packet.is_default_namespace() {
        return SessionStep::Continue;
    }

    match packet {
        SocketPacket::Event { name, mut args, .. } if name == SYMBOLS_DATA_EVENT => {
            if args.is_empty() {
                return SessionStep::Emit(StreamMessage::Error(
                    "symbolsData event without payload".to_string(),
                ));
            }
            match simd_json::serde::from_owned_value::<SymbolUpdate>(args.swap_remove(0)) {
                Ok(update) => SessionStep::Emit(StreamMessage::Update(update)),
                Err(error) => SessionStep::Emit(StreamMessage::Error(format!(
                    "invalid symbolsData payload: {error}"
                ))),
            }
        }
        SocketPacket::Event { name, args, .. } if name == ERROR_EVENT => {
            SessionStep::Emit(StreamMessage::Error(describe_error_event(args)))
        }
        SocketPacket::Event { name, .. } => {
            debug!(event = %name, "ignoring unhandled socket.io event");
            SessionStep::Continue
        }
        SocketPacket::Disconnect { .. } => SessionStep::End,
        SocketPacket::ConnectError { message, .. } => {
            SessionStep::Emit(StreamMessage::Error(format!("socket.io error: {message}")))
        }
        SocketPacket::Connect { .. } | SocketPacket::Ack { .. } => SessionStep::Continue,
    }
}

fn describe_error_event(mut args: Vec<OwnedValue>) -> String {
    if args.is_empty() {
        return "stream reported an error".to_string();
    }
    let diagnostic = args.swap_remove(0);
    if let Ok(text) = simd_json::serde::from_owned_value::<String>(diagnostic.clone()) {
        return text;
    }
    simd_json::serde::to_string(&diagnostic)
        .unwrap_or_else(|_| "stream reported an error".to_string())
}

/// The single live connection of one run. Dropping it cancels and aborts the pump.
pub struct ConnectionHandle {
    id: u64,
    endpoint: String,
    cancellation_token: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn shutdown(mut self) {
        self.cancellation_token.cancel();
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.await;
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

async fn pump_events(
    mut messages: MessageStream,
    handler: EventHandler,
    cancel: CancellationToken,
    armed: oneshot::Receiver<()>,
) {
    tokio::select! {
        _ = cancel.cancelled() => {
            leave_stream(messages).await;
            handler(ConnectionEvent::Closed);
            return;
        }
        _ = armed => {}
    }

    handler(ConnectionEvent::Connected);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = messages.next() => next,
        };

        match next {
            Some(StreamMessage::Update(update)) => handler(ConnectionEvent::Update(update)),
            Some(StreamMessage::Error(reason)) => {
                warn!(%reason, "stream reported an error");
                handler(ConnectionEvent::Error(reason));
            }
            None => break,
        }
    }

    if cancel.is_cancelled() {
        leave_stream(messages).await;
    } else {
        drop(messages);
    }
    handler(ConnectionEvent::Closed);
}

/// Polls a cancelled stream once more so it can leave the server before it is dropped.
async fn leave_stream(mut messages: MessageStream) {
    let _ = tokio::time::timeout(LEAVE_GRACE, messages.next()).await;
}

/// Owns at most one streaming connection at a time.
pub struct ConnectionManager {
    connector: Arc<dyn StreamConnector>,
    connect_timeout: Duration,
    next_id: u64,
    handle: Option<ConnectionHandle>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn StreamConnector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connect_timeout,
            next_id: 0,
            handle: None,
        }
    }

    /// Opens one connection and starts delivering its events to `handler`.
    ///
    /// The handle is stored before the first event is delivered, so `handler` never
    /// observes a connection the manager does not own yet.
    pub async fn connect(&mut self, endpoint: &str, handler: EventHandler) -> Result<u64, AppError> {
        if self.handle.is_some() {
            return Err(AppError::AlreadyConnected);
        }

        let cancellation_token = CancellationToken::new();
        let opening = self.connector.open(endpoint, cancellation_token.clone());
        let messages = match tokio::time::timeout(self.connect_timeout, opening).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AppError::Connection(format!(
                    "connect timed out after {}ms",
                    self.connect_timeout.as_millis()
                )))
            }
        };

        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;
        let (armed_tx, armed_rx) = oneshot::channel();
        let join_handle = tokio::spawn(pump_events(
            messages,
            handler,
            cancellation_token.clone(),
            armed_rx,
        ));

        self.handle = Some(ConnectionHandle {
            id,
            endpoint: endpoint.to_string(),
            cancellation_token,
            join_handle: Some(join_handle),
        });
        let _ = armed_tx.send(());

        debug!(connection_id = id, endpoint, "stream connection opened");
        Ok(id)
    }

    /// Releases the current handle, if any. Returns whether a handle was released.
    pub async fn disconnect(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return false;
        };
        let id = handle.id();
        let endpoint = handle.endpoint().to_string();
        handle.shutdown().await;
        debug!(connection_id = id, %endpoint, "stream connection released");
        true
    }

    /// Releases the current handle only when it is the connection `id`.
    pub async fn release_if(&mut self, id: u64) -> bool {
        match &self.handle {
            Some(handle) if handle.id() == id => self.disconnect().await,
            _ => false,
        }
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    pub fn current_id(&self) -> Option<u64> {
        self.handle.as_ref().map(ConnectionHandle::id)
    }
}
