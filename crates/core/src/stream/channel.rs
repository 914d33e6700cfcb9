//! Event channel to the service's `/stream` namespace.
//!
//! `ChannelConnector` opens a channel and hands back a [`ChannelConnection`].
//! Errors and the disconnect travel on a queue; frames go through a single
//! slot where a newer frame replaces one that was not consumed yet.
//! `SocketIoConnector` speaks Socket.IO over a WebSocket; tests use
//! `testing::MockChannelConnector`.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::{ServiceConfig, StreamConfig};
use crate::metrics::CHANNEL_CONNECTIONS;

use super::socketio::{EnginePacket, OpenPayload, PacketKind, SocketPacket, ENGINE_IO_VERSION};
use super::types::{ChannelError, ChannelEvent, ErrorPayload, FrameEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Create the two ends of a channel.
///
/// `buffer` bounds the queue of non-frame events. `shutdown` is signalled
/// when the connection is closed or dropped.
pub fn channel(buffer: usize, shutdown: broadcast::Sender<()>) -> (ChannelSender, ChannelConnection) {
    let (events_tx, events_rx) = mpsc::channel(buffer.max(1));
    let (frames_tx, frames_rx) = watch::channel(None);
    (
        ChannelSender {
            events: events_tx,
            frames: frames_tx,
        },
        ChannelConnection {
            events: events_rx,
            frames: frames_rx,
            shutdown,
        },
    )
}

/// Transport side of a channel.
pub struct ChannelSender {
    events: mpsc::Sender<ChannelEvent>,
    frames: watch::Sender<Option<FrameEvent>>,
}

impl ChannelSender {
    /// Publish a frame. A frame still waiting to be consumed is replaced.
    ///
    /// Returns false once the connection is gone.
    pub fn frame(&self, frame: FrameEvent) -> bool {
        self.frames.send(Some(frame)).is_ok()
    }

    /// Queue a non-frame event, waiting for room.
    ///
    /// Frames are routed to [`ChannelSender::frame`]. Returns false once the
    /// connection is gone.
    pub async fn send(&self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Frame(frame) => self.frame(frame),
            event => self.events.send(event).await.is_ok(),
        }
    }

    /// Queue a non-frame event without waiting. Frames are routed to
    /// [`ChannelSender::frame`].
    pub fn try_send(&self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Frame(frame) => self.frame(frame),
            event => self.events.try_send(event).is_ok(),
        }
    }
}

/// An open channel.
///
/// Events arrive through [`ChannelConnection::recv`] until a
/// [`ChannelEvent::Disconnected`] or until the channel is closed locally.
/// Dropping the connection closes it.
pub struct ChannelConnection {
    events: mpsc::Receiver<ChannelEvent>,
    frames: watch::Receiver<Option<FrameEvent>>,
    shutdown: broadcast::Sender<()>,
}

impl ChannelConnection {
    /// Next event, or `None` once the transport is gone.
    ///
    /// Only the latest frame is ever returned; frames that arrived while
    /// the previous one was being handled are skipped.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            tokio::select! {
                biased;
                Ok(()) = self.frames.changed() => {
                    if let Some(frame) = self.take_frame() {
                        return Some(ChannelEvent::Frame(frame));
                    }
                }
                event = self.events.recv() => return event,
            }
        }
    }

    /// Next event if one is ready.
    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        if self.frames.has_changed().unwrap_or(false) {
            if let Some(frame) = self.take_frame() {
                return Some(ChannelEvent::Frame(frame));
            }
        }
        self.events.try_recv().ok()
    }

    fn take_frame(&mut self) -> Option<FrameEvent> {
        self.frames.borrow_and_update().clone()
    }

    /// Handle that closes the channel from elsewhere.
    pub fn closer(&self) -> ChannelCloser {
        ChannelCloser {
            shutdown: self.shutdown.clone(),
        }
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Closes a channel without owning its event queue.
#[derive(Clone)]
pub struct ChannelCloser {
    shutdown: broadcast::Sender<()>,
}

impl ChannelCloser {
    pub fn close(&self) {
        // Err only means the transport task is already gone.
        let _ = self.shutdown.send(());
    }
}

/// Opens event channels to the service.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Open the channel and join the namespace.
    ///
    /// Returns once the namespace join was acknowledged.
    async fn connect(&self) -> Result<ChannelConnection, ChannelError>;
}

/// Socket.IO client over a WebSocket transport.
pub struct SocketIoConnector {
    endpoint: Url,
    namespace: String,
    connect_timeout: Duration,
    event_buffer: usize,
}

impl SocketIoConnector {
    pub fn new(service: &ServiceConfig, stream: &StreamConfig) -> Result<Self, ChannelError> {
        Ok(Self {
            endpoint: socket_endpoint(&service.base_url, &service.socket_path)?,
            namespace: service.namespace.clone(),
            connect_timeout: Duration::from_secs(stream.connect_timeout_secs as u64),
            event_buffer: stream.event_buffer.max(1),
        })
    }

    /// The WebSocket URL this connector dials.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn handshake(&self) -> Result<(WsStream, OpenPayload), ChannelError> {
        let (mut ws, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        let open = loop {
            match EnginePacket::decode(&next_text(&mut ws).await?)? {
                EnginePacket::Open(open) => break open,
                EnginePacket::Noop => continue,
                other => {
                    return Err(ChannelError::Handshake(format!(
                        "expected open packet, got {:?}",
                        other
                    )))
                }
            }
        };
        debug!(
            "Engine.IO session {} (ping every {}ms)",
            open.sid, open.ping_interval
        );

        send_packet(&mut ws, &SocketPacket::connect(&self.namespace)).await?;

        loop {
            match EnginePacket::decode(&next_text(&mut ws).await?)? {
                EnginePacket::Ping(data) => send_text(&mut ws, EnginePacket::Pong(data).encode()).await?,
                EnginePacket::Message(body) => {
                    let packet = SocketPacket::decode(&body)?;
                    if packet.namespace != self.namespace {
                        continue;
                    }
                    match packet.kind {
                        PacketKind::Connect => break,
                        PacketKind::ConnectError => {
                            let message = packet
                                .data
                                .and_then(|d| serde_json::from_value::<ErrorPayload>(d).ok())
                                .map(|p| p.message().to_string())
                                .unwrap_or_else(|| "namespace refused".to_string());
                            return Err(ChannelError::Handshake(message));
                        }
                        _ => continue,
                    }
                }
                EnginePacket::Close => {
                    return Err(ChannelError::Handshake(
                        "closed during handshake".to_string(),
                    ))
                }
                _ => {}
            }
        }

        Ok((ws, open))
    }
}

#[async_trait]
impl ChannelConnector for SocketIoConnector {
    async fn connect(&self) -> Result<ChannelConnection, ChannelError> {
        let (ws, open) = match timeout(self.connect_timeout, self.handshake()).await {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                CHANNEL_CONNECTIONS.with_label_values(&["failed"]).inc();
                return Err(e);
            }
            Err(_) => {
                CHANNEL_CONNECTIONS.with_label_values(&["failed"]).inc();
                return Err(ChannelError::Connect(format!(
                    "timed out after {:?}",
                    self.connect_timeout
                )));
            }
        };
        CHANNEL_CONNECTIONS.with_label_values(&["ok"]).inc();
        info!("Joined {} on {}", self.namespace, self.endpoint);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (tx, connection) = channel(self.event_buffer, shutdown_tx);
        // Capacity is at least one and the queue is empty.
        tx.try_send(ChannelEvent::Connected);

        tokio::spawn(pump(ws, open, self.namespace.clone(), tx, shutdown_rx));
        Ok(connection)
    }
}

/// Build the Engine.IO WebSocket URL from the service base URL.
pub fn socket_endpoint(base_url: &str, socket_path: &str) -> Result<Url, ChannelError> {
    let mut url =
        Url::parse(base_url).map_err(|e| ChannelError::InvalidUrl(format!("{}: {}", base_url, e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ChannelError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ChannelError::InvalidUrl(format!("cannot use scheme {}", scheme)))?;

    let prefix = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{}/{}/", prefix, socket_path.trim_matches('/')));
    url.set_query(Some(&format!(
        "EIO={}&transport=websocket",
        ENGINE_IO_VERSION
    )));
    Ok(url)
}

async fn next_text(ws: &mut WsStream) -> Result<String, ChannelError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(_))) | None => {
                return Err(ChannelError::Handshake("connection closed".to_string()))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ChannelError::Connect(e.to_string())),
        }
    }
}

async fn send_text(ws: &mut WsStream, text: String) -> Result<(), ChannelError> {
    ws.send(Message::Text(text))
        .await
        .map_err(|e| ChannelError::Protocol(e.to_string()))
}

async fn send_packet(ws: &mut WsStream, packet: &SocketPacket) -> Result<(), ChannelError> {
    send_text(ws, EnginePacket::Message(packet.encode()).encode()).await
}

enum Flow {
    Continue,
    Stop(Option<String>),
}

/// Read the socket until it closes, the server stops pinging, or the
/// connection is closed locally.
async fn pump(
    mut ws: WsStream,
    open: OpenPayload,
    namespace: String,
    events: ChannelSender,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let deadline = Duration::from_millis(open.ping_deadline_ms());
    let ping_timer = sleep(deadline);
    tokio::pin!(ping_timer);

    let reason = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Closing channel {}", open.sid);
                let _ = send_packet(&mut ws, &SocketPacket::disconnect(&namespace)).await;
                let _ = ws.close(None).await;
                break None;
            }
            _ = &mut ping_timer => {
                break Some(format!("no ping from server within {}ms", deadline.as_millis()));
            }
            message = ws.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break Some("connection closed".to_string()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Some(e.to_string()),
                };

                let packet = match EnginePacket::decode(&text) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("Ignoring malformed packet: {}", e);
                        continue;
                    }
                };

                match packet {
                    EnginePacket::Ping(data) => {
                        ping_timer.as_mut().reset(Instant::now() + deadline);
                        if let Err(e) = send_text(&mut ws, EnginePacket::Pong(data).encode()).await {
                            break Some(e.to_string());
                        }
                    }
                    EnginePacket::Close => break Some("closed by server".to_string()),
                    EnginePacket::Message(body) => {
                        match dispatch(&body, &namespace, &events).await {
                            Flow::Continue => {}
                            Flow::Stop(reason) => break reason,
                        }
                    }
                    _ => {}
                }
            }
        }
    };

    if let Some(reason) = reason {
        info!("Channel {} lost: {}", open.sid, reason);
        CHANNEL_CONNECTIONS.with_label_values(&["closed"]).inc();
        events.send(ChannelEvent::Disconnected(reason)).await;
    }
}

async fn dispatch(body: &str, namespace: &str, events: &ChannelSender) -> Flow {
    let packet = match SocketPacket::decode(body) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("Ignoring malformed socket packet: {}", e);
            return Flow::Continue;
        }
    };
    if packet.namespace != namespace {
        return Flow::Continue;
    }

    match packet.kind {
        PacketKind::Event => {}
        PacketKind::Disconnect => {
            return Flow::Stop(Some("disconnected by server".to_string()));
        }
        PacketKind::ConnectError => {
            return Flow::Stop(Some("namespace refused".to_string()));
        }
        PacketKind::BinaryEvent | PacketKind::BinaryAck => {
            debug!("Skipping binary packet");
            return Flow::Continue;
        }
        PacketKind::Connect | PacketKind::Ack => return Flow::Continue,
    }

    let Some((name, args)) = packet.event() else {
        return Flow::Continue;
    };

    match name {
        "frame" => {
            let Some(payload) = args.first() else {
                return Flow::Continue;
            };
            let frame = match serde_json::from_value::<FrameEvent>(payload.clone()) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Ignoring malformed frame event: {}", e);
                    return Flow::Continue;
                }
            };
            if events.frame(frame) {
                Flow::Continue
            } else {
                Flow::Stop(None)
            }
        }
        "error" => {
            let message = args
                .first()
                .and_then(|v| serde_json::from_value::<ErrorPayload>(v.clone()).ok())
                .map(|p| p.message().to_string())
                .unwrap_or_else(|| "Stream error".to_string());
            if events.send(ChannelEvent::Error(message)).await {
                Flow::Continue
            } else {
                Flow::Stop(None)
            }
        }
        other => {
            debug!("Ignoring '{}' event", other);
            Flow::Continue
        }
    }
}
