//! socket.io transport over websocket
//!
//! Connects to the game's socket.io endpoint (engine.io protocol 3, websocket
//! transport only). All game traffic travels on the `msg` event.

use crate::protocol::{self, GAME_EVENT, Packet};
use crate::transport::{EventSender, SOCKET_TARGET, Transport, TransportEvent};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use toddler_core::{GatewayError, ProtocolMessage, Result};
use tracing::{debug, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsReader = SplitStream<WsStream>;
type WsWriter = SplitSink<WsStream, Message>;

/// Shortest heartbeat period accepted from config or handshake
const MIN_PING_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for the socket.io transport
#[derive(Debug, Clone)]
pub struct SocketIoConfig {
    /// Game server base URL (http(s) or ws(s))
    pub url: String,
    /// Extra query string sent with the handshake
    pub query: String,
    /// Heartbeat interval used until the server announces its own
    pub ping_interval: Duration,
}

impl Default for SocketIoConfig {
    fn default() -> Self {
        Self {
            url: "https://en.tribalwars2.com/".to_string(),
            query: "platform=desktop".to_string(),
            ping_interval: Duration::from_secs(25),
        }
    }
}

impl SocketIoConfig {
    /// Create config for a game server URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Full websocket endpoint of the socket.io server
    pub fn endpoint(&self) -> String {
        let base = if let Some(rest) = self.url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.url.clone()
        };
        let base = base.trim_end_matches('/');

        let mut endpoint = format!("{}/socket.io/?", base);
        if !self.query.is_empty() {
            endpoint.push_str(&self.query);
            endpoint.push('&');
        }
        endpoint.push_str("EIO=3&transport=websocket");
        endpoint
    }
}

/// Live websocket link
struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    tasks: Vec<JoinHandle<()>>,
}

/// socket.io client transport
pub struct SocketIoTransport {
    config: SocketIoConfig,
    events: EventSender,
    /// socket.io namespace connected
    connected: Arc<AtomicBool>,
    /// websocket open (handshake may still be pending)
    open: Arc<AtomicBool>,
    link: Mutex<Option<Link>>,
}

impl SocketIoTransport {
    /// Create a transport reporting on `events` (not connected yet)
    pub fn new(config: SocketIoConfig, events: EventSender) -> Self {
        Self {
            config,
            events,
            connected: Arc::new(AtomicBool::new(false)),
            open: Arc::new(AtomicBool::new(false)),
            link: Mutex::new(None),
        }
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<Message>> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|link| link.outbound.clone())
    }
}

#[async_trait]
impl Transport for SocketIoTransport {
    async fn connect(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            debug!("Socket already open");
            return Ok(());
        }

        let endpoint = self.config.endpoint();
        info!("Connecting to game socket at {}", endpoint);

        let (stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| GatewayError::Connection(format!("websocket connect failed: {}", e)))?;
        let (writer, reader) = stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        self.open.store(true, Ordering::SeqCst);

        let writer_task = tokio::spawn(write_loop(writer, outbound_rx));
        let reader_task = tokio::spawn(read_loop(
            reader,
            outbound.clone(),
            self.events.clone(),
            self.connected.clone(),
            self.open.clone(),
            self.config.ping_interval,
        ));

        let previous = self
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Link {
                outbound,
                tasks: vec![writer_task, reader_task],
            });
        if let Some(previous) = previous {
            for task in previous.tasks {
                task.abort();
            }
        }

        Ok(())
    }

    async fn close(&self) {
        if let Some(outbound) = self.outbound() {
            info!("Closing game socket");
            let _ = outbound.send(Message::Close(None));
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: &ProtocolMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(GatewayError::Connection("socket not connected".into()));
        }
        let outbound = self
            .outbound()
            .ok_or_else(|| GatewayError::Connection("socket not connected".into()))?;

        let frame = protocol::encode_event(GAME_EVENT, message)?;
        debug!(target: SOCKET_TARGET, "[Rust→Game] {}", frame);

        outbound
            .send(Message::Text(frame.into()))
            .map_err(|_| GatewayError::Connection("socket writer stopped".into()))
    }
}

async fn write_loop(mut writer: WsWriter, mut outbound_rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = outbound_rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = writer.send(message).await {
            warn!("Socket write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = writer.close().await;
    debug!("Socket writer exiting");
}

async fn read_loop(
    mut reader: WsReader,
    outbound: mpsc::UnboundedSender<Message>,
    events: EventSender,
    connected: Arc<AtomicBool>,
    open: Arc<AtomicBool>,
    ping_interval: Duration,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_period(0, ping_interval));
    heartbeat.reset();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                trace!(target: SOCKET_TARGET, "ping");
                if outbound.send(Message::Text(protocol::PING.into())).is_err() {
                    break;
                }
            }

            frame = reader.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Socket closed by server");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Socket read failed: {}", e);
                        break;
                    }
                };

                debug!(target: SOCKET_TARGET, "[Game→Rust] {}", text.as_str());

                let packet = match protocol::decode(text.as_str()) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("Dropping undecodable frame: {}", e);
                        continue;
                    }
                };

                match packet {
                    Packet::Open(handshake) => {
                        debug!("Engine.io session {} opened", handshake.sid);
                        heartbeat = tokio::time::interval(heartbeat_period(handshake.ping_interval, ping_interval));
                        heartbeat.reset();
                    }
                    Packet::Ping(probe) => {
                        let pong = format!("{}{}", protocol::PONG, probe);
                        if outbound.send(Message::Text(pong.into())).is_err() {
                            break;
                        }
                    }
                    Packet::Pong(_) => trace!(target: SOCKET_TARGET, "pong"),
                    Packet::Connect => {
                        connected.store(true, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Connected);
                    }
                    Packet::Close | Packet::Disconnect => {
                        debug!("Server ended the session");
                        break;
                    }
                    Packet::Event { name, payload } if name == GAME_EVENT => {
                        match serde_json::from_value::<ProtocolMessage>(payload) {
                            Ok(message) => {
                                let _ = events.send(TransportEvent::Message(message));
                            }
                            Err(e) => warn!("Dropping malformed game message: {}", e),
                        }
                    }
                    Packet::Event { name, .. } => debug!("Ignoring socket.io event {}", name),
                    Packet::Error(payload) => warn!("socket.io error: {}", payload),
                    Packet::Noop => {}
                }
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    connected.store(false, Ordering::SeqCst);
    let _ = outbound.send(Message::Close(None));
    let _ = events.send(TransportEvent::Disconnected);
}

/// Server-announced interval in milliseconds, or the configured one when absent
fn heartbeat_period(announced_ms: u64, configured: Duration) -> Duration {
    let period = if announced_ms == 0 {
        configured
    } else {
        Duration::from_millis(announced_ms)
    };
    period.max(MIN_PING_INTERVAL)
}
