//! Message bus abstraction
//!
//! The bus carries requests from internal services to the game and game
//! notifications back out. Three logical streams are distinguished: an RPC
//! server (request/reply), a consumer (fire-and-forget) and a producer
//! (notification publishing).

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use toddler_core::{GatewayError, ProtocolMessage, Result};

/// Logical bus stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusStream {
    RpcServer,
    Consumer,
    Producer,
}

/// Where the reply to a bus request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    pub reply_to: String,
}

/// Request received on the RPC stream
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub envelope: ReplyEnvelope,
    pub message: ProtocolMessage,
}

/// Inbound bus traffic
#[derive(Debug, Clone, PartialEq)]
pub enum BusInbound {
    /// Forward to the game and reply with the response data
    Rpc(RpcRequest),
    /// Forward to the game, no reply
    FireAndForget(ProtocolMessage),
}

/// Message bus connection
#[async_trait]
pub trait BusAdapter: Send + Sync + 'static {
    /// Connect all streams and start receiving
    async fn connect(&self) -> Result<mpsc::Receiver<BusInbound>>;

    /// Close all streams
    async fn disconnect(&self);

    /// Whether a stream is connected
    fn is_ready(&self, stream: BusStream) -> bool;

    /// Publish on the producer stream
    async fn publish(&self, topic: &str, payload: Value) -> Result<()>;

    /// Answer an RPC request
    async fn reply(&self, envelope: &ReplyEnvelope, payload: Value) -> Result<()>;
}

/// Something the bridge sent out on a [`MemoryBus`]
#[derive(Debug, Clone, PartialEq)]
pub enum BusOutbound {
    Publish { topic: String, payload: Value },
    Reply { reply_to: String, payload: Value },
}

struct MemoryBusState {
    inbound: Option<mpsc::Sender<BusInbound>>,
    connects: usize,
}

/// In-process bus
pub struct MemoryBus {
    state: Mutex<MemoryBusState>,
    outbound_tx: mpsc::UnboundedSender<BusOutbound>,
    capacity: usize,
}

/// Test side of a [`MemoryBus`]: injects requests, observes output
pub struct MemoryBusHandle {
    bus: Arc<MemoryBus>,
    outbound_rx: mpsc::UnboundedReceiver<BusOutbound>,
}

impl MemoryBus {
    pub fn pair() -> (Arc<MemoryBus>, MemoryBusHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(Self {
            state: Mutex::new(MemoryBusState {
                inbound: None,
                connects: 0,
            }),
            outbound_tx,
            capacity: 64,
        });
        let handle = MemoryBusHandle {
            bus: bus.clone(),
            outbound_rx,
        };
        (bus, handle)
    }

    fn state(&self) -> MutexGuard<'_, MemoryBusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_connected(&self) -> bool {
        self.state().inbound.is_some()
    }

    fn emit(&self, outbound: BusOutbound) -> Result<()> {
        if !self.is_connected() {
            return Err(GatewayError::Bus("bus not connected".into()));
        }
        self.outbound_tx
            .send(outbound)
            .map_err(|_| GatewayError::Bus("bus handle dropped".into()))
    }
}

#[async_trait]
impl BusAdapter for MemoryBus {
    async fn connect(&self) -> Result<mpsc::Receiver<BusInbound>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut state = self.state();
        state.inbound = Some(tx);
        state.connects += 1;
        Ok(rx)
    }

    async fn disconnect(&self) {
        self.state().inbound = None;
    }

    fn is_ready(&self, _stream: BusStream) -> bool {
        self.is_connected()
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        self.emit(BusOutbound::Publish {
            topic: topic.to_string(),
            payload,
        })
    }

    async fn reply(&self, envelope: &ReplyEnvelope, payload: Value) -> Result<()> {
        self.emit(BusOutbound::Reply {
            reply_to: envelope.reply_to.clone(),
            payload,
        })
    }
}

impl MemoryBusHandle {
    /// Deliver inbound traffic to the connected bridge
    pub async fn inject(&self, inbound: BusInbound) -> Result<()> {
        let sender = self
            .bus
            .state()
            .inbound
            .clone()
            .ok_or_else(|| GatewayError::Bus("bus not connected".into()))?;
        sender
            .send(inbound)
            .await
            .map_err(|_| GatewayError::Bus("bridge stopped receiving".into()))
    }

    /// Inject an RPC request answered on `reply_to`
    pub async fn request(&self, reply_to: &str, message: ProtocolMessage) -> Result<()> {
        self.inject(BusInbound::Rpc(RpcRequest {
            envelope: ReplyEnvelope {
                reply_to: reply_to.to_string(),
            },
            message,
        }))
        .await
    }

    /// Next publish or reply
    pub async fn next_outbound(&mut self) -> Option<BusOutbound> {
        self.outbound_rx.recv().await
    }

    pub fn try_next_outbound(&mut self) -> Option<BusOutbound> {
        self.outbound_rx.try_recv().ok()
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_connected()
    }

    pub fn connect_count(&self) -> usize {
        self.bus.state().connects
    }
}
