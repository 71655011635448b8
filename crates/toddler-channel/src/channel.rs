//! Request/reply multiplexing over the game connection
//!
//! The channel assigns every outbound message an identifier, remembers the
//! ones that expect a reply, and matches inbound messages against them.
//! Inbound messages that match nothing are unsolicited traffic and are
//! re-emitted as [`ChannelEvent::MessageReceived`].

use crate::transport::{EventReceiver, SOCKET_TARGET, Transport, TransportEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use toddler_core::{GatewayError, ProtocolMessage, Result};
use tracing::{debug, info, warn};

/// Channel settings
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Deadline for correlated requests; `None` waits forever
    pub request_timeout: Option<Duration>,
    /// Capacity of the event broadcast
    pub event_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(30)),
            event_capacity: 256,
        }
    }
}

/// Connection and traffic events observed by the channel's users
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    /// Inbound message that matched no pending request
    MessageReceived(ProtocolMessage),
}

type ReplySender = oneshot::Sender<Result<ProtocolMessage>>;

struct PendingRequest {
    message: ProtocolMessage,
    reply_tx: ReplySender,
}

/// Identifier counter and the requests waiting for a reply
struct Correlation {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
}

impl Correlation {
    fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = id.checked_add(1).unwrap_or(1);
        id
    }

    /// Stay ahead of identifiers seen from the server
    fn observe(&mut self, id: u64) {
        match id.checked_add(1) {
            Some(next) => self.next_id = self.next_id.max(next),
            None => self.next_id = 1,
        }
    }
}

/// A registered request awaiting its reply
pub struct PendingReply {
    id: u64,
    reply_rx: oneshot::Receiver<Result<ProtocolMessage>>,
    deadline: Option<Instant>,
    correlation: Arc<Mutex<Correlation>>,
}

impl PendingReply {
    /// Identifier the request was sent with
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the reply, the request deadline, or a disconnect
    pub async fn wait(self) -> Result<ProtocolMessage> {
        let PendingReply {
            id,
            reply_rx,
            deadline,
            correlation,
        } = self;

        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, reply_rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    lock(&correlation).pending.remove(&id);
                    warn!("Request {} timed out", id);
                    return Err(GatewayError::Timeout { id });
                }
            },
            None => reply_rx.await,
        };

        outcome.map_err(|_| GatewayError::ConnectionLost)?
    }
}

/// Multiplexed request/reply channel to the game server
pub struct Channel {
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    correlation: Arc<Mutex<Correlation>>,
    event_tx: broadcast::Sender<ChannelEvent>,
}

fn lock(correlation: &Mutex<Correlation>) -> MutexGuard<'_, Correlation> {
    correlation.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Channel {
    /// Create a channel over a transport
    pub fn new(transport: Arc<dyn Transport>, config: ChannelConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity);
        Self {
            transport,
            config,
            correlation: Arc::new(Mutex::new(Correlation::new())),
            event_tx,
        }
    }

    /// Subscribe to connection and unsolicited-message events
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.event_tx.subscribe()
    }

    /// Open the connection unless it is already open
    pub async fn connect(&self) -> Result<()> {
        if self.transport.is_connected() {
            debug!("Channel already connected");
            return Ok(());
        }
        self.transport.connect().await
    }

    /// Close the connection
    pub async fn close(&self) {
        self.transport.close().await;
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Number of requests waiting for a reply
    pub fn pending_count(&self) -> usize {
        lock(&self.correlation).pending.len()
    }

    /// Send a message that expects no reply
    pub async fn fire(&self, mut message: ProtocolMessage) -> Result<u64> {
        let id = lock(&self.correlation).allocate();
        message.stamp(id);

        debug!(target: SOCKET_TARGET, id, kind = %message.kind, "fire");
        self.transport.send(&message).await?;
        Ok(id)
    }

    /// Register and transmit a request, returning a handle to its reply
    pub async fn submit(&self, mut message: ProtocolMessage) -> Result<PendingReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = {
            let mut correlation = lock(&self.correlation);
            let id = correlation.allocate();
            message.stamp(id);
            correlation.pending.insert(
                id,
                PendingRequest {
                    message: message.clone(),
                    reply_tx,
                },
            );
            id
        };

        debug!(target: SOCKET_TARGET, id, kind = %message.kind, "request");
        if let Err(e) = self.transport.send(&message).await {
            lock(&self.correlation).pending.remove(&id);
            return Err(e);
        }

        Ok(PendingReply {
            id,
            reply_rx,
            deadline: self.config.request_timeout.map(|t| Instant::now() + t),
            correlation: self.correlation.clone(),
        })
    }

    /// Send a request and wait for its reply
    pub async fn request(&self, message: ProtocolMessage) -> Result<ProtocolMessage> {
        self.submit(message).await?.wait().await
    }

    /// Apply one transport event
    pub fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                info!("Socket connected");
                let _ = self.event_tx.send(ChannelEvent::Connected);
            }
            TransportEvent::Disconnected => {
                info!("Socket disconnected");
                let abandoned: Vec<(u64, PendingRequest)> =
                    lock(&self.correlation).pending.drain().collect();
                if !abandoned.is_empty() {
                    warn!("Rejecting {} outstanding requests", abandoned.len());
                }
                for (id, pending) in abandoned {
                    debug!(id, kind = %pending.message.kind, "request abandoned");
                    let _ = pending.reply_tx.send(Err(GatewayError::ConnectionLost));
                }
                let _ = self.event_tx.send(ChannelEvent::Disconnected);
            }
            TransportEvent::Message(message) => self.dispatch(message),
        }
    }

    fn dispatch(&self, message: ProtocolMessage) {
        debug!(target: SOCKET_TARGET, id = ?message.id, kind = %message.kind, "inbound");

        let matched = message.id.and_then(|id| {
            let mut correlation = lock(&self.correlation);
            correlation.observe(id);
            correlation.pending.remove(&id)
        });

        match matched {
            Some(pending) => {
                debug!(
                    "Reply {} for {} matched",
                    message.kind, pending.message.kind
                );
                let _ = pending.reply_tx.send(Ok(message));
            }
            None => {
                debug!("Unsolicited message {}", message.kind);
                let _ = self.event_tx.send(ChannelEvent::MessageReceived(message));
            }
        }
    }

    /// Drain transport events until the transport goes away
    pub async fn run(self: Arc<Self>, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            self.handle_transport_event(event);
        }
        debug!("Transport event channel closed, channel task exiting");
    }

    /// Spawn [`Channel::run`] on the runtime
    pub fn spawn(self: &Arc<Self>, events: EventReceiver) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(events))
    }
}
