//! In-process transport
//!
//! `MemoryTransport` plays the client side; the paired [`MemoryServer`] plays
//! the game server: it sees every outbound message and injects inbound
//! traffic and connection changes.

use crate::transport::{EventReceiver, EventSender, Transport, TransportEvent, event_channel};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use toddler_core::{GatewayError, ProtocolMessage, Result, types};

/// Client half of an in-process game connection
pub struct MemoryTransport {
    connected: AtomicBool,
    refuse: AtomicBool,
    connects: AtomicUsize,
    outbound_tx: mpsc::UnboundedSender<ProtocolMessage>,
    events: EventSender,
}

/// Server half of an in-process game connection
pub struct MemoryServer {
    transport: Arc<MemoryTransport>,
    outbound_rx: mpsc::UnboundedReceiver<ProtocolMessage>,
}

impl MemoryTransport {
    /// Create a transport, the receiver its events arrive on, and its server half
    pub fn pair() -> (Arc<MemoryTransport>, EventReceiver, MemoryServer) {
        let (events, events_rx) = event_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            connected: AtomicBool::new(false),
            refuse: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            outbound_tx,
            events,
        });
        let server = MemoryServer {
            transport: transport.clone(),
            outbound_rx,
        };
        (transport, events_rx, server)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection("connection refused".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: &ProtocolMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(GatewayError::Connection("not connected".into()));
        }
        self.outbound_tx
            .send(message.clone())
            .map_err(|_| GatewayError::Connection("server half dropped".into()))
    }
}

impl MemoryServer {
    /// Next message the client sent
    pub async fn next_outbound(&mut self) -> Option<ProtocolMessage> {
        self.outbound_rx.recv().await
    }

    /// Next message the client sent, if one is already queued
    pub fn try_next_outbound(&mut self) -> Option<ProtocolMessage> {
        self.outbound_rx.try_recv().ok()
    }

    /// Deliver a message to the client
    pub fn push(&self, message: ProtocolMessage) {
        let _ = self.transport.events.send(TransportEvent::Message(message));
    }

    /// Deliver a reply correlated with `request`
    pub fn reply(&self, request: &ProtocolMessage, kind: &str, data: serde_json::Value) {
        let mut message = ProtocolMessage::new(kind, data);
        message.id = request.id;
        self.push(message);
    }

    /// Send the welcome message a fresh game connection starts with
    pub fn welcome(&self) {
        self.push(ProtocolMessage::new(types::WELCOME, serde_json::json!({})));
    }

    /// Drop the connection from the server side
    pub fn drop_connection(&self) {
        if self.transport.connected.swap(false, Ordering::SeqCst) {
            let _ = self.transport.events.send(TransportEvent::Disconnected);
        }
    }

    /// Make subsequent connection attempts fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.transport.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connection attempts so far
    pub fn connect_count(&self) -> usize {
        self.transport.connects.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_reports_event() {
        let (transport, mut events, server) = MemoryTransport::pair();

        transport.connect().await.unwrap();

        assert!(transport.is_connected());
        assert_eq!(server.connect_count(), 1);
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let (transport, mut events, server) = MemoryTransport::pair();
        server.refuse_connections(true);

        let err = transport.connect().await.unwrap_err();

        assert!(err.is_connection());
        assert!(!transport.is_connected());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (transport, _events, mut server) = MemoryTransport::pair();
        let msg = ProtocolMessage::new("Village/get", serde_json::json!({}));

        assert!(transport.send(&msg).await.is_err());

        transport.connect().await.unwrap();
        transport.send(&msg).await.unwrap();
        assert_eq!(server.next_outbound().await, Some(msg));
    }

    #[tokio::test]
    async fn test_drop_connection_reports_once() {
        let (transport, mut events, server) = MemoryTransport::pair();
        transport.connect().await.unwrap();
        let _ = events.recv().await;

        server.drop_connection();
        server.drop_connection();
        transport.close().await;

        assert_eq!(events.recv().await, Some(TransportEvent::Disconnected));
        assert!(events.try_recv().is_err());
    }
}
