//! Transport abstraction for the game connection
//!
//! A transport owns the physical connection to the game server. It reports
//! connection changes and inbound messages on an unbounded event channel that
//! the [`Channel`](crate::Channel) drains, and accepts outbound messages that
//! already carry their identifier.

use async_trait::async_trait;
use tokio::sync::mpsc;
use toddler_core::{ProtocolMessage, Result};

/// Log target for raw game traffic
pub const SOCKET_TARGET: &str = "toddler::socket";

/// Events raised by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The game server accepted the connection
    Connected,
    /// The connection closed or failed
    Disconnected,
    /// A message arrived from the game server
    Message(ProtocolMessage),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the event channel a transport reports on
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Connection to the game server
///
/// `connect` must be safe to call repeatedly; the authenticator calls it again
/// after every disconnect.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the connection. Completion of the game-level handshake is reported
    /// later through [`TransportEvent::Connected`].
    async fn connect(&self) -> Result<()>;

    /// Close the connection
    async fn close(&self);

    /// Whether the game connection is established
    fn is_connected(&self) -> bool;

    /// Transmit a message
    async fn send(&self, message: &ProtocolMessage) -> Result<()>;
}
