//! Game connection for the toddler authenticator
//!
//! This crate provides:
//! - `Channel`: request/reply correlation over one persistent connection
//! - Transport abstraction (`Transport` trait and `TransportEvent`)
//! - socket.io over websocket transport for the game server
//! - In-memory transport for tests and embedding

pub mod channel;
pub mod memory;
pub mod protocol;
pub mod transport;
pub mod websocket;

pub use channel::{Channel, ChannelConfig, ChannelEvent, PendingReply};
pub use memory::{MemoryServer, MemoryTransport};
pub use transport::{EventReceiver, EventSender, SOCKET_TARGET, Transport, TransportEvent, event_channel};
pub use websocket::{SocketIoConfig, SocketIoTransport};
