//! socket.io wire protocol (engine.io v3 framing)
//!
//! Each websocket text frame is one engine.io packet: a single type digit
//! followed by its payload. Engine.io `message` packets (`4`) carry a
//! socket.io packet, again a type digit, an optional `/namespace,` and ack id,
//! then a JSON array `["event", payload]`.
//!
//! ```text
//! 0{"sid":"...","pingInterval":25000,...}   open
//! 2 / 3                                     ping / pong
//! 40                                        socket.io connect
//! 42["msg",{"type":"system/welcome",...}]   socket.io event
//! ```

use serde::{Deserialize, Serialize};
use toddler_core::{GatewayError, Result};

/// Engine.io ping frame
pub const PING: &str = "2";
/// Engine.io pong frame
pub const PONG: &str = "3";
/// socket.io event carrying game traffic
pub const GAME_EVENT: &str = "msg";

/// Handshake payload of the engine.io open packet
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
}

/// Decoded websocket frame
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Engine.io session opened
    Open(Handshake),
    /// Engine.io session closed by the server
    Close,
    /// Heartbeat request
    Ping(String),
    /// Heartbeat response
    Pong(String),
    /// socket.io namespace connected
    Connect,
    /// socket.io namespace disconnected
    Disconnect,
    /// socket.io event
    Event {
        name: String,
        payload: serde_json::Value,
    },
    /// socket.io error packet
    Error(serde_json::Value),
    /// Anything that needs no handling (noop, upgrade, acks)
    Noop,
}

/// Decode one text frame
pub fn decode(frame: &str) -> Result<Packet> {
    let mut chars = frame.chars();
    let kind = chars
        .next()
        .ok_or_else(|| GatewayError::ProtocolError("Empty engine.io frame".into()))?;
    let rest = chars.as_str();

    match kind {
        '0' => Ok(Packet::Open(serde_json::from_str(rest)?)),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping(rest.to_string())),
        '3' => Ok(Packet::Pong(rest.to_string())),
        '4' => decode_socket_packet(rest),
        '5' | '6' => Ok(Packet::Noop),
        other => Err(GatewayError::ProtocolError(format!(
            "Unknown engine.io packet type '{}'",
            other
        ))),
    }
}

fn decode_socket_packet(packet: &str) -> Result<Packet> {
    let mut chars = packet.chars();
    let kind = chars
        .next()
        .ok_or_else(|| GatewayError::ProtocolError("Empty socket.io packet".into()))?;
    let body = strip_ack_id(strip_namespace(chars.as_str()));

    match kind {
        '0' => Ok(Packet::Connect),
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let mut items: Vec<serde_json::Value> = serde_json::from_str(body)?;
            if items.is_empty() {
                return Err(GatewayError::ProtocolError("socket.io event without name".into()));
            }
            let name = match items.remove(0) {
                serde_json::Value::String(name) => name,
                other => {
                    return Err(GatewayError::ProtocolError(format!(
                        "socket.io event name is not a string: {}",
                        other
                    )));
                }
            };
            let payload = if items.is_empty() {
                serde_json::Value::Null
            } else {
                items.remove(0)
            };
            Ok(Packet::Event { name, payload })
        }
        '3' => Ok(Packet::Noop),
        '4' => {
            let payload = if body.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_str(body).unwrap_or_else(|_| serde_json::json!(body))
            };
            Ok(Packet::Error(payload))
        }
        other => Err(GatewayError::ProtocolError(format!(
            "Unknown socket.io packet type '{}'",
            other
        ))),
    }
}

fn strip_namespace(body: &str) -> &str {
    if !body.starts_with('/') {
        return body;
    }
    match body.find(',') {
        Some(idx) => &body[idx + 1..],
        None => "",
    }
}

fn strip_ack_id(body: &str) -> &str {
    body.trim_start_matches(|c: char| c.is_ascii_digit())
}

/// Encode a socket.io event frame: `42["name",payload]`
pub fn encode_event<T: Serialize>(name: &str, payload: &T) -> Result<String> {
    let body = serde_json::to_string(&(name, payload))?;
    Ok(format!("42{}", body))
}
