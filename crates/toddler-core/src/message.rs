//! Game protocol messages
//!
//! Every message exchanged with the game server has the same shape:
//! `{"type": "Domain/action", "data": {...}, "id": 7, "headers": {"traveltimes": [...]}}`.
//! The `type` is compared case-insensitively; outbound types are sent as authored.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Message types the authenticator itself understands
pub mod types {
    pub const WELCOME: &str = "system/welcome";
    pub const ERROR: &str = "system/error";
    pub const LOGIN: &str = "Authentication/login";
    pub const LOGIN_SUCCESS: &str = "login/success";
    pub const SELECT_CHARACTER: &str = "Authentication/selectCharacter";
    pub const CHARACTER_SELECTED: &str = "authentication/characterselected";
    pub const COMPLETE_LOGIN: &str = "Authentication/completeLogin";
    pub const LOGOUT: &str = "Authentication/logout";
    pub const LOGOUT_SUCCESS: &str = "logout/success";
}

/// Traveltime label stamped on every outbound message
pub const SEND_STAMP: &str = "browser_send";

/// Message headers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    /// `[label, epoch-ms]` pairs
    #[serde(default)]
    pub traveltimes: Vec<(String, serde_json::Value)>,
}

/// A message on the game connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    #[serde(rename = "type")]
    pub kind: String,
    /// Omitted on the wire when null
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

impl ProtocolMessage {
    /// Create an outbound message without an identifier
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            id: None,
            headers: None,
        }
    }

    /// Case-insensitive type comparison
    pub fn is_type(&self, kind: &str) -> bool {
        self.kind.eq_ignore_ascii_case(kind)
    }

    /// Assign the identifier and stamp the send time
    pub fn stamp(&mut self, id: u64) {
        self.id = Some(id);
        self.headers = Some(Headers {
            traveltimes: vec![(SEND_STAMP.to_string(), serde_json::json!(epoch_millis()))],
        });
    }

    /// Bus topic this message is published under
    pub fn topic(&self) -> String {
        topic_for(&self.kind)
    }

    /// String field from `data`, if present
    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(|v| v.as_str())
    }
}

/// Bus topic for a message type: lower-cased, domain separator replaced by `.`
pub fn topic_for(kind: &str) -> String {
    kind.to_lowercase().replacen('/', ".", 1)
}

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_is_case_insensitive() {
        let msg = ProtocolMessage::new("Login/Success", serde_json::json!({}));
        assert!(msg.is_type(types::LOGIN_SUCCESS));
        assert!(!msg.is_type(types::LOGOUT_SUCCESS));
    }

    #[test]
    fn test_topic_naming() {
        assert_eq!(topic_for("Village/getBuildingQueue"), "village.getbuildingqueue");
        assert_eq!(topic_for("Map/villages/nearby"), "map.villages/nearby");
        assert_eq!(topic_for("noseparator"), "noseparator");
    }

    #[test]
    fn test_stamp_sets_id_and_traveltime() {
        let mut msg = ProtocolMessage::new(types::LOGIN, serde_json::json!({"name": "alice"}));
        msg.stamp(12);

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "Authentication/login");
        assert_eq!(json["id"], 12);
        assert_eq!(json["headers"]["traveltimes"][0][0], SEND_STAMP);
        assert!(json["headers"]["traveltimes"][0][1].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_null_data_omitted_on_the_wire() {
        let msg = ProtocolMessage::new("Notification/enable", serde_json::Value::Null);
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded, serde_json::json!({ "type": "Notification/enable" }));
    }

    #[test]
    fn test_inbound_without_id_or_data() {
        let msg: ProtocolMessage = serde_json::from_str(r#"{"type": "System/Welcome"}"#).unwrap();
        assert!(msg.is_type(types::WELCOME));
        assert_eq!(msg.id, None);
        assert!(msg.data.is_null());
    }

    #[test]
    fn test_data_str() {
        let msg: ProtocolMessage = serde_json::from_str(
            r#"{"type": "system/error", "data": {"cause": "AuthenticationFailed", "message": "bad password"}, "id": 3}"#,
        )
        .unwrap();
        assert_eq!(msg.data_str("cause"), Some("AuthenticationFailed"));
        assert_eq!(msg.data_str("missing"), None);
        assert_eq!(msg.id, Some(3));
    }
}
