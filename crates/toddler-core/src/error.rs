//! Error types for the authenticator

use thiserror::Error;

/// Result type for authenticator operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Authenticator error types
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// Transport unavailable or not connected
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection dropped while a request was outstanding
    #[error("Connection lost before reply")]
    ConnectionLost,

    /// Username, password or world id missing
    #[error("Credential error: {0}")]
    Credential(String),

    /// Unexpected reply during a handshake step
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Login rejected by the game server
    #[error("Login failed: {0}")]
    LoginFailed(String),

    /// Operation requires an authenticated session
    #[error("Authentication required")]
    NotAuthenticated,

    /// A login attempt is already outstanding
    #[error("Login already in progress")]
    LoginPending,

    /// No reply arrived before the request deadline
    #[error("Request {id} timed out")]
    Timeout { id: u64 },

    /// Message bus failure
    #[error("Bus error: {0}")]
    Bus(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Whether the error came from the transport rather than the game
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            GatewayError::Connection(_) | GatewayError::ConnectionLost | GatewayError::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::SerializationError(err.to_string())
    }
}
