//! # toddler-core
//!
//! Core types shared by the toddler game authenticator crates.
//!
//! - Game protocol messages and the message types the authenticator handles
//! - Credentials
//! - Error taxonomy

pub mod credentials;
pub mod error;
pub mod message;

pub use credentials::Credentials;
pub use error::{GatewayError, Result};
pub use message::{Headers, ProtocolMessage, topic_for, types};
