//! # toddler-gateway
//!
//! Authentication gateway for the game connection.
//!
//! This crate provides:
//! - `AuthenticationGateway`: the login/logout state machine and traffic gate
//! - `BusAdapter` trait with NATS and in-memory implementations
//! - `BusBridge`: forwards bus traffic to the game and publishes notifications
//! - `GatewayContext`: wires channel, gateway and bridge together

pub mod authenticator;
pub mod bridge;
pub mod bus;
pub mod nats;
pub mod state;

pub use authenticator::{AuthenticationGateway, GatewayConfig, GatewayEvent};
pub use bridge::{BridgeConfig, BusBridge};
pub use bus::{
    BusAdapter, BusInbound, BusOutbound, BusStream, MemoryBus, MemoryBusHandle, ReplyEnvelope,
    RpcRequest,
};
pub use nats::{NatsBus, NatsBusConfig};
pub use state::{AuthPhase, AuthState, RestPolicy};

use std::sync::Arc;
use tokio::task::JoinHandle;
use toddler_channel::{Channel, ChannelConfig, EventReceiver, Transport};
use toddler_core::Result;
use tracing::info;

/// Settings for a full gateway stack
#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    pub channel: ChannelConfig,
    pub gateway: GatewayConfig,
    pub bridge: BridgeConfig,
}

/// One game connection with its authenticator and optional bus bridge
pub struct GatewayContext {
    channel: Arc<Channel>,
    gateway: Arc<AuthenticationGateway>,
    bridge: Option<Arc<BusBridge>>,
    bridge_config: BridgeConfig,
    tasks: Vec<JoinHandle<()>>,
}

impl GatewayContext {
    /// Build the stack over a transport (nothing runs until [`start`](Self::start))
    pub fn new(transport: Arc<dyn Transport>, config: ContextConfig) -> Self {
        let channel = Arc::new(Channel::new(transport, config.channel));
        let gateway = Arc::new(AuthenticationGateway::new(channel.clone(), config.gateway));
        Self {
            channel,
            gateway,
            bridge: None,
            bridge_config: config.bridge,
            tasks: Vec::new(),
        }
    }

    /// Attach a message bus
    pub fn with_bus(mut self, bus: Arc<dyn BusAdapter>) -> Self {
        self.bridge = Some(Arc::new(BusBridge::new(
            self.gateway.clone(),
            bus,
            self.bridge_config.clone(),
        )));
        self
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn gateway(&self) -> &Arc<AuthenticationGateway> {
        &self.gateway
    }

    pub fn bridge(&self) -> Option<&Arc<BusBridge>> {
        self.bridge.as_ref()
    }

    /// Spawn the channel pump, the authenticator and the bridge
    pub fn start(&mut self, transport_events: EventReceiver) {
        if let Some(bridge) = &self.bridge {
            self.tasks.push(bridge.spawn());
        }
        self.tasks.push(self.gateway.spawn());
        self.tasks.push(self.channel.spawn(transport_events));
    }

    /// Close the bus, log out and drop the game connection
    ///
    /// Returns the logout outcome; logging out without a session is an error.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down");
        if let Some(bridge) = &self.bridge {
            bridge.shutdown().await;
        }
        let result = self.gateway.logout().await;
        self.channel.close().await;
        for task in &self.tasks {
            task.abort();
        }
        result
    }
}
