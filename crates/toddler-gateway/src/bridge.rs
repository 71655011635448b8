//! Bus bridge
//!
//! Connects the message bus once the game session is authenticated and
//! moves traffic both ways: bus requests go to the game (replies go back
//! carrying only the response `data`), unsolicited game messages are
//! published on the producer stream under their topic. Bus traffic that
//! arrives while the game is not ready waits in a bounded queue.

use crate::authenticator::{AuthenticationGateway, GatewayEvent};
use crate::bus::{BusAdapter, BusInbound, BusStream, RpcRequest};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use toddler_core::ProtocolMessage;
use tracing::{debug, error, info, warn};

/// Bridge settings
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Maximum number of queued bus messages; the oldest is dropped on overflow
    pub queue_capacity: usize,
    /// Queued messages older than this are dropped instead of forwarded
    pub queue_ttl: Duration,
    /// Subject announced on the producer stream once the bus is connected
    pub ready_subject: String,
    /// Game message types fired after every successful login
    pub ready_fire: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            queue_ttl: Duration::from_secs(30),
            ready_subject: "authenticator.ready".to_string(),
            ready_fire: Vec::new(),
        }
    }
}

struct Queued {
    inbound: BusInbound,
    received: Instant,
}

/// Moves traffic between the bus and an [`AuthenticationGateway`]
pub struct BusBridge {
    gateway: Arc<AuthenticationGateway>,
    bus: Arc<dyn BusAdapter>,
    config: BridgeConfig,
    queue: Mutex<VecDeque<Queued>>,
}

impl BusBridge {
    pub fn new(
        gateway: Arc<AuthenticationGateway>,
        bus: Arc<dyn BusAdapter>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            gateway,
            bus,
            config,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of bus messages waiting for the game
    pub fn queued(&self) -> usize {
        self.queue().len()
    }

    /// Close the bus connection
    pub async fn shutdown(&self) {
        self.bus.disconnect().await;
    }

    /// Subscribe to the gateway and run in the background
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let events = self.gateway.subscribe();
        tokio::spawn(self.clone().run(events))
    }

    /// Process gateway events and bus traffic until the gateway goes away
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<GatewayEvent>) {
        let mut inbound: Option<mpsc::Receiver<BusInbound>> = None;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_gateway_event(event, &mut inbound).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Bridge lagged, {} gateway events skipped", skipped)
                    }
                    Err(RecvError::Closed) => break,
                },

                received = next_inbound(&mut inbound) => match received {
                    Some(received) => self.handle_bus_inbound(received).await,
                    None => {
                        debug!("Bus inbound stream ended");
                        inbound = None;
                    }
                },
            }
        }

        if inbound.is_some() {
            self.bus.disconnect().await;
        }
        debug!("Bridge exiting");
    }

    async fn handle_gateway_event(
        self: &Arc<Self>,
        event: GatewayEvent,
        inbound: &mut Option<mpsc::Receiver<BusInbound>>,
    ) {
        match event {
            GatewayEvent::LoggedIn => {
                if inbound.is_none() {
                    match self.bus.connect().await {
                        Ok(rx) => {
                            *inbound = Some(rx);
                            self.announce_ready().await;
                        }
                        Err(e) => error!("Bus connection failed: {}", e),
                    }
                }
                for kind in &self.config.ready_fire {
                    let message = ProtocolMessage::new(kind.as_str(), Value::Null);
                    if let Err(e) = self.gateway.fire(message).await {
                        warn!("Failed to fire {}: {}", kind, e);
                    }
                }
                self.flush_queue().await;
            }
            GatewayEvent::LoggedOut => {
                if inbound.take().is_some() {
                    self.bus.disconnect().await;
                }
            }
            GatewayEvent::UnattachedMessage(message) => self.publish_notification(message).await,
            GatewayEvent::LoginFailed(e) => debug!("Bridge saw login failure: {}", e),
            GatewayEvent::LogoutFailed(e) => debug!("Bridge saw logout failure: {}", e),
        }
    }

    async fn announce_ready(&self) {
        let subject = &self.config.ready_subject;
        match self.bus.publish(subject, Value::Null).await {
            Ok(()) => info!("Ready for requests, announced on {}", subject),
            Err(e) => warn!("Failed to announce readiness: {}", e),
        }
    }

    async fn publish_notification(&self, message: ProtocolMessage) {
        if !self.bus.is_ready(BusStream::Producer) {
            debug!("Producer not ready, dropping {}", message.kind);
            return;
        }
        let topic = message.topic();
        if let Err(e) = self.bus.publish(&topic, message.data).await {
            warn!("Failed to publish {}: {}", topic, e);
        }
    }

    async fn handle_bus_inbound(self: &Arc<Self>, inbound: BusInbound) {
        if self.gateway.is_ready() {
            self.forward(inbound).await;
        } else {
            self.enqueue(inbound);
        }
    }

    async fn forward(self: &Arc<Self>, inbound: BusInbound) {
        match inbound {
            BusInbound::Rpc(request) => {
                let bridge = self.clone();
                tokio::spawn(async move { bridge.serve_request(request).await });
            }
            BusInbound::FireAndForget(message) => {
                let kind = message.kind.clone();
                if let Err(e) = self.gateway.fire(message).await {
                    warn!("Failed to forward {}: {}", kind, e);
                }
            }
        }
    }

    async fn serve_request(&self, request: RpcRequest) {
        let kind = request.message.kind.clone();
        match self.gateway.request(request.message).await {
            Ok(reply) => {
                if let Err(e) = self.bus.reply(&request.envelope, reply.data).await {
                    warn!("Failed to reply to {}: {}", kind, e);
                }
            }
            Err(e) => error!("Request {} failed: {}", kind, e),
        }
    }

    fn enqueue(&self, inbound: BusInbound) {
        let mut queue = self.queue();
        if queue.len() >= self.config.queue_capacity {
            if let Some(dropped) = queue.pop_front() {
                warn!("Bus queue full, dropping {}", inbound_kind(&dropped.inbound));
            }
        }
        debug!("Game not ready, queueing {}", inbound_kind(&inbound));
        queue.push_back(Queued {
            inbound,
            received: Instant::now(),
        });
    }

    async fn flush_queue(self: &Arc<Self>) {
        let queued: Vec<Queued> = self.queue().drain(..).collect();
        if queued.is_empty() {
            return;
        }
        info!("Forwarding {} queued bus messages", queued.len());

        for entry in queued {
            if entry.received.elapsed() > self.config.queue_ttl {
                warn!("Dropping expired {}", inbound_kind(&entry.inbound));
                continue;
            }
            self.forward(entry.inbound).await;
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Queued>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn next_inbound(inbound: &mut Option<mpsc::Receiver<BusInbound>>) -> Option<BusInbound> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn inbound_kind(inbound: &BusInbound) -> &str {
    match inbound {
        BusInbound::Rpc(request) => &request.message.kind,
        BusInbound::FireAndForget(message) => &message.kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authenticator::GatewayConfig;
    use crate::bus::{BusOutbound, MemoryBus, MemoryBusHandle};
    use serde_json::json;
    use toddler_channel::{Channel, ChannelConfig, ChannelEvent, MemoryServer, MemoryTransport};
    use toddler_core::{Credentials, types};

    struct Harness {
        gateway: Arc<AuthenticationGateway>,
        bridge: Arc<BusBridge>,
        server: MemoryServer,
        bus: MemoryBusHandle,
        channel_events: broadcast::Receiver<ChannelEvent>,
    }

    fn harness(gateway_config: GatewayConfig, bridge_config: BridgeConfig) -> Harness {
        let (transport, transport_events, server) = MemoryTransport::pair();
        let channel = Arc::new(Channel::new(transport, ChannelConfig::default()));
        channel.spawn(transport_events);
        let channel_events = channel.subscribe();

        let gateway = Arc::new(AuthenticationGateway::new(channel, gateway_config));
        gateway.spawn();

        let (bus, handle) = MemoryBus::pair();
        let bridge = Arc::new(BusBridge::new(gateway.clone(), bus, bridge_config));
        bridge.spawn();

        Harness {
            gateway,
            bridge,
            server,
            bus: handle,
            channel_events,
        }
    }

    async fn expect_game(server: &mut MemoryServer, kind: &str) -> ProtocolMessage {
        let message = tokio::time::timeout(Duration::from_secs(5), server.next_outbound())
            .await
            .expect("timed out waiting for game message")
            .expect("transport closed");
        assert!(message.is_type(kind), "expected {}, got {}", kind, message.kind);
        message
    }

    async fn expect_bus(bus: &mut MemoryBusHandle) -> BusOutbound {
        tokio::time::timeout(Duration::from_secs(5), bus.next_outbound())
            .await
            .expect("timed out waiting for bus output")
            .expect("bus closed")
    }

    async fn wait_for_channel(h: &mut Harness, expected: ChannelEvent) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), h.channel_events.recv())
                .await
                .expect("timed out waiting for channel event")
                .expect("channel closed");
            if event == expected {
                return;
            }
        }
    }

    async fn answer_handshake(server: &mut MemoryServer) {
        let login = expect_game(server, types::LOGIN).await;
        server.reply(&login, types::LOGIN_SUCCESS, json!({ "player_id": 42 }));
        let select = expect_game(server, types::SELECT_CHARACTER).await;
        server.reply(&select, types::CHARACTER_SELECTED, json!({}));
        expect_game(server, types::COMPLETE_LOGIN).await;
    }

    /// Log in and wait for the bridge to announce readiness
    async fn authenticate(h: &mut Harness) {
        let gateway = h.gateway.clone();
        let login = tokio::spawn(async move {
            gateway
                .login(Credentials::new("alice", "secret", "en1"))
                .await
        });
        wait_for_channel(h, ChannelEvent::Connected).await;
        h.server.welcome();
        answer_handshake(&mut h.server).await;
        login.await.unwrap().unwrap();

        assert_eq!(
            expect_bus(&mut h.bus).await,
            BusOutbound::Publish {
                topic: "authenticator.ready".into(),
                payload: Value::Null,
            }
        );
    }

    #[tokio::test]
    async fn test_bus_connects_after_login() {
        let mut h = harness(GatewayConfig::default(), BridgeConfig::default());
        assert!(!h.bus.is_connected());

        authenticate(&mut h).await;

        assert!(h.bus.is_connected());
        assert_eq!(h.bus.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_ready_fire_types_sent_after_login() {
        let config = BridgeConfig {
            ready_fire: vec!["Notification/enable".into()],
            ..Default::default()
        };
        let mut h = harness(GatewayConfig::default(), config);
        authenticate(&mut h).await;

        let fired = expect_game(&mut h.server, "Notification/enable").await;
        assert!(fired.data.is_null());
        assert!(serde_json::to_value(&fired).unwrap().get("data").is_none());
    }

    #[tokio::test]
    async fn test_rpc_reply_carries_data_only() {
        let mut h = harness(GatewayConfig::default(), BridgeConfig::default());
        authenticate(&mut h).await;

        h.bus
            .request("_INBOX.7", ProtocolMessage::new("Village/get", json!({ "village_id": 3 })))
            .await
            .unwrap();
        let request = expect_game(&mut h.server, "Village/get").await;
        assert_eq!(request.data, json!({ "village_id": 3 }));
        h.server
            .reply(&request, "Village/data", json!({ "name": "Home" }));

        assert_eq!(
            expect_bus(&mut h.bus).await,
            BusOutbound::Reply {
                reply_to: "_INBOX.7".into(),
                payload: json!({ "name": "Home" }),
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_complete_out_of_order() {
        let mut h = harness(GatewayConfig::default(), BridgeConfig::default());
        authenticate(&mut h).await;

        h.bus
            .request("_INBOX.a", ProtocolMessage::new("Village/get", json!({ "village_id": 1 })))
            .await
            .unwrap();
        h.bus
            .request("_INBOX.b", ProtocolMessage::new("Village/get", json!({ "village_id": 2 })))
            .await
            .unwrap();
        let first = expect_game(&mut h.server, "Village/get").await;
        let second = expect_game(&mut h.server, "Village/get").await;

        h.server.reply(&second, "Village/data", second.data.clone());
        h.server.reply(&first, "Village/data", first.data.clone());

        let replies = [expect_bus(&mut h.bus).await, expect_bus(&mut h.bus).await];
        for reply in replies {
            match reply {
                BusOutbound::Reply { reply_to, payload } if reply_to == "_INBOX.a" => {
                    assert_eq!(payload, json!({ "village_id": 1 }))
                }
                BusOutbound::Reply { reply_to, payload } if reply_to == "_INBOX.b" => {
                    assert_eq!(payload, json!({ "village_id": 2 }))
                }
                other => panic!("unexpected bus output {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_fire_and_forget_forwarded() {
        let mut h = harness(GatewayConfig::default(), BridgeConfig::default());
        authenticate(&mut h).await;

        h.bus
            .inject(BusInbound::FireAndForget(ProtocolMessage::new(
                "Chat/send",
                json!({ "text": "hi" }),
            )))
            .await
            .unwrap();

        let fired = expect_game(&mut h.server, "Chat/send").await;
        assert_eq!(fired.data, json!({ "text": "hi" }));
        assert!(h.bus.try_next_outbound().is_none());
    }

    #[tokio::test]
    async fn test_unsolicited_game_message_published() {
        let mut h = harness(GatewayConfig::default(), BridgeConfig::default());
        authenticate(&mut h).await;

        h.server.push(ProtocolMessage::new(
            "Village/resourcesChanged",
            json!({ "wood": 5 }),
        ));

        assert_eq!(
            expect_bus(&mut h.bus).await,
            BusOutbound::Publish {
                topic: "village.resourceschanged".into(),
                payload: json!({ "wood": 5 }),
            }
        );
    }

    #[tokio::test]
    async fn test_requests_queued_until_relogin() {
        let gateway_config = GatewayConfig {
            reconnect_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let mut h = harness(gateway_config, BridgeConfig::default());
        authenticate(&mut h).await;

        h.server.drop_connection();
        wait_for_channel(&mut h, ChannelEvent::Disconnected).await;
        while h.gateway.channel().is_connected() {
            tokio::task::yield_now().await;
        }

        h.bus
            .request("_INBOX.q", ProtocolMessage::new("Village/get", json!({ "village_id": 9 })))
            .await
            .unwrap();
        while h.bridge.queued() == 0 {
            tokio::task::yield_now().await;
        }

        wait_for_channel(&mut h, ChannelEvent::Connected).await;
        answer_handshake(&mut h.server).await;

        let request = expect_game(&mut h.server, "Village/get").await;
        assert_eq!(request.data, json!({ "village_id": 9 }));
        h.server.reply(&request, "Village/data", json!({ "ok": true }));

        // The bus stays up across the reconnect, so no second ready announcement
        assert_eq!(
            expect_bus(&mut h.bus).await,
            BusOutbound::Reply {
                reply_to: "_INBOX.q".into(),
                payload: json!({ "ok": true }),
            }
        );
        assert_eq!(h.bridge.queued(), 0);
        assert_eq!(h.bus.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_when_full() {
        let config = BridgeConfig {
            queue_capacity: 2,
            ..Default::default()
        };
        let h = harness(GatewayConfig::default(), config);

        for kind in ["A/one", "B/two", "C/three"] {
            h.bridge
                .handle_bus_inbound(BusInbound::FireAndForget(ProtocolMessage::new(
                    kind,
                    json!({}),
                )))
                .await;
        }

        let queue = h.bridge.queue();
        let kinds: Vec<&str> = queue.iter().map(|q| inbound_kind(&q.inbound)).collect();
        assert_eq!(kinds, vec!["B/two", "C/three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_messages_dropped_at_flush() {
        let config = BridgeConfig {
            queue_ttl: Duration::from_secs(30),
            ..Default::default()
        };
        let mut h = harness(GatewayConfig::default(), config);

        h.bridge
            .handle_bus_inbound(BusInbound::FireAndForget(ProtocolMessage::new(
                "Old/message",
                json!({}),
            )))
            .await;
        tokio::time::advance(Duration::from_secs(31)).await;
        h.bridge
            .handle_bus_inbound(BusInbound::FireAndForget(ProtocolMessage::new(
                "Fresh/message",
                json!({}),
            )))
            .await;
        assert_eq!(h.bridge.queued(), 2);

        authenticate(&mut h).await;

        expect_game(&mut h.server, "Fresh/message").await;
        assert!(h.server.try_next_outbound().is_none());
        assert_eq!(h.bridge.queued(), 0);
    }

    #[tokio::test]
    async fn test_logout_disconnects_bus() {
        let mut h = harness(GatewayConfig::default(), BridgeConfig::default());
        authenticate(&mut h).await;

        let gateway = h.gateway.clone();
        let logout = tokio::spawn(async move { gateway.logout().await });
        let request = expect_game(&mut h.server, types::LOGOUT).await;
        h.server.reply(&request, types::LOGOUT_SUCCESS, json!({}));
        logout.await.unwrap().unwrap();

        while h.bus.is_connected() {
            tokio::task::yield_now().await;
        }
        assert!(!h.gateway.is_authenticated());
    }
}
