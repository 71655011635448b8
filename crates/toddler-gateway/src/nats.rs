//! NATS bus adapter
//!
//! One client per logical stream. Requests arrive on one subject per
//! configured message type (`village.get` for `Village/get`) and are only
//! served when they carry a reply subject; fire-and-forget messages arrive
//! on a single subject.

use crate::bus::{BusAdapter, BusInbound, BusStream, ReplyEnvelope, RpcRequest};
use async_nats::connection::State;
use async_nats::{Client, Subscriber};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use toddler_core::{GatewayError, ProtocolMessage, Result, topic_for};
use tracing::{debug, info, warn};

/// NATS connection settings
#[derive(Debug, Clone)]
pub struct NatsBusConfig {
    pub rpc_uri: String,
    pub consumer_uri: String,
    pub producer_uri: String,
    /// Subjects served as request/reply
    pub rpc_subjects: Vec<String>,
    /// Subject carrying fire-and-forget messages for the game
    pub fire_subject: String,
    /// Capacity of the inbound queue handed to the bridge
    pub inbound_capacity: usize,
}

impl NatsBusConfig {
    /// All streams on one server
    pub fn new(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        Self {
            rpc_uri: uri.clone(),
            consumer_uri: uri.clone(),
            producer_uri: uri,
            rpc_subjects: Vec::new(),
            fire_subject: "authenticator.to.game".to_string(),
            inbound_capacity: 256,
        }
    }

    /// Serve request/reply for these game message types
    pub fn with_rpc_types<S: AsRef<str>>(mut self, types: &[S]) -> Self {
        self.rpc_subjects = types.iter().map(|t| topic_for(t.as_ref())).collect();
        self
    }
}

struct Clients {
    rpc: Client,
    consumer: Client,
    producer: Client,
    tasks: Vec<JoinHandle<()>>,
}

impl Clients {
    fn client(&self, stream: BusStream) -> &Client {
        match stream {
            BusStream::RpcServer => &self.rpc,
            BusStream::Consumer => &self.consumer,
            BusStream::Producer => &self.producer,
        }
    }
}

/// NATS implementation of [`BusAdapter`]
pub struct NatsBus {
    config: NatsBusConfig,
    clients: Mutex<Option<Clients>>,
}

impl NatsBus {
    pub fn new(config: NatsBusConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(None),
        }
    }

    fn clients(&self) -> MutexGuard<'_, Option<Clients>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self, stream: BusStream) -> Result<Client> {
        self.clients()
            .as_ref()
            .map(|clients| clients.client(stream).clone())
            .ok_or_else(|| GatewayError::Bus("bus not connected".into()))
    }
}

#[async_trait]
impl BusAdapter for NatsBus {
    async fn connect(&self) -> Result<mpsc::Receiver<BusInbound>> {
        let rpc = connect_client(&self.config.rpc_uri).await?;
        let consumer = connect_client(&self.config.consumer_uri).await?;
        let producer = connect_client(&self.config.producer_uri).await?;

        let (tx, rx) = mpsc::channel(self.config.inbound_capacity);
        let mut tasks = Vec::new();

        for subject in &self.config.rpc_subjects {
            let subscriber = rpc
                .subscribe(subject.clone())
                .await
                .map_err(|e| GatewayError::Bus(format!("subscribe to {} failed: {}", subject, e)))?;
            tasks.push(tokio::spawn(forward_requests(subscriber, tx.clone())));
        }

        let subject = self.config.fire_subject.clone();
        let subscriber = consumer
            .subscribe(subject.clone())
            .await
            .map_err(|e| GatewayError::Bus(format!("subscribe to {} failed: {}", subject, e)))?;
        tasks.push(tokio::spawn(forward_fire(subscriber, tx)));

        info!(
            "Bus connected: {} request subjects, fire subject {}",
            self.config.rpc_subjects.len(),
            subject
        );

        let previous = self.clients().replace(Clients {
            rpc,
            consumer,
            producer,
            tasks,
        });
        if let Some(previous) = previous {
            for task in previous.tasks {
                task.abort();
            }
        }

        Ok(rx)
    }

    async fn disconnect(&self) {
        let Some(clients) = self.clients().take() else {
            return;
        };
        for task in &clients.tasks {
            task.abort();
        }
        for client in [&clients.rpc, &clients.consumer, &clients.producer] {
            if let Err(e) = client.flush().await {
                debug!("Bus flush on disconnect failed: {}", e);
            }
        }
        info!("Bus disconnected");
    }

    fn is_ready(&self, stream: BusStream) -> bool {
        self.clients()
            .as_ref()
            .is_some_and(|clients| clients.client(stream).connection_state() == State::Connected)
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        let client = self.client(BusStream::Producer)?;
        let bytes = encode(&payload)?;
        client
            .publish(topic.to_string(), bytes.into())
            .await
            .map_err(|e| GatewayError::Bus(format!("publish to {} failed: {}", topic, e)))
    }

    async fn reply(&self, envelope: &ReplyEnvelope, payload: Value) -> Result<()> {
        let client = self.client(BusStream::RpcServer)?;
        let bytes = encode(&payload)?;
        client
            .publish(envelope.reply_to.clone(), bytes.into())
            .await
            .map_err(|e| GatewayError::Bus(format!("reply to {} failed: {}", envelope.reply_to, e)))
    }
}

async fn connect_client(uri: &str) -> Result<Client> {
    async_nats::connect(uri)
        .await
        .map_err(|e| GatewayError::Bus(format!("connect to {} failed: {}", uri, e)))
}

async fn forward_requests(mut subscriber: Subscriber, tx: mpsc::Sender<BusInbound>) {
    while let Some(message) = subscriber.next().await {
        let Some(reply_to) = message.reply.as_ref().map(|r| r.to_string()) else {
            debug!("Ignoring message on {} without reply subject", message.subject);
            continue;
        };
        let Some(decoded) = decode(&message.subject, &message.payload) else {
            continue;
        };
        let request = RpcRequest {
            envelope: ReplyEnvelope { reply_to },
            message: decoded,
        };
        if tx.send(BusInbound::Rpc(request)).await.is_err() {
            break;
        }
    }
}

async fn forward_fire(mut subscriber: Subscriber, tx: mpsc::Sender<BusInbound>) {
    while let Some(message) = subscriber.next().await {
        let Some(decoded) = decode(&message.subject, &message.payload) else {
            continue;
        };
        if tx.send(BusInbound::FireAndForget(decoded)).await.is_err() {
            break;
        }
    }
}

/// JSON body, empty for a null payload
fn encode(payload: &Value) -> Result<Vec<u8>> {
    if payload.is_null() {
        return Ok(Vec::new());
    }
    Ok(serde_json::to_vec(payload)?)
}

fn decode(subject: &str, payload: &[u8]) -> Option<ProtocolMessage> {
    match serde_json::from_slice::<ProtocolMessage>(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("Malformed bus message on {}: {}", subject, e);
            None
        }
    }
}
