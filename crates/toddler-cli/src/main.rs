//! Toddler authenticator
//!
//! Keeps one authenticated game session alive and bridges it to NATS:
//! - request/reply subjects per configured game message type
//! - `authenticator.to.game` for fire-and-forget messages
//! - unsolicited game messages published under their topic

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Args, Settings};
use std::sync::Arc;
use toddler_channel::{SocketIoTransport, event_channel};
use toddler_gateway::{ContextConfig, GatewayContext, NatsBus};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = match args.into_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Username, password, world id or NATS URI not provided: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(settings).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(settings: Settings) -> Result<()> {
    info!("Initializing authentication service...");

    let (events, transport_events) = event_channel();
    let transport = Arc::new(SocketIoTransport::new(settings.socket, events));
    let bus = Arc::new(NatsBus::new(settings.nats));

    let config = ContextConfig {
        gateway: settings.gateway,
        bridge: settings.bridge,
        ..Default::default()
    };
    let mut context = GatewayContext::new(transport, config).with_bus(bus);
    context.start(transport_events);

    let gateway = context.gateway().clone();
    tokio::select! {
        result = gateway.login(settings.credentials) => {
            result.context("login failed")?;
            info!("Ready for messages");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before login completed");
            return shutdown(&context).await;
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    shutdown(&context).await
}

async fn shutdown(context: &GatewayContext) -> Result<()> {
    context.shutdown().await.context("logout failed")?;
    info!("Logged out, exiting");
    Ok(())
}
