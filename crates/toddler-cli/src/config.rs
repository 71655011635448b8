//! Command line and environment settings

use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use toddler_channel::SocketIoConfig;
use toddler_core::{Credentials, GatewayError, Result};
use toddler_gateway::{BridgeConfig, GatewayConfig, NatsBusConfig, RestPolicy};

pub const USERNAME: &str = "TODDLER_USERNAME";
pub const PASSWORD: &str = "TODDLER_PASSWORD";
pub const WORLD_ID: &str = "TODDLER_WORLD_ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RestPolicyArg {
    Advisory,
    Enforced,
}

impl From<RestPolicyArg> for RestPolicy {
    fn from(arg: RestPolicyArg) -> Self {
        match arg {
            RestPolicyArg::Advisory => RestPolicy::Advisory,
            RestPolicyArg::Enforced => RestPolicy::Enforced,
        }
    }
}

/// Game authenticator bridging a game session to NATS
#[derive(Debug, Parser)]
#[command(name = "toddler-authenticator", version)]
pub struct Args {
    /// Game server URL
    #[arg(long, env = "TODDLER_GAME_URL", default_value = "https://en.tribalwars2.com/")]
    pub game_url: String,

    /// NATS server URI
    #[arg(long, env = "TODDLER_NATS_URI")]
    pub nats_uri: Option<String>,

    /// NATS URI for the request/reply stream (defaults to --nats-uri)
    #[arg(long, env = "TODDLER_NATS_RPC_URI")]
    pub nats_rpc_uri: Option<String>,

    /// NATS URI for the fire-and-forget stream (defaults to --nats-uri)
    #[arg(long, env = "TODDLER_NATS_CONSUMER_URI")]
    pub nats_consumer_uri: Option<String>,

    /// NATS URI for published notifications (defaults to --nats-uri)
    #[arg(long, env = "TODDLER_NATS_PRODUCER_URI")]
    pub nats_producer_uri: Option<String>,

    /// Game message types served as request/reply, comma separated
    #[arg(long, env = "TODDLER_RPC_TYPES", value_delimiter = ',')]
    pub rpc_types: Vec<String>,

    /// Subject carrying fire-and-forget messages for the game
    #[arg(long, env = "TODDLER_FIRE_SUBJECT", default_value = "authenticator.to.game")]
    pub fire_subject: String,

    /// Subject announced once the bus is connected
    #[arg(long, env = "TODDLER_READY_SUBJECT", default_value = "authenticator.ready")]
    pub ready_subject: String,

    /// Game message types fired after every login, comma separated
    #[arg(long, env = "TODDLER_READY_FIRE", value_delimiter = ',')]
    pub ready_fire: Vec<String>,

    /// Directory holding credential secrets
    #[arg(long, env = "TODDLER_SECRETS_DIR", default_value = "/run/secrets")]
    pub secrets_dir: PathBuf,

    /// Handling of login attempts during the rest period
    #[arg(long, env = "TODDLER_REST_POLICY", value_enum, default_value_t = RestPolicyArg::Advisory)]
    pub rest_policy: RestPolicyArg,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, env = "TODDLER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Everything the service needs to start
#[derive(Debug)]
pub struct Settings {
    pub credentials: Credentials,
    pub socket: SocketIoConfig,
    pub nats: NatsBusConfig,
    pub gateway: GatewayConfig,
    pub bridge: BridgeConfig,
}

impl Args {
    /// Resolve credentials from the secrets directory or the process environment
    pub fn into_settings(self) -> Result<Settings> {
        self.resolve(|name| std::env::var(name).ok())
    }

    fn resolve(self, env: impl Fn(&str) -> Option<String>) -> Result<Settings> {
        let username = secret(&self.secrets_dir, USERNAME, &env);
        let password = secret(&self.secrets_dir, PASSWORD, &env);
        let world_id = secret(&self.secrets_dir, WORLD_ID, &env);
        let nats_uri = self.nats_uri.as_deref().map(str::trim).filter(|s| !s.is_empty());

        let mut missing = Vec::new();
        for (name, value) in [
            (USERNAME, username.is_some()),
            (PASSWORD, password.is_some()),
            (WORLD_ID, world_id.is_some()),
            ("TODDLER_NATS_URI", nats_uri.is_some()),
        ] {
            if !value {
                missing.push(name);
            }
        }
        let (Some(username), Some(password), Some(world_id), Some(nats_uri)) =
            (username, password, world_id, nats_uri)
        else {
            return Err(GatewayError::Config(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        };

        let mut nats = NatsBusConfig::new(nats_uri).with_rpc_types(&non_empty(&self.rpc_types));
        if let Some(uri) = self.nats_rpc_uri {
            nats.rpc_uri = uri;
        }
        if let Some(uri) = self.nats_consumer_uri {
            nats.consumer_uri = uri;
        }
        if let Some(uri) = self.nats_producer_uri {
            nats.producer_uri = uri;
        }
        nats.fire_subject = self.fire_subject;

        Ok(Settings {
            credentials: Credentials::new(username, password, world_id),
            socket: SocketIoConfig::with_url(self.game_url),
            nats,
            gateway: GatewayConfig {
                rest_policy: self.rest_policy.into(),
                ..Default::default()
            },
            bridge: BridgeConfig {
                ready_subject: self.ready_subject,
                ready_fire: non_empty(&self.ready_fire),
                ..Default::default()
            },
        })
    }
}

/// `<dir>/<name>` trimmed, else the environment variable of the same name
fn secret(dir: &Path, name: &str, env: &impl Fn(&str) -> Option<String>) -> Option<String> {
    std::fs::read_to_string(dir.join(name))
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| {
            env(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
}

fn non_empty(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}
