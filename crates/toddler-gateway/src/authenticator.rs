//! Authentication gateway
//!
//! Drives the login handshake over a [`Channel`]:
//!
//! 1. `Authentication/login` with name and password, answered by `login/success`
//!    carrying the player id (or `system/error` for bad credentials)
//! 2. `Authentication/selectCharacter` with player and world id, answered by
//!    `authentication/characterselected`
//! 3. `Authentication/completeLogin`, fire-and-forget
//!
//! Only after step 3 is game traffic allowed through. The handshake is
//! triggered by the server's `system/welcome`, by a reconnect, or by
//! [`AuthenticationGateway::login`] on an already open connection; at most one
//! attempt runs at a time.

use crate::state::{AuthPhase, AuthState, RestPolicy};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use toddler_channel::{Channel, ChannelEvent};
use toddler_core::{Credentials, GatewayError, ProtocolMessage, Result, types};
use tracing::{debug, error, info, warn};

/// Gateway settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Rest period started by every login or logout attempt
    pub rest_period: Duration,
    /// Fixed delay between reconnection attempts
    pub reconnect_delay: Duration,
    /// Handling of login triggers during the rest period
    pub rest_policy: RestPolicy,
    /// Start the handshake as soon as a dropped connection is re-established
    pub relogin_on_reconnect: bool,
    /// Capacity of the event broadcast
    pub event_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rest_period: Duration::from_millis(3000),
            reconnect_delay: Duration::from_millis(3000),
            rest_policy: RestPolicy::default(),
            relogin_on_reconnect: true,
            event_capacity: 256,
        }
    }
}

/// Events published by the gateway
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// Handshake completed; the session is authenticated
    LoggedIn,
    /// A login attempt was rejected or could not start
    LoginFailed(GatewayError),
    LoggedOut,
    LogoutFailed(GatewayError),
    /// Unsolicited game message
    UnattachedMessage(ProtocolMessage),
}

struct Inner {
    state: AuthState,
    credentials: Credentials,
    /// Completion of the outstanding `login()` call
    login_waiter: Option<oneshot::Sender<Result<()>>>,
    logout_in_progress: bool,
    reconnect_scheduled: bool,
    login_deferred: bool,
}

/// Owns the authentication state machine for one game connection
pub struct AuthenticationGateway {
    channel: Arc<Channel>,
    config: GatewayConfig,
    inner: Mutex<Inner>,
    event_tx: broadcast::Sender<GatewayEvent>,
}

impl AuthenticationGateway {
    pub fn new(channel: Arc<Channel>, config: GatewayConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity);
        Self {
            channel,
            config,
            inner: Mutex::new(Inner {
                state: AuthState::new(),
                credentials: Credentials::default(),
                login_waiter: None,
                logout_in_progress: false,
                reconnect_scheduled: false,
                login_deferred: false,
            }),
            event_tx,
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Subscribe to gateway events
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.event_tx.subscribe()
    }

    /// Snapshot of the current state
    pub fn state(&self) -> AuthState {
        self.inner().state.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner().state.authenticated
    }

    /// Authenticated and connected: game traffic can flow
    pub fn is_ready(&self) -> bool {
        self.is_authenticated() && self.channel.is_connected()
    }

    /// Store credentials and authenticate
    ///
    /// Connects first if needed; the handshake then starts on the server's
    /// welcome. Completes when the handshake succeeds or is rejected. Lost
    /// connections and timeouts are retried and never complete the call.
    pub async fn login(self: &Arc<Self>, credentials: Credentials) -> Result<()> {
        let outcome = {
            let mut inner = self.inner();
            if inner.login_waiter.is_some() {
                return Err(GatewayError::LoginPending);
            }
            let (tx, rx) = oneshot::channel();
            inner.login_waiter = Some(tx);
            inner.credentials = credentials;
            rx
        };

        if self.channel.is_connected() {
            self.begin_login();
        } else {
            self.set_phase(AuthPhase::Connecting);
            if let Err(e) = self.channel.connect().await {
                warn!("Game connection failed: {}", e);
                self.schedule_reconnect();
            }
        }

        outcome
            .await
            .map_err(|_| GatewayError::Connection("authenticator stopped".into()))?
    }

    /// End the authenticated session
    pub async fn logout(&self) -> Result<()> {
        {
            let mut inner = self.inner();
            if !inner.state.authenticated {
                debug!("Logout requested while not authenticated");
                return Err(GatewayError::NotAuthenticated);
            }
            if inner.state.login_in_progress || inner.logout_in_progress {
                return Err(GatewayError::LoginPending);
            }
            inner.logout_in_progress = true;
            inner.state.start_rest(self.config.rest_period);
        }

        let result = self.logout_sequence().await;
        self.inner().logout_in_progress = false;
        result
    }

    /// Send a game message without awaiting a reply
    ///
    /// Dropped with a log line while unauthenticated.
    pub async fn fire(&self, message: ProtocolMessage) -> Result<()> {
        if !self.is_authenticated() {
            debug!("Dropping {} while unauthenticated", message.kind);
            return Ok(());
        }
        self.channel.fire(message).await.map(|_| ())
    }

    /// Send a game message and await its reply
    pub async fn request(&self, message: ProtocolMessage) -> Result<ProtocolMessage> {
        if !self.is_authenticated() {
            debug!("Refusing {} while unauthenticated", message.kind);
            return Err(GatewayError::NotAuthenticated);
        }
        self.channel.request(message).await
    }

    /// React to a channel event
    pub fn handle_channel_event(self: &Arc<Self>, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => self.on_connected(),
            ChannelEvent::Disconnected => self.on_disconnected(),
            ChannelEvent::MessageReceived(message) if message.is_type(types::WELCOME) => {
                debug!("Welcome received");
                self.begin_login();
            }
            ChannelEvent::MessageReceived(message) => {
                let _ = self.event_tx.send(GatewayEvent::UnattachedMessage(message));
            }
        }
    }

    /// Process channel events until the channel goes away
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<ChannelEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle_channel_event(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Authenticator lagged, {} channel events skipped", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Authenticator event loop exiting");
    }

    /// Subscribe to the channel and process its events in the background
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let events = self.channel.subscribe();
        tokio::spawn(self.clone().run(events))
    }

    fn on_connected(self: &Arc<Self>) {
        let relogin = {
            let mut inner = self.inner();
            if !inner.state.login_in_progress {
                inner.state.phase = AuthPhase::AwaitingWelcome;
            }
            // A new socket carries no server session
            inner.state.authenticated = false;
            inner.state.logged_in = false;
            std::mem::take(&mut inner.state.socket_previously_disconnected)
                && self.config.relogin_on_reconnect
        };
        info!("Game connection established");

        if relogin {
            info!("Reconnected, logging in again");
            self.begin_login();
        }
    }

    fn on_disconnected(self: &Arc<Self>) {
        {
            let mut inner = self.inner();
            inner.state.phase = AuthPhase::Disconnected;
            inner.state.socket_previously_disconnected = true;
        }
        warn!("Game connection lost");
        self.schedule_reconnect();
    }

    /// Start one reconnect task, unless one is already pending
    fn schedule_reconnect(self: &Arc<Self>) {
        {
            let mut inner = self.inner();
            if inner.reconnect_scheduled {
                debug!("Reconnect already scheduled");
                return;
            }
            inner.reconnect_scheduled = true;
        }

        let delay = self.config.reconnect_delay;
        let mut deadline = Instant::now() + delay;
        info!("Reconnecting in {:?}", delay);

        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep_until(deadline).await;
                gateway.inner().reconnect_scheduled = false;

                match gateway.channel.connect().await {
                    Ok(()) => return,
                    Err(e) => {
                        let mut inner = gateway.inner();
                        if inner.reconnect_scheduled {
                            return;
                        }
                        inner.reconnect_scheduled = true;
                        deadline = Instant::now() + delay;
                        warn!("Reconnect failed: {}, retrying in {:?}", e, delay);
                    }
                }
            }
        });
    }

    /// Start a handshake attempt if the guards allow it
    fn begin_login(self: &Arc<Self>) {
        match self.claim_attempt() {
            Ok(Some(logout_first)) => {
                let gateway = self.clone();
                tokio::spawn(async move { gateway.run_handshake(logout_first).await });
            }
            Ok(None) => {}
            Err(e) => self.report_login_failure(e),
        }
    }

    /// Check the login guards and mark an attempt as started
    ///
    /// Returns whether the attempt must log out first, or `None` when the
    /// trigger is ignored.
    fn claim_attempt(self: &Arc<Self>) -> Result<Option<bool>> {
        let mut inner = self.inner();

        if !inner.credentials.has_login() {
            error!("Username/password is not supplied");
            return Err(GatewayError::Credential(
                "username/password is not supplied".into(),
            ));
        }
        if !self.channel.is_connected() {
            error!("Socket client is not connected");
            return Err(GatewayError::Connection(
                "socket client is not connected".into(),
            ));
        }
        if inner.state.login_in_progress || inner.logout_in_progress {
            debug!("Login already in progress, ignoring trigger");
            return Ok(None);
        }
        if inner.state.is_resting() {
            match self.config.rest_policy {
                RestPolicy::Advisory => debug!("Login attempted during rest period"),
                RestPolicy::Enforced => {
                    if !inner.login_deferred {
                        if let Some(until) = inner.state.rest_until {
                            inner.login_deferred = true;
                            debug!("Resting, deferring login");
                            self.defer_login(until);
                        }
                    }
                    return Ok(None);
                }
            }
        }

        inner.state.login_in_progress = true;
        inner.state.start_rest(self.config.rest_period);
        let logout_first = inner.state.authenticated;
        inner.state.phase = if logout_first {
            AuthPhase::LoggingOut
        } else {
            AuthPhase::LoggingIn
        };
        Ok(Some(logout_first))
    }

    fn defer_login(self: &Arc<Self>, until: Instant) {
        let gateway = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(until).await;
            gateway.inner().login_deferred = false;
            gateway.begin_login();
        });
    }

    async fn run_handshake(self: Arc<Self>, logout_first: bool) {
        if logout_first {
            info!("Already authenticated, logging out first");
            if let Err(e) = self.logout_sequence().await {
                self.fail_login(e);
                return;
            }
            let mut inner = self.inner();
            inner.state.login_in_progress = true;
            inner.state.phase = AuthPhase::LoggingIn;
        }
        self.login_sequence().await;
    }

    async fn login_sequence(self: &Arc<Self>) {
        let credentials = self.inner().credentials.clone();
        info!("Logging in as {}", credentials.username);

        let request = ProtocolMessage::new(
            types::LOGIN,
            json!({ "name": credentials.username, "pass": credentials.password }),
        );
        let reply = match self.channel.request(request).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Login request failed: {}", e);
                self.fail_login(e);
                return;
            }
        };

        if reply.is_type(types::LOGIN_SUCCESS) {
            let player_id = match reply.data.get("player_id").and_then(|v| v.as_i64()) {
                Some(id) if id >= 0 => id,
                _ => {
                    error!("Login reply carries no player id");
                    self.fail_login(GatewayError::ProtocolError(
                        "login reply without player_id".into(),
                    ));
                    return;
                }
            };
            info!("Login successful");
            {
                let mut inner = self.inner();
                inner.state.logged_in = true;
                inner.state.player_id = player_id;
                inner.state.phase = AuthPhase::WorldSelection;
            }
            self.select_world().await;
        } else if is_auth_error(&reply) {
            let message = reply
                .data_str("message")
                .unwrap_or("authentication failed")
                .to_string();
            error!("Login rejected: {}", message);
            self.fail_login(GatewayError::LoginFailed(message));
        } else {
            warn!("Unexpected login reply {}", reply.kind);
            self.inner().state.login_in_progress = false;
        }
    }

    async fn select_world(self: &Arc<Self>) {
        let (logged_in, player_id, world_id) = {
            let inner = self.inner();
            (
                inner.state.logged_in,
                inner.state.player_id,
                inner.credentials.world_id.clone(),
            )
        };

        if !logged_in {
            error!("Player is not logged in to select world");
            self.fail_login(GatewayError::ProtocolError(
                "player is not logged in to select world".into(),
            ));
            return;
        }
        if world_id.is_empty() {
            error!("World id is not supplied");
            self.fail_login(GatewayError::Credential("world id is not supplied".into()));
            return;
        }

        info!("Selecting world {} for player {}", world_id, player_id);
        let request = ProtocolMessage::new(
            types::SELECT_CHARACTER,
            json!({ "id": player_id, "world_id": world_id }),
        );
        match self.channel.request(request).await {
            Ok(reply) if reply.is_type(types::CHARACTER_SELECTED) => {
                info!("World selection successful");
                {
                    let mut inner = self.inner();
                    inner.state.authenticated = true;
                    inner.state.login_in_progress = false;
                    inner.state.phase = AuthPhase::Authenticated;
                }
                self.complete_login().await;
            }
            Ok(reply) => {
                error!("World selection failed: {}", reply.kind);
                self.fail_login(GatewayError::LoginFailed(
                    "Invalid world for character".into(),
                ));
            }
            Err(e) => {
                error!("World selection request failed: {}", e);
                self.fail_login(e);
            }
        }
    }

    async fn complete_login(&self) {
        let message = ProtocolMessage::new(types::COMPLETE_LOGIN, json!({}));
        if let Err(e) = self.channel.fire(message).await {
            warn!("Failed to send completeLogin: {}", e);
        }

        let waiter = self.inner().login_waiter.take();
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(()));
        }
        let _ = self.event_tx.send(GatewayEvent::LoggedIn);
    }

    async fn logout_sequence(&self) -> Result<()> {
        let credentials = {
            let mut inner = self.inner();
            inner.state.phase = AuthPhase::LoggingOut;
            inner.credentials.clone()
        };
        info!("Logging out");

        let request = ProtocolMessage::new(
            types::LOGOUT,
            json!({ "name": credentials.username, "pass": credentials.password }),
        );
        let error = match self.channel.request(request).await {
            Ok(reply) if reply.is_type(types::LOGOUT_SUCCESS) => {
                info!("Logout successful");
                {
                    let mut inner = self.inner();
                    inner.state.authenticated = false;
                    inner.state.logged_in = false;
                    inner.state.login_in_progress = false;
                    inner.state.phase = if self.channel.is_connected() {
                        AuthPhase::AwaitingWelcome
                    } else {
                        AuthPhase::Disconnected
                    };
                }
                let _ = self.event_tx.send(GatewayEvent::LoggedOut);
                return Ok(());
            }
            Ok(reply) => GatewayError::ProtocolError(format!("unexpected logout reply {}", reply.kind)),
            Err(e) => e,
        };

        error!("Logout failed: {}", error);
        {
            let mut inner = self.inner();
            if inner.state.phase == AuthPhase::LoggingOut {
                inner.state.phase = AuthPhase::Authenticated;
            }
        }
        let _ = self.event_tx.send(GatewayEvent::LogoutFailed(error.clone()));
        Err(error)
    }

    fn fail_login(self: &Arc<Self>, error: GatewayError) {
        self.inner().state.login_in_progress = false;
        let retry = error.is_connection() && self.channel.is_connected();
        self.report_login_failure(error);
        if retry {
            info!("Retrying interrupted login");
            self.begin_login();
        }
    }

    /// Complete the outstanding `login()` with a rejection
    ///
    /// Transport errors leave it pending for the next attempt.
    fn report_login_failure(&self, error: GatewayError) {
        if error.is_connection() {
            warn!("Login interrupted: {}", error);
            return;
        }
        let waiter = self.inner().login_waiter.take();
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(error.clone()));
        }
        let _ = self.event_tx.send(GatewayEvent::LoginFailed(error));
    }

    fn set_phase(&self, phase: AuthPhase) {
        self.inner().state.phase = phase;
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_auth_error(reply: &ProtocolMessage) -> bool {
    reply.is_type(types::ERROR)
        && reply
            .data_str("cause")
            .is_some_and(|cause| cause.contains("Authentication"))
}
