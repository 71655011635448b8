//! Authentication state

use std::time::Duration;
use tokio::time::Instant;

/// Main authentication phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    /// No game connection
    Disconnected,
    /// Connection requested, not yet established
    Connecting,
    /// Connected, handshake not started
    AwaitingWelcome,
    /// `Authentication/login` sent or about to be sent
    LoggingIn,
    /// Logged in, selecting the world
    WorldSelection,
    /// Character selected; game traffic allowed
    Authenticated,
    /// `Authentication/logout` outstanding
    LoggingOut,
}

/// What to do with a login trigger that arrives during the rest period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestPolicy {
    /// Log the condition and proceed
    #[default]
    Advisory,
    /// Defer the attempt until the rest period ends
    Enforced,
}

/// Snapshot of the authenticator's state
///
/// `authenticated` and `logged_in` are not reset on disconnect; they stay
/// stale until the next login cycle settles them.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthState {
    pub phase: AuthPhase,
    pub logged_in: bool,
    pub authenticated: bool,
    pub login_in_progress: bool,
    pub socket_previously_disconnected: bool,
    pub player_id: i64,
    /// End of the current rest period
    pub rest_until: Option<Instant>,
}

impl AuthState {
    pub fn new() -> Self {
        Self {
            phase: AuthPhase::Disconnected,
            logged_in: false,
            authenticated: false,
            login_in_progress: false,
            socket_previously_disconnected: false,
            player_id: -1,
            rest_until: None,
        }
    }

    /// Whether a login/logout attempt happened within the rest period
    pub fn is_resting(&self) -> bool {
        self.rest_until.is_some_and(|until| Instant::now() < until)
    }

    /// Start a rest period of `period` from now
    pub fn start_rest(&mut self, period: Duration) {
        self.rest_until = Some(Instant::now() + period);
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = AuthState::new();
        assert_eq!(state.phase, AuthPhase::Disconnected);
        assert!(!state.authenticated);
        assert!(!state.is_resting());
        assert_eq!(state.player_id, -1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rest_period_expires() {
        let mut state = AuthState::new();
        state.start_rest(Duration::from_millis(3000));
        assert!(state.is_resting());

        tokio::time::advance(Duration::from_millis(2999)).await;
        assert!(state.is_resting());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!state.is_resting());
    }
}
