//! Player credentials

use std::fmt;

/// Credential triple used for one login cycle
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub world_id: String,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        world_id: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            world_id: world_id.into(),
        }
    }

    /// Username and password are both present
    pub fn has_login(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

// Keeps the password out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("world_id", &self.world_id)
            .finish()
    }
}
