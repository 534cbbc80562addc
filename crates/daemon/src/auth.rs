//! Single-credential password gate.
//!
//! Every attempt is evaluated on its own: there is no lockout or rate limit
//! here beyond the transport's rejection delay.

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AuthConfig;

/// A rejected login attempt.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthenticationError {
    /// Username or password did not match.
    #[error("authentication rejected for user '{user}'")]
    Rejected { user: String },
}

/// Accepts exactly one username/password pair.
pub struct AuthenticationGate {
    username: String,
    password_digest: [u8; 32],
}

impl AuthenticationGate {
    pub fn new(username: impl Into<String>, password: &SecretString) -> Self {
        Self {
            username: username.into(),
            password_digest: digest(password.expose_secret().as_bytes()),
        }
    }

    pub fn from_config(auth: &AuthConfig) -> Self {
        Self::new(auth.username.clone(), &auth.password)
    }

    /// Checks a submitted credential pair.
    ///
    /// Both fields must match exactly. Rejections are logged with the user
    /// name only.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<(), AuthenticationError> {
        // Both comparisons always run.
        let user_ok = digest(username.as_bytes()) == digest(self.username.as_bytes());
        let password_ok = constant_time_eq(&digest(password.as_bytes()), &self.password_digest);

        if user_ok & password_ok {
            debug!(user = %username, "Password authentication accepted");
            Ok(())
        } else {
            warn!(user = %username, "Password authentication rejected");
            Err(AuthenticationError::Rejected {
                user: username.to_string(),
            })
        }
    }

    /// The configured user name.
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl std::fmt::Debug for AuthenticationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationGate")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
