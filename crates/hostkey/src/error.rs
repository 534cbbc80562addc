//! Error types for the hostkey crate.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while obtaining the server's host identity.
#[derive(Debug, Error)]
pub enum KeyError {
    // Storage errors
    /// The key file or its directory could not be read or written.
    #[error("host key I/O failed at {path}: {source}")]
    Io {
        /// Path that was being accessed.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The key file exists but does not hold a parsable OpenSSH private key.
    #[error("host key at {path} is malformed: {source}")]
    Decode {
        /// Path of the rejected key file.
        path: PathBuf,
        /// Parser failure.
        #[source]
        source: russh::keys::ssh_key::Error,
    },

    /// The key file holds a key of another algorithm.
    #[error("host key at {path} is {found}, expected ssh-rsa")]
    UnexpectedAlgorithm {
        /// Path of the rejected key file.
        path: PathBuf,
        /// Algorithm actually found.
        found: String,
    },

    // Generation errors
    /// Requested modulus size is outside the supported range.
    #[error("RSA key size must be between {min} and {max} bits, got {bits}")]
    InvalidKeySize {
        /// Requested size.
        bits: usize,
        /// Smallest accepted size.
        min: usize,
        /// Largest accepted size.
        max: usize,
    },

    /// Key generation or encoding failed.
    #[error("host key generation failed: {0}")]
    Generation(#[source] russh::keys::ssh_key::Error),
}

impl KeyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// The entropy provider could not be registered.
///
/// Never fatal: the bootstrap records the fallback provider instead.
#[derive(Debug, Error)]
pub enum ProviderRegistrationError {
    /// The operating system entropy source refused to produce bytes.
    #[error("operating system entropy source unavailable: {0}")]
    Unavailable(String),

    /// The entropy source produced output that failed the self-test.
    #[error("operating system entropy source failed self-test")]
    SelfTestFailed,
}

/// Result type alias for host identity operations.
pub type Result<T> = std::result::Result<T, KeyError>;
