//! # Host identity for sshdaemon
//!
//! This crate owns everything the daemon needs before it can present itself
//! to an SSH client:
//!
//! - **Entropy bootstrap**: a once-per-process registration of the randomness
//!   source used for key material, with a logged fallback when the operating
//!   system source is unusable
//! - **Host key**: the persistent RSA key pair stored below the served root
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use hostkey::{provider, HostKeyPair, DEFAULT_RSA_BITS};
//!
//! provider::bootstrap();
//! let key = HostKeyPair::load_or_generate("/srv/files".as_ref(), DEFAULT_RSA_BITS)?;
//! println!("Host key fingerprint: {}", key.fingerprint());
//! # Ok::<(), hostkey::KeyError>(())
//! ```

pub mod error;
pub mod identity;
pub mod provider;

pub use error::{KeyError, ProviderRegistrationError, Result};
pub use identity::{
    key_path, HostKeyPair, DEFAULT_RSA_BITS, KEY_DIR, KEY_FILE, MAX_RSA_BITS, MIN_RSA_BITS,
};
pub use provider::{EntropyProvider, Registration};
