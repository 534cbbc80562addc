//! Process-wide entropy provider bootstrap.
//!
//! Key generation draws randomness from whichever provider was registered
//! here. Registration happens at most once per process and the outcome is
//! kept in a [`OnceLock`].

use std::sync::OnceLock;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, error, info};

use crate::error::ProviderRegistrationError;

/// Number of bytes drawn during the self-test.
const SELF_TEST_BYTES: usize = 64;

static PROVIDER: OnceLock<EntropyProvider> = OnceLock::new();

/// Randomness source used for key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyProvider {
    /// The operating system CSPRNG (`getrandom`).
    OsEntropy,
    /// The thread-local generator from `rand`, used when the OS source failed.
    ThreadLocal,
}

impl std::fmt::Display for EntropyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OsEntropy => f.write_str("os-entropy"),
            Self::ThreadLocal => f.write_str("thread-local"),
        }
    }
}

/// Outcome of a [`bootstrap`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// This call performed the registration.
    Registered(EntropyProvider),
    /// A previous call already registered the provider; nothing was done.
    AlreadyRegistered(EntropyProvider),
}

impl Registration {
    /// The provider in effect after the call.
    pub fn provider(self) -> EntropyProvider {
        match self {
            Self::Registered(p) | Self::AlreadyRegistered(p) => p,
        }
    }
}

/// Registers the entropy provider for this process.
///
/// Safe to call any number of times. The first call runs a self-test of the
/// operating system source; if that fails the error is logged and the
/// thread-local generator is recorded instead. Never fails.
pub fn bootstrap() -> Registration {
    let mut performed = false;
    let provider = *PROVIDER.get_or_init(|| {
        performed = true;
        register(&mut OsRng)
    });

    if performed {
        Registration::Registered(provider)
    } else {
        debug!(provider = %provider, "Entropy provider already registered");
        Registration::AlreadyRegistered(provider)
    }
}

/// Returns the registered provider, if [`bootstrap`] has run.
pub fn current() -> Option<EntropyProvider> {
    PROVIDER.get().copied()
}

fn register<R: RngCore>(source: &mut R) -> EntropyProvider {
    match self_test(source) {
        Ok(()) => {
            info!(provider = %EntropyProvider::OsEntropy, "Registered entropy provider");
            EntropyProvider::OsEntropy
        }
        Err(e) => {
            error!(
                error = %e,
                fallback = %EntropyProvider::ThreadLocal,
                "Entropy provider registration failed, using default provider"
            );
            EntropyProvider::ThreadLocal
        }
    }
}

fn self_test<R: RngCore>(source: &mut R) -> Result<(), ProviderRegistrationError> {
    let mut first = [0u8; SELF_TEST_BYTES];
    let mut second = [0u8; SELF_TEST_BYTES];

    source
        .try_fill_bytes(&mut first)
        .map_err(|e| ProviderRegistrationError::Unavailable(e.to_string()))?;
    source
        .try_fill_bytes(&mut second)
        .map_err(|e| ProviderRegistrationError::Unavailable(e.to_string()))?;

    // A stuck source repeats itself or yields nothing but zeros.
    if first == second || first.iter().all(|&b| b == 0) {
        return Err(ProviderRegistrationError::SelfTestFailed);
    }

    Ok(())
}
