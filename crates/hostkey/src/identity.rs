//! Persistent RSA host identity.
//!
//! The key lives at `<root>/SSH_DAEMON/ssh_host_rsa_key` in OpenSSH format.
//! It is generated on first use and loaded unchanged on every later start, so
//! clients see the same fingerprint across restarts.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, HashAlg, PrivateKey, PublicKey};
use tracing::{debug, info};

use crate::error::{KeyError, Result};
use crate::provider::{self, EntropyProvider};

/// Directory below the root that holds daemon state.
pub const KEY_DIR: &str = "SSH_DAEMON";

/// File name of the private host key.
pub const KEY_FILE: &str = "ssh_host_rsa_key";

/// Default RSA modulus size in bits.
pub const DEFAULT_RSA_BITS: usize = 3072;

/// Smallest accepted RSA modulus size in bits.
pub const MIN_RSA_BITS: usize = 2048;

/// Largest accepted RSA modulus size in bits.
pub const MAX_RSA_BITS: usize = 8192;

const KEY_COMMENT: &str = "sshdaemon host key";

/// Returns the host key path for the given root directory.
pub fn key_path(root: &Path) -> PathBuf {
    root.join(KEY_DIR).join(KEY_FILE)
}

/// The server's host key pair.
///
/// Cheap to clone; the private half never appears in `Debug` output.
#[derive(Clone)]
pub struct HostKeyPair {
    private_key: PrivateKey,
    path: PathBuf,
    fingerprint: String,
}

impl HostKeyPair {
    /// Loads the host key below `root`, generating and persisting it first if absent.
    ///
    /// An existing file is never replaced: if it cannot be read or parsed the
    /// call fails with [`KeyError`] and the file is left untouched. `bits` only
    /// applies when a new key is generated.
    pub fn load_or_generate(root: &Path, bits: usize) -> Result<Self> {
        let path = key_path(root);

        match fs::metadata(&path) {
            Ok(_) => {
                let pair = Self::load(&path)?;
                debug!(path = %path.display(), fingerprint = %pair.fingerprint, "Loaded host key");
                Ok(pair)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let private_key = generate_rsa(bits)?;
                persist(&path, &private_key)?;
                let pair = Self::from_private_key(private_key, path);
                info!(
                    path = %pair.path.display(),
                    fingerprint = %pair.fingerprint,
                    bits,
                    "Generated new host key"
                );
                Ok(pair)
            }
            Err(e) => Err(KeyError::io(&path, e)),
        }
    }

    /// Loads an existing OpenSSH RSA private key.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| KeyError::io(path, e))?;
        let private_key = PrivateKey::from_openssh(&contents).map_err(|source| KeyError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

        if !matches!(private_key.algorithm(), Algorithm::Rsa { .. }) {
            return Err(KeyError::UnexpectedAlgorithm {
                path: path.to_path_buf(),
                found: private_key.algorithm().as_str().to_string(),
            });
        }

        Ok(Self::from_private_key(private_key, path.to_path_buf()))
    }

    fn from_private_key(private_key: PrivateKey, path: PathBuf) -> Self {
        let fingerprint = private_key
            .public_key()
            .fingerprint(HashAlg::Sha256)
            .to_string();
        Self {
            private_key,
            path,
            fingerprint,
        }
    }

    /// Key algorithm; always RSA for keys produced by this crate.
    pub fn algorithm(&self) -> Algorithm {
        self.private_key.algorithm()
    }

    /// SHA-256 fingerprint in `SHA256:<base64>` form.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Location of the private key file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn public_key(&self) -> &PublicKey {
        self.private_key.public_key()
    }

    /// Public key in `ssh-rsa AAAA... comment` form.
    pub fn public_key_openssh(&self) -> Result<String> {
        self.public_key().to_openssh().map_err(KeyError::Generation)
    }

    /// Private key for handing to the SSH transport.
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }
}

impl std::fmt::Debug for HostKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostKeyPair")
            .field("algorithm", &self.algorithm().as_str())
            .field("fingerprint", &self.fingerprint)
            .field("path", &self.path)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

fn generate_rsa(bits: usize) -> Result<PrivateKey> {
    if !(MIN_RSA_BITS..=MAX_RSA_BITS).contains(&bits) {
        return Err(KeyError::InvalidKeySize {
            bits,
            min: MIN_RSA_BITS,
            max: MAX_RSA_BITS,
        });
    }

    let keypair = match provider::bootstrap().provider() {
        EntropyProvider::OsEntropy => RsaKeypair::random(&mut rand::rngs::OsRng, bits),
        EntropyProvider::ThreadLocal => RsaKeypair::random(&mut rand::thread_rng(), bits),
    }
    .map_err(KeyError::Generation)?;

    PrivateKey::new(KeypairData::Rsa(keypair), KEY_COMMENT).map_err(KeyError::Generation)
}

/// Writes the private key (mode 0600) through a temporary sibling and renames
/// it into place, then writes the `.pub` companion.
fn persist(path: &Path, private_key: &PrivateKey) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| KeyError::io(dir, e))?;
    }

    let pem = private_key
        .to_openssh(LineEnding::LF)
        .map_err(KeyError::Generation)?;

    let tmp = path.with_extension("tmp");
    write_private(&tmp, pem.as_bytes()).map_err(|e| KeyError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        KeyError::io(path, e)
    })?;

    let public = private_key
        .public_key()
        .to_openssh()
        .map_err(KeyError::Generation)?;
    let pub_path = path.with_extension("pub");
    fs::write(&pub_path, format!("{public}\n")).map_err(|e| KeyError::io(&pub_path, e))?;

    Ok(())
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
