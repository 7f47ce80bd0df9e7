//! Persistent SSH keypair used to log into playground machines

use rand::rngs::OsRng;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, PrivateKey};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::SshError;

pub const PRIVATE_KEY_FILE: &str = "id_ed25519";
pub const PUBLIC_KEY_FILE: &str = "id_ed25519.pub";

/// An Ed25519 keypair plus its OpenSSH public key line
#[derive(Clone)]
pub struct SshIdentity {
    key: Arc<PrivateKey>,
    public_key: String,
}

impl std::fmt::Debug for SshIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshIdentity")
            .field("public_key", &self.public_key)
            .finish()
    }
}

impl SshIdentity {
    pub fn generate() -> Result<Self, SshError> {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|e| SshError::Identity(format!("key generation failed: {}", e)))?;
        Self::from_key(key)
    }

    fn from_key(key: PrivateKey) -> Result<Self, SshError> {
        let public_key = key
            .public_key()
            .to_openssh()
            .map_err(|e| SshError::Identity(format!("cannot encode public key: {}", e)))?;
        Ok(Self {
            key: Arc::new(key),
            public_key,
        })
    }

    /// Load `id_ed25519` from `dir`, generating and saving it on first use
    pub fn load_or_generate(dir: &Path) -> Result<Self, SshError> {
        let private_path = dir.join(PRIVATE_KEY_FILE);
        if private_path.exists() {
            debug!(path = %private_path.display(), "Loading SSH identity");
            let key = russh::keys::load_secret_key(&private_path, None).map_err(|e| {
                SshError::Identity(format!("cannot load {}: {}", private_path.display(), e))
            })?;
            return Self::from_key(key);
        }

        let identity = Self::generate()?;
        identity.save(dir)?;
        info!(path = %private_path.display(), "Generated new SSH identity");
        Ok(identity)
    }

    /// Write both key files, the private one readable by the owner only
    pub fn save(&self, dir: &Path) -> Result<(), SshError> {
        fs::create_dir_all(dir).map_err(|source| SshError::IdentityIo {
            path: dir.to_path_buf(),
            source,
        })?;

        let private = self
            .key
            .to_openssh(LineEnding::LF)
            .map_err(|e| SshError::Identity(format!("cannot encode private key: {}", e)))?;
        write_private(&dir.join(PRIVATE_KEY_FILE), private.as_bytes())?;

        let public_path = dir.join(PUBLIC_KEY_FILE);
        fs::write(&public_path, format!("{}\n", self.public_key)).map_err(|source| {
            SshError::IdentityIo {
                path: public_path,
                source,
            }
        })
    }

    /// `ssh-ed25519 AAAA...` line sent with tunnel requests
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn private_key(&self) -> Arc<PrivateKey> {
        self.key.clone()
    }
}

fn write_private(path: &Path, contents: &[u8]) -> Result<(), SshError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let io_err = |source| SshError::IdentityIo {
        path: path.to_path_buf(),
        source,
    };
    let mut file = options.open(path).map_err(io_err)?;
    file.write_all(contents).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_then_reload() {
        let dir = tempfile::tempdir().unwrap();

        let first = SshIdentity::load_or_generate(dir.path()).unwrap();
        assert!(first.public_key().starts_with("ssh-ed25519 "));
        assert!(dir.path().join(PRIVATE_KEY_FILE).exists());

        let public = fs::read_to_string(dir.path().join(PUBLIC_KEY_FILE)).unwrap();
        assert_eq!(public.trim_end(), first.public_key());

        let second = SshIdentity::load_or_generate(dir.path()).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        SshIdentity::load_or_generate(dir.path()).unwrap();

        let mode = fs::metadata(dir.path().join(PRIVATE_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = SshIdentity::generate().unwrap();
        let b = SshIdentity::generate().unwrap();
        assert_ne!(a.public_key(), b.public_key());
    }
}
