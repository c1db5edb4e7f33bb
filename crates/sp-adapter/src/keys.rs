//! Key material for the adapter
//!
//! The adapter owns exactly one host identity and accepts exactly one
//! client credential. Either can come from a file or be generated fresh;
//! a generated client key has its private half written to an owner-only
//! temporary file so an external ssh client can use it.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use ssh_key::private::RsaKeypair;
use ssh_key::{Algorithm, LineEnding};
use tempfile::TempPath;

use sp_core::{KeyLoadError, KeyType};

/// Modulus size of generated RSA keys
pub const RSA_KEY_BITS: usize = 2048;

/// Something that can present an SSH public key
pub trait PublicKeySource {
    /// Wire encoding of the public key (the authorized_keys blob)
    fn public_key_blob(&self) -> Vec<u8>;

    /// SHA-256 fingerprint for logs
    fn fingerprint(&self) -> String;
}

/// Something that can sign as an SSH host
pub trait HostSigner {
    /// Key pair handed to the SSH transport
    fn signing_key(&self) -> KeyPair;
}

impl PublicKeySource for PublicKey {
    fn public_key_blob(&self) -> Vec<u8> {
        self.public_key_bytes()
    }

    fn fingerprint(&self) -> String {
        PublicKey::fingerprint(self)
    }
}

/// The server's host key, held in memory for the adapter's lifetime
#[derive(Clone)]
pub struct HostIdentity {
    key: KeyPair,
    public: PublicKey,
}

impl std::fmt::Debug for HostIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostIdentity")
            .field("fingerprint", &self.public.fingerprint())
            .finish()
    }
}

impl HostIdentity {
    fn from_key_pair(key: KeyPair) -> Result<Self, KeyLoadError> {
        let public = key
            .clone_public_key()
            .map_err(|e| KeyLoadError::Generate(e.to_string()))?;
        Ok(Self { key, public })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }
}

impl HostSigner for HostIdentity {
    fn signing_key(&self) -> KeyPair {
        self.key.clone()
    }
}

impl PublicKeySource for HostIdentity {
    fn public_key_blob(&self) -> Vec<u8> {
        self.public.public_key_bytes()
    }

    fn fingerprint(&self) -> String {
        self.public.fingerprint()
    }
}

/// The single public key allowed to authenticate
#[derive(Debug)]
pub struct ClientCredential {
    public: PublicKey,
    /// Generated private key file, removed by [`ClientCredential::cleanup`]
    private_key_file: Mutex<Option<TempPath>>,
    private_key_path: Option<PathBuf>,
}

impl ClientCredential {
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Path of the generated private key, if this credential was generated
    pub fn private_key_file(&self) -> Option<&Path> {
        self.private_key_path.as_deref()
    }

    /// The credential in authorized_keys form
    pub fn authorized_key_line(&self) -> String {
        let blob = self.public.public_key_bytes();
        let key_type = blob_key_type(&blob).unwrap_or_else(|| self.public.name());
        format!("{} {}", key_type, self.public.public_key_base64())
    }

    /// Delete the generated private key file. Safe to call repeatedly.
    pub fn cleanup(&self) -> std::io::Result<()> {
        let taken = self
            .private_key_file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match taken {
            Some(path) => {
                tracing::debug!("Removing generated client key {:?}", &*path);
                path.close()
            }
            None => Ok(()),
        }
    }
}

impl PublicKeySource for ClientCredential {
    fn public_key_blob(&self) -> Vec<u8> {
        self.public.public_key_bytes()
    }

    fn fingerprint(&self) -> String {
        self.public.fingerprint()
    }
}

/// Load the authorized client key from `path`, or generate a fresh one
pub fn obtain_client_credential(path: Option<&Path>) -> Result<ClientCredential, KeyLoadError> {
    obtain_client_credential_as(path, KeyType::default())
}

/// [`obtain_client_credential`], generating a `key_type` key when needed
pub fn obtain_client_credential_as(
    path: Option<&Path>,
    key_type: KeyType,
) -> Result<ClientCredential, KeyLoadError> {
    match path {
        Some(path) => load_client_credential(path),
        None => generate_client_credential(key_type),
    }
}

/// Load the host key from `path`, or generate one held only in memory
pub fn obtain_host_identity(path: Option<&Path>) -> Result<HostIdentity, KeyLoadError> {
    obtain_host_identity_as(path, KeyType::default())
}

/// [`obtain_host_identity`], generating a `key_type` key when needed
pub fn obtain_host_identity_as(
    path: Option<&Path>,
    key_type: KeyType,
) -> Result<HostIdentity, KeyLoadError> {
    match path {
        Some(path) => {
            tracing::info!("Loading host key from {:?}", path);
            let text = read_key_file(path)?;
            let key = russh_keys::decode_secret_key(&text, None).map_err(|e| {
                KeyLoadError::Parse {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            })?;
            HostIdentity::from_key_pair(key)
        }
        None => {
            tracing::info!("Generating in-memory {:?} host key", key_type);
            let (key, _) = generate_key_pair(key_type)?;
            HostIdentity::from_key_pair(key)
        }
    }
}

fn read_key_file(path: &Path) -> Result<String, KeyLoadError> {
    std::fs::read_to_string(path).map_err(|source| KeyLoadError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn load_client_credential(path: &Path) -> Result<ClientCredential, KeyLoadError> {
    tracing::info!("Loading authorized client key from {:?}", path);
    let text = read_key_file(path)?;

    let public = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .and_then(parse_openssh_line)
        .ok_or_else(|| KeyLoadError::Parse {
            path: path.to_path_buf(),
            reason: "no public key in authorized_keys format".to_string(),
        })?;

    Ok(ClientCredential {
        public,
        private_key_file: Mutex::new(None),
        private_key_path: None,
    })
}

/// Key type named at the head of a public key blob ("ssh-rsa" for every
/// RSA signature hash)
fn blob_key_type(blob: &[u8]) -> Option<&str> {
    let len = u32::from_be_bytes(blob.get(..4)?.try_into().ok()?) as usize;
    std::str::from_utf8(blob.get(4..4 + len)?).ok()
}

/// Parse an OpenSSH format public key line: "type base64 [comment]"
fn parse_openssh_line(line: &str) -> Option<PublicKey> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 2 {
        return None;
    }
    russh_keys::parse_public_key_base64(parts[1]).ok()
}

fn generate_client_credential(key_type: KeyType) -> Result<ClientCredential, KeyLoadError> {
    let (key, openssh) = generate_key_pair(key_type)?;
    let public = key
        .clone_public_key()
        .map_err(|e| KeyLoadError::Generate(e.to_string()))?;

    let mut file = tempfile::Builder::new()
        .prefix("sshproxy-key-")
        .tempfile()
        .map_err(KeyLoadError::Persist)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(KeyLoadError::Persist)?;
    }

    file.write_all(openssh.as_bytes())
        .and_then(|_| file.flush())
        .map_err(KeyLoadError::Persist)?;

    let temp_path = file.into_temp_path();
    let private_key_path = temp_path.to_path_buf();
    tracing::info!(
        "Generated {:?} client key, private half at {:?}",
        key_type,
        private_key_path
    );

    Ok(ClientCredential {
        public,
        private_key_file: Mutex::new(Some(temp_path)),
        private_key_path: Some(private_key_path),
    })
}

/// Fresh key pair plus its OpenSSH private key encoding
fn generate_key_pair(key_type: KeyType) -> Result<(KeyPair, String), KeyLoadError> {
    let mut rng = rand::rngs::OsRng;
    let private = match key_type {
        KeyType::Ed25519 => ssh_key::PrivateKey::random(&mut rng, Algorithm::Ed25519),
        KeyType::Rsa => RsaKeypair::random(&mut rng, RSA_KEY_BITS).map(ssh_key::PrivateKey::from),
    }
    .map_err(|e| KeyLoadError::Generate(e.to_string()))?;
    let openssh = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| KeyLoadError::Generate(e.to_string()))?;
    let key = russh_keys::decode_secret_key(&openssh, None)
        .map_err(|e| KeyLoadError::Generate(e.to_string()))?;
    Ok((key, openssh.to_string()))
}
