//! Client key pair source.
//!
//! Every ephemeral client certificate issued to this process is bound to
//! one RSA-2048 key pair, generated lazily on first use and shared across
//! all instances for the lifetime of the process. Generation takes
//! hundreds of milliseconds, so it runs on a blocking worker rather than
//! on the caller's task.

use std::sync::Arc;

use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::sync::OnceCell;
use tracing::debug;

use cloudsql_core::{ConnectorError, ConnectorResult};

const KEY_BITS: usize = 2048;

/// The process-wide client key pair, pre-serialized in the formats its
/// consumers need: SPKI PEM for certificate signing requests, PKCS#8 DER
/// for the rustls client-auth key.
pub struct ClientKeyPair {
    public_key_pem: String,
    pkcs8_der: Vec<u8>,
}

/// Private key material never appears in logs.
impl std::fmt::Debug for ClientKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientKeyPair")
            .field("public_key_pem", &self.public_key_pem)
            .field("pkcs8_der", &"<redacted>")
            .finish()
    }
}

impl ClientKeyPair {
    /// Derive the serialized forms from an RSA private key.
    pub fn from_private_key(key: &RsaPrivateKey) -> ConnectorResult<Self> {
        let public: RsaPublicKey = key.to_public_key();
        let public_key_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| ConnectorError::TlsBuild(format!("public key encoding: {e}")))?;
        let pkcs8_der = key
            .to_pkcs8_der()
            .map_err(|e| ConnectorError::TlsBuild(format!("private key encoding: {e}")))?
            .as_bytes()
            .to_vec();
        Ok(Self {
            public_key_pem,
            pkcs8_der,
        })
    }

    /// The PEM-encoded SPKI public key submitted to the control plane.
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// The PKCS#8 DER private key presented during the TLS handshake.
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8_der
    }
}

/// Lazily generates the shared key pair; every call observes the same
/// result.
pub struct KeyPairSource {
    cell: OnceCell<Arc<ClientKeyPair>>,
    preset: Option<Arc<ClientKeyPair>>,
}

impl KeyPairSource {
    /// A source that generates a fresh RSA-2048 key pair on first use.
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            preset: None,
        }
    }

    /// A source backed by a caller-supplied private key. Useful when the
    /// key is provisioned externally, and for tests that must share the
    /// key with a certificate issuer.
    pub fn from_private_key(key: &RsaPrivateKey) -> ConnectorResult<Self> {
        Ok(Self {
            cell: OnceCell::new(),
            preset: Some(Arc::new(ClientKeyPair::from_private_key(key)?)),
        })
    }

    /// Get the shared key pair, generating it if this is the first call.
    /// Concurrent callers coalesce onto a single generation.
    pub async fn get(&self) -> ConnectorResult<Arc<ClientKeyPair>> {
        if let Some(preset) = &self.preset {
            return Ok(preset.clone());
        }
        self.cell
            .get_or_try_init(|| async {
                let pair = tokio::task::spawn_blocking(generate_key_pair)
                    .await
                    .map_err(|e| {
                        ConnectorError::TlsBuild(format!("key generation task failed: {e}"))
                    })??;
                debug!(bits = KEY_BITS, "generated client RSA key pair");
                Ok(Arc::new(pair))
            })
            .await
            .cloned()
    }
}

impl Default for KeyPairSource {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_key_pair() -> ConnectorResult<ClientKeyPair> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)
        .map_err(|e| ConnectorError::TlsBuild(format!("RSA key generation: {e}")))?;
    ClientKeyPair::from_private_key(&key)
}
