//! Shared test fixtures: a scriptable control-plane mock and an
//! in-process TLS echo server.
//!
//! The mock owns the connector's client key pair, so the ephemeral
//! certificates it signs are valid for the key the connector actually
//! presents during the handshake.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::PrivateKeyDer;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

use cloudsql_connector::{
    AccessToken, ConnectApi, ConnectorError, ConnectorResult, EphemeralCertificate, InstanceMetadata,
    InstanceName, IpType, KeyPairSource,
};

/// RSA generation is expensive; share one key across the test binary.
pub fn test_rsa_key() -> RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
        .clone()
}

struct Pki {
    ca_key: rcgen::KeyPair,
    ca_cert: rcgen::Certificate,
}

impl Pki {
    fn new() -> Self {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Self { ca_key, ca_cert }
    }
}

/// Scriptable [`ConnectApi`] implementation backed by a real test CA.
pub struct MockAdminApi {
    pki: Pki,
    /// A second CA nothing trusts, for simulating invalidated certs.
    stale_pki: Pki,
    client_key: rcgen::KeyPair,
    client_public_pem: String,
    keys: Arc<KeyPairSource>,
    server_identity: Mutex<String>,
    database_version: String,
    ip_addrs: Mutex<HashMap<IpType, String>>,
    cert_lifetime: Mutex<Duration>,
    issue_stale_cert_once: AtomicBool,
    pub settings_calls: AtomicU32,
    pub cert_calls: AtomicU32,
}

impl MockAdminApi {
    pub fn new(instance: &str, database_version: &str) -> Arc<Self> {
        let name: InstanceName = instance.parse().unwrap();
        let rsa = test_rsa_key();
        let keys = Arc::new(KeyPairSource::from_private_key(&rsa).unwrap());

        let pkcs8 = rsa.to_pkcs8_der().unwrap().as_bytes().to_vec();
        let client_key = rcgen::KeyPair::from_pkcs8_der_and_sign_algo(
            &pkcs8.into(),
            &rcgen::PKCS_RSA_SHA256,
        )
        .unwrap();

        let mut ip_addrs = HashMap::new();
        ip_addrs.insert(IpType::Primary, "127.0.0.1".to_string());

        let client_public_pem = {
            use rsa::pkcs8::EncodePublicKey;
            rsa.to_public_key()
                .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
                .unwrap()
        };

        Arc::new(Self {
            pki: Pki::new(),
            stale_pki: Pki::new(),
            client_key,
            client_public_pem,
            keys,
            server_identity: Mutex::new(name.server_identity()),
            database_version: database_version.to_string(),
            ip_addrs: Mutex::new(ip_addrs),
            cert_lifetime: Mutex::new(Duration::from_secs(3600)),
            issue_stale_cert_once: AtomicBool::new(false),
            settings_calls: AtomicU32::new(0),
            cert_calls: AtomicU32::new(0),
        })
    }

    /// The key pair source to hand to the connector under test.
    pub fn key_source(&self) -> Arc<KeyPairSource> {
        self.keys.clone()
    }

    pub fn set_cert_lifetime(&self, lifetime: Duration) {
        *self.cert_lifetime.lock().unwrap() = lifetime;
    }

    pub fn set_ip_addrs(&self, addrs: &[(IpType, &str)]) {
        *self.ip_addrs.lock().unwrap() = addrs
            .iter()
            .map(|(t, ip)| (*t, ip.to_string()))
            .collect();
    }

    /// Present a different identity in the server certificate than the
    /// connector expects.
    pub fn set_server_identity(&self, identity: &str) {
        *self.server_identity.lock().unwrap() = identity.to_string();
    }

    /// The next issued ephemeral certificate is signed by a CA the
    /// server does not trust; the one after is good again.
    pub fn invalidate_next_cert(&self) {
        self.issue_stale_cert_once.store(true, Ordering::SeqCst);
    }

    /// Build the instance server's TLS configuration: a certificate for
    /// the expected identity, client auth required against the test CA.
    fn server_config(
        &self,
        versions: &[&'static rustls::SupportedProtocolVersion],
    ) -> Arc<ServerConfig> {
        let server_key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::default();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(
            rcgen::DnType::CommonName,
            self.server_identity.lock().unwrap().clone(),
        );
        params.distinguished_name = dn;
        let server_cert = params
            .signed_by(&server_key, &self.pki.ca_cert, &self.pki.ca_key)
            .unwrap();

        let mut client_roots = RootCertStore::empty();
        client_roots.add(self.pki.ca_cert.der().clone()).unwrap();
        let client_verifier = WebPkiClientVerifier::builder_with_provider(
            Arc::new(client_roots),
            Arc::new(rustls::crypto::ring::default_provider()),
        )
        .build()
        .unwrap();

        let key_der = PrivateKeyDer::try_from(server_key.serialize_der()).unwrap();
        let config = ServerConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_protocol_versions(versions)
        .unwrap()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(vec![server_cert.der().clone()], key_der)
        .unwrap();
        Arc::new(config)
    }

    /// Start a TLS echo server for this instance. Returns its address.
    pub fn start_server(
        &self,
        versions: &[&'static rustls::SupportedProtocolVersion],
    ) -> SocketAddr {
        let config = self.server_config(versions);
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().unwrap();

        std::thread::spawn(move || {
            while let Ok((tcp, _)) = listener.accept() {
                let config = config.clone();
                std::thread::spawn(move || {
                    use std::io::{Read, Write};
                    let conn = match rustls::ServerConnection::new(config) {
                        Ok(conn) => conn,
                        Err(_) => return,
                    };
                    let mut stream = rustls::StreamOwned::new(conn, tcp);
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }
}

#[async_trait]
impl ConnectApi for MockAdminApi {
    async fn connect_settings(&self, _name: &InstanceName) -> ConnectorResult<InstanceMetadata> {
        self.settings_calls.fetch_add(1, Ordering::SeqCst);
        Ok(InstanceMetadata {
            ip_addrs: self.ip_addrs.lock().unwrap().clone(),
            server_ca_cert: self.pki.ca_cert.der().clone(),
            database_version: self.database_version.clone(),
        })
    }

    async fn generate_ephemeral_cert(
        &self,
        _name: &InstanceName,
        public_key_pem: &str,
        _db_user_token: Option<&AccessToken>,
    ) -> ConnectorResult<EphemeralCertificate> {
        self.cert_calls.fetch_add(1, Ordering::SeqCst);
        if public_key_pem != self.client_public_pem {
            return Err(ConnectorError::TlsBuild(
                "mock received an unexpected public key".to_string(),
            ));
        }

        let lifetime = *self.cert_lifetime.lock().unwrap();
        let not_after = SystemTime::now() + lifetime;
        let mut params = rcgen::CertificateParams::default();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, "Cloud SQL Client");
        params.distinguished_name = dn;
        params.not_after = not_after.into();

        let issuer = if self.issue_stale_cert_once.swap(false, Ordering::SeqCst) {
            &self.stale_pki
        } else {
            &self.pki
        };
        let cert = params
            .signed_by(&self.client_key, &issuer.ca_cert, &issuer.ca_key)
            .map_err(|e| ConnectorError::TlsBuild(format!("mock signing: {e}")))?;

        Ok(EphemeralCertificate {
            cert: cert.der().clone(),
            not_after,
        })
    }
}
