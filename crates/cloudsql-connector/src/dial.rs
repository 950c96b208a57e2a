//! TLS assembly and socket dialing.
//!
//! The cached artifact per instance is an [`InstanceData`]: the fetched
//! connection settings, the current ephemeral client certificate, and a
//! ready-to-dial `rustls::ClientConfig` pinned to the instance's server
//! CA. Dialing opens a TCP connection to the selected IP, drives the TLS
//! handshake to completion, and hands the caller a plain byte-stream
//! socket.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use tracing::debug;

use cloudsql_core::{ConnectorError, ConnectorResult, InstanceName, IpType};

use crate::admin::{EphemeralCertificate, InstanceMetadata};
use crate::keys::ClientKeyPair;
use crate::verify::InstanceIdentityVerifier;

/// The port the instance's server-side proxy listens on.
pub const DEFAULT_SERVER_PORT: u16 = 3307;

// ── InstanceData ─────────────────────────────────────────────────────

/// Everything needed to dial one instance, cached between refreshes.
#[derive(Debug)]
pub struct InstanceData {
    metadata: InstanceMetadata,
    client_cert: EphemeralCertificate,
    tls: Arc<ClientConfig>,
    expiration: SystemTime,
}

impl InstanceData {
    pub fn new(
        metadata: InstanceMetadata,
        client_cert: EphemeralCertificate,
        tls: Arc<ClientConfig>,
        expiration: SystemTime,
    ) -> Self {
        Self {
            metadata,
            client_cert,
            tls,
            expiration,
        }
    }

    pub fn metadata(&self) -> &InstanceMetadata {
        &self.metadata
    }

    pub fn client_cert(&self) -> &EphemeralCertificate {
        &self.client_cert
    }

    /// When this data stops being usable: the certificate's `notAfter`,
    /// or the IAM token expiry if that comes first.
    pub fn expiration(&self) -> SystemTime {
        self.expiration
    }

    pub fn expired_at(&self, now: SystemTime) -> bool {
        self.expiration <= now
    }

    /// Select the dial address: the first preference present in the
    /// instance's IP map wins.
    pub fn preferred_ip(
        &self,
        name: &InstanceName,
        preferences: &[IpType],
    ) -> ConnectorResult<(IpType, String)> {
        for preference in preferences {
            if let Some(ip) = self.metadata.ip_addrs.get(preference) {
                return Ok((*preference, ip.clone()));
            }
        }
        let available: Vec<String> = self
            .metadata
            .ip_addrs
            .keys()
            .map(ToString::to_string)
            .collect();
        Err(ConnectorError::DialFailed(format!(
            "[{name}] no matching IP type: requested [{}], instance has [{}]",
            join(preferences),
            available.join(", ")
        )))
    }
}

fn join(types: &[IpType]) -> String {
    types
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// ── TLS configuration ────────────────────────────────────────────────

/// Assemble the client TLS configuration for one instance: trust exactly
/// the instance server CA, present the ephemeral certificate with the
/// shared private key, TLS 1.2 or newer.
pub fn build_client_config(
    name: &InstanceName,
    metadata: &InstanceMetadata,
    client_cert: &EphemeralCertificate,
    keys: &ClientKeyPair,
) -> ConnectorResult<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots
        .add(metadata.server_ca_cert.clone())
        .map_err(|e| ConnectorError::TlsBuild(format!("server CA rejected: {e}")))?;

    let verifier = InstanceIdentityVerifier::new(roots, name.server_identity())?;

    let private_key =
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(keys.pkcs8_der().to_vec()));
    let config = ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .map_err(|e| ConnectorError::TlsBuild(format!("protocol versions: {e}")))?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(verifier))
    .with_client_auth_cert(vec![client_cert.cert.clone()], private_key)
    .map_err(|e| ConnectorError::TlsBuild(format!("client auth: {e}")))?;

    Ok(Arc::new(config))
}

// ── Dialing ──────────────────────────────────────────────────────────

/// An established, mutually-authenticated TLS socket to an instance.
///
/// Plain blocking `Read`/`Write`; drivers layer their wire protocol on
/// top without the connector inspecting a byte of it.
pub struct TlsSocket {
    stream: StreamOwned<ClientConnection, TcpStream>,
}

impl TlsSocket {
    /// The underlying TCP stream, e.g. for timeout configuration.
    pub fn tcp_stream(&self) -> &TcpStream {
        &self.stream.sock
    }

    /// Shut down the connection.
    pub fn close(&mut self) {
        let _ = self.stream.conn.send_close_notify();
        let _ = self.stream.flush();
        let _ = self.stream.sock.shutdown(std::net::Shutdown::Both);
    }
}

impl std::fmt::Debug for TlsSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSocket")
            .field("peer", &self.stream.sock.peer_addr().ok())
            .finish()
    }
}

impl Read for TlsSocket {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TlsSocket {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

/// Dial `ip:port` and complete the TLS handshake with the instance's
/// current client certificate. Blocking; run on a worker thread.
pub fn connect(
    name: &InstanceName,
    data: &InstanceData,
    ip: &str,
    port: u16,
    connect_timeout: Duration,
) -> ConnectorResult<TlsSocket> {
    let ip_addr: IpAddr = ip.parse().map_err(|e| {
        ConnectorError::DialFailed(format!("[{name}] invalid instance IP '{ip}': {e}"))
    })?;
    let addr = SocketAddr::new(ip_addr, port);

    let stream = TcpStream::connect_timeout(&addr, connect_timeout)
        .map_err(|e| ConnectorError::DialFailed(format!("[{name}] tcp connect to {addr}: {e}")))?;
    let _ = stream.set_nodelay(true);
    // Bound the handshake by the same deadline as the connect.
    stream
        .set_read_timeout(Some(connect_timeout))
        .map_err(|e| ConnectorError::DialFailed(format!("[{name}] socket setup: {e}")))?;

    debug!(instance = %name, %addr, "tcp connection established, starting TLS handshake");

    let server_name = ServerName::from(ip_addr);
    let mut conn = ClientConnection::new(data.tls.clone(), server_name)
        .map_err(|e| ConnectorError::HandshakeFailed(format!("[{name}] session setup: {e}")))?;

    let mut stream = stream;
    while conn.is_handshaking() {
        conn.complete_io(&mut stream)
            .map_err(|e| map_handshake_error(name, &e))?;
    }

    stream
        .set_read_timeout(None)
        .map_err(|e| ConnectorError::DialFailed(format!("[{name}] socket setup: {e}")))?;

    debug!(instance = %name, %addr, "TLS handshake complete");
    Ok(TlsSocket {
        stream: StreamOwned::new(conn, stream),
    })
}

/// Distinguish an identity rejection from other handshake failures.
/// rustls surfaces verifier errors through `io::Error` with the TLS
/// error attached as the inner cause.
fn map_handshake_error(name: &InstanceName, err: &std::io::Error) -> ConnectorError {
    if let Some(inner) = err.get_ref() {
        if let Some(tls_err) = inner.downcast_ref::<rustls::Error>() {
            if matches!(
                tls_err,
                rustls::Error::InvalidCertificate(
                    rustls::CertificateError::NotValidForName
                        | rustls::CertificateError::NotValidForNameContext { .. }
                )
            ) {
                return ConnectorError::ServerIdentityMismatch {
                    instance: name.connection_name(),
                };
            }
        }
    }
    ConnectorError::HandshakeFailed(format!("[{name}] {err}"))
}
