//! Server identity verification.
//!
//! An instance's TLS server certificate is not issued for a DNS name the
//! dialer could pass to ordinary hostname verification: legacy instances
//! present `project:instance` as the subject CN, newer ones additionally
//! carry SAN entries. Chain validation therefore runs against the pinned
//! instance CA (the sole trust anchor), and the subject identity is
//! matched here instead of by webpki name checks.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use cloudsql_core::{ConnectorError, ConnectorResult};

/// Verifies the peer chains to the pinned instance CA and presents the
/// expected instance identity.
#[derive(Debug)]
pub struct InstanceIdentityVerifier {
    chain: Arc<WebPkiServerVerifier>,
    expected: String,
}

impl InstanceIdentityVerifier {
    /// Build a verifier over a root store containing exactly the
    /// instance's server CA. `expected` is the `project:instance`
    /// identity the peer must present.
    pub fn new(roots: RootCertStore, expected: String) -> ConnectorResult<Self> {
        let chain = WebPkiServerVerifier::builder_with_provider(
            Arc::new(roots),
            Arc::new(rustls::crypto::ring::default_provider()),
        )
        .build()
        .map_err(|e| ConnectorError::TlsBuild(format!("server verifier: {e}")))?;
        Ok(Self { chain, expected })
    }

    /// Whether the certificate's subject CN or any SAN DNS entry equals
    /// the expected identity.
    fn identity_matches(&self, end_entity: &CertificateDer<'_>) -> Result<bool, TlsError> {
        let (_, cert) = X509Certificate::from_der(end_entity.as_ref())
            .map_err(|_| TlsError::InvalidCertificate(CertificateError::BadEncoding))?;

        for cn in cert.subject().iter_common_name() {
            if cn.as_str().is_ok_and(|s| s == self.expected) {
                return Ok(true);
            }
        }
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for general_name in &san.value.general_names {
                if let GeneralName::DNSName(dns) = general_name {
                    if *dns == self.expected {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }
}

impl ServerCertVerifier for InstanceIdentityVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        // Chain, signature, and validity-window checks run against the
        // pinned CA. The name the dialer passed is an IP address that
        // will not appear in the certificate, so a name mismatch from
        // webpki is expected and the identity is matched below instead.
        match self
            .chain
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(_) => {}
            Err(TlsError::InvalidCertificate(
                CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. },
            )) => {}
            Err(err) => return Err(err),
        }

        if self.identity_matches(end_entity)? {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(TlsError::InvalidCertificate(
                CertificateError::NotValidForName,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.chain.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.chain.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.chain.supported_verify_schemes()
    }
}
