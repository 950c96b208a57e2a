//! Admin API fetcher.
//!
//! Two control-plane calls feed the per-instance cache: `connectSettings`
//! (IP addresses, server CA certificate, database engine version) and
//! `generateEphemeralCert` (a short-lived client certificate signed for
//! the shared public key). [`ConnectApi`] is the seam the refresh state
//! machine consumes; [`AdminApiClient`] is the HTTPS implementation.

pub mod types;

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use tracing::debug;
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

use cloudsql_core::{AccessToken, ConnectorError, ConnectorResult, InstanceName, IpType};

use crate::credentials::CredentialSource;
use types::{
    ConnectSettingsResponse, GenerateEphemeralCertRequest, GenerateEphemeralCertResponse,
};

/// Production Admin API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://sqladmin.googleapis.com";

// ── Fetched artifacts ────────────────────────────────────────────────

/// Instance connection settings fetched from the control plane.
#[derive(Debug, Clone)]
pub struct InstanceMetadata {
    /// Reachable IP addresses by type. Unknown types in the response are
    /// dropped.
    pub ip_addrs: HashMap<IpType, String>,
    /// The instance server CA certificate, DER-encoded.
    pub server_ca_cert: CertificateDer<'static>,
    /// Engine version string, e.g. `POSTGRES_14`.
    pub database_version: String,
}

impl InstanceMetadata {
    /// Whether the engine belongs to the SQL Server family, which does
    /// not support IAM database authentication.
    pub fn is_sql_server(&self) -> bool {
        self.database_version
            .to_ascii_uppercase()
            .starts_with("SQLSERVER")
    }
}

/// A short-lived client certificate issued by the instance CA.
#[derive(Debug, Clone)]
pub struct EphemeralCertificate {
    /// The certificate, DER-encoded, ready for rustls client auth.
    pub cert: CertificateDer<'static>,
    /// Certificate `notAfter`.
    pub not_after: SystemTime,
}

// ── ConnectApi ───────────────────────────────────────────────────────

/// The control-plane operations the refresh state machine performs.
#[async_trait]
pub trait ConnectApi: Send + Sync {
    /// Fetch the instance's connection settings.
    async fn connect_settings(&self, name: &InstanceName) -> ConnectorResult<InstanceMetadata>;

    /// Submit the shared public key (and, for IAM authentication, the
    /// database user's access token) and receive a signed ephemeral
    /// client certificate.
    async fn generate_ephemeral_cert(
        &self,
        name: &InstanceName,
        public_key_pem: &str,
        db_user_token: Option<&AccessToken>,
    ) -> ConnectorResult<EphemeralCertificate>;
}

// ── AdminApiClient ───────────────────────────────────────────────────

/// HTTPS implementation of [`ConnectApi`] backed by the `sqladmin`
/// v1beta4 surface.
pub struct AdminApiClient {
    http: reqwest::Client,
    base_url: String,
    credentials: std::sync::Arc<dyn CredentialSource>,
}

impl AdminApiClient {
    /// A client against the production endpoint.
    pub fn new(credentials: std::sync::Arc<dyn CredentialSource>) -> Self {
        Self::with_base_url(credentials, DEFAULT_BASE_URL)
    }

    /// A client against a custom endpoint (tests, private API gateways).
    pub fn with_base_url(
        credentials: std::sync::Arc<dyn CredentialSource>,
        base_url: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client construction cannot fail with static options"),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn settings_url(&self, name: &InstanceName) -> String {
        format!(
            "{}/sql/v1beta4/projects/{}/instances/{}/connectSettings",
            self.base_url,
            name.project_id(),
            name.instance_id()
        )
    }

    fn cert_url(&self, name: &InstanceName) -> String {
        format!(
            "{}/sql/v1beta4/projects/{}/instances/{}:generateEphemeralCert",
            self.base_url,
            name.project_id(),
            name.instance_id()
        )
    }

    /// Map an HTTP response status to the error taxonomy. 401/403 and
    /// 404 are terminal; everything else unexpected is transient.
    async fn check_status(
        name: &InstanceName,
        resp: reqwest::Response,
    ) -> ConnectorResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let detail = format!("[{name}] Admin API returned {status}: {body}");
        match status.as_u16() {
            401 | 403 => Err(ConnectorError::NotAuthorized(detail)),
            404 => Err(ConnectorError::NotFound(detail)),
            _ => Err(ConnectorError::TransientApi(detail)),
        }
    }
}

#[async_trait]
impl ConnectApi for AdminApiClient {
    async fn connect_settings(&self, name: &InstanceName) -> ConnectorResult<InstanceMetadata> {
        let token = self.credentials.api_token().await?;
        let resp = self
            .http
            .get(self.settings_url(name))
            .bearer_auth(token.secret())
            .send()
            .await
            .map_err(|e| ConnectorError::TransientApi(format!("[{name}] connectSettings: {e}")))?;
        let resp = Self::check_status(name, resp).await?;
        let settings: ConnectSettingsResponse = resp.json().await.map_err(|e| {
            ConnectorError::TransientApi(format!("[{name}] malformed connectSettings body: {e}"))
        })?;

        let mut ip_addrs = HashMap::new();
        for mapping in settings.ip_addresses {
            match IpType::parse(&mapping.kind) {
                Ok(kind) => {
                    ip_addrs.insert(kind, mapping.ip_address);
                }
                Err(_) => {
                    debug!(instance = %name, ip_type = %mapping.kind, "skipping unrecognized IP type");
                }
            }
        }

        let ca_pem = settings
            .server_ca_cert
            .map(|block| block.cert)
            .ok_or_else(|| {
                ConnectorError::TransientApi(format!(
                    "[{name}] connectSettings response is missing serverCaCert"
                ))
            })?;
        let (server_ca_cert, _) = parse_certificate_pem(&ca_pem)?;

        debug!(
            instance = %name,
            ip_types = ip_addrs.len(),
            version = %settings.database_version,
            "fetched connect settings"
        );
        Ok(InstanceMetadata {
            ip_addrs,
            server_ca_cert,
            database_version: settings.database_version,
        })
    }

    async fn generate_ephemeral_cert(
        &self,
        name: &InstanceName,
        public_key_pem: &str,
        db_user_token: Option<&AccessToken>,
    ) -> ConnectorResult<EphemeralCertificate> {
        let token = self.credentials.api_token().await?;
        let body = GenerateEphemeralCertRequest {
            public_key: public_key_pem,
            access_token: db_user_token.map(|t| t.secret()),
        };
        let resp = self
            .http
            .post(self.cert_url(name))
            .bearer_auth(token.secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ConnectorError::TransientApi(format!("[{name}] generateEphemeralCert: {e}"))
            })?;
        let resp = Self::check_status(name, resp).await?;
        let issued: GenerateEphemeralCertResponse = resp.json().await.map_err(|e| {
            ConnectorError::TransientApi(format!(
                "[{name}] malformed generateEphemeralCert body: {e}"
            ))
        })?;

        let (cert, not_after) = parse_certificate_pem(&issued.ephemeral_cert.cert)?;
        debug!(instance = %name, not_after = ?not_after, "issued ephemeral client certificate");
        Ok(EphemeralCertificate { cert, not_after })
    }
}

// ── PEM parsing ──────────────────────────────────────────────────────

/// Decode the first certificate of a PEM blob and extract its `notAfter`.
pub fn parse_certificate_pem(
    pem: &str,
) -> ConnectorResult<(CertificateDer<'static>, SystemTime)> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    let der = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| ConnectorError::TlsBuild("PEM blob contains no certificate".to_string()))?
        .map_err(|e| ConnectorError::TlsBuild(format!("PEM decode: {e}")))?;

    let (_, parsed) = X509Certificate::from_der(der.as_ref())
        .map_err(|e| ConnectorError::TlsBuild(format!("certificate parse: {e}")))?;
    let seconds = parsed.validity().not_after.timestamp();
    let not_after = if seconds >= 0 {
        UNIX_EPOCH + Duration::from_secs(seconds as u64)
    } else {
        UNIX_EPOCH
    };
    Ok((der, not_after))
}
