//! Admin API wire types.
//!
//! Field names here are wire-compatible with the `sqladmin` v1beta4
//! surface; the request body mixes camelCase and snake_case exactly as
//! the service expects, so every field is renamed explicitly.

use serde::{Deserialize, Serialize};

/// `GET .../connectSettings` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectSettingsResponse {
    #[serde(rename = "ipAddresses", default)]
    pub ip_addresses: Vec<IpMapping>,
    #[serde(rename = "serverCaCert")]
    pub server_ca_cert: Option<CertBlock>,
    #[serde(rename = "databaseVersion", default)]
    pub database_version: String,
}

/// One entry of the `ipAddresses` list.
#[derive(Debug, Clone, Deserialize)]
pub struct IpMapping {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "ipAddress", default)]
    pub ip_address: String,
}

/// A PEM certificate wrapper object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertBlock {
    pub cert: String,
}

/// `POST .../:generateEphemeralCert` request body.
#[derive(Debug, Serialize)]
pub struct GenerateEphemeralCertRequest<'a> {
    #[serde(rename = "publicKey")]
    pub public_key: &'a str,
    #[serde(rename = "access_token", skip_serializing_if = "Option::is_none")]
    pub access_token: Option<&'a str>,
}

/// `POST .../:generateEphemeralCert` response body.
#[derive(Debug, Deserialize)]
pub struct GenerateEphemeralCertResponse {
    #[serde(rename = "ephemeralCert")]
    pub ephemeral_cert: CertBlock,
}
