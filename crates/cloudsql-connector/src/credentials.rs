//! Credential source contracts and basic implementations.
//!
//! The connector consumes OAuth2 bearer tokens for two purposes: Admin
//! API calls, and (under IAM database authentication) the database
//! user's login credential. Full OAuth2/ADC token exchange is an external
//! collaborator; this module defines the contract plus the two sources
//! the connector provides out of the box: a static token and a
//! pre-minted-token JSON file (with the conventional
//! `GOOGLE_APPLICATION_CREDENTIALS` fallback).

use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use cloudsql_core::{AccessToken, ConnectorConfig, ConnectorError, ConnectorResult};

/// Conventional environment variable pointing at a credentials file.
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Yields OAuth2 bearer credentials.
///
/// `api_token` authenticates control-plane calls; `db_user_token` is the
/// IAM database-authentication token whose principal must match the
/// database user name.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// A token for Admin API calls.
    async fn api_token(&self) -> ConnectorResult<AccessToken>;

    /// A token for IAM database authentication.
    async fn db_user_token(&self) -> ConnectorResult<AccessToken>;
}

// ── StaticTokenSource ────────────────────────────────────────────────

/// A fixed token supplied directly by the caller (the `oauth2Token`
/// property).
pub struct StaticTokenSource {
    token: AccessToken,
}

impl StaticTokenSource {
    pub fn new(token: AccessToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialSource for StaticTokenSource {
    async fn api_token(&self) -> ConnectorResult<AccessToken> {
        Ok(self.token.clone())
    }

    async fn db_user_token(&self) -> ConnectorResult<AccessToken> {
        Ok(self.token.clone())
    }
}

// ── CredentialsFileSource ────────────────────────────────────────────

/// The subset of a credentials JSON file the connector reads.
#[derive(Debug, Deserialize)]
struct CredentialsFile {
    access_token: String,
    /// Unix timestamp (seconds) of token expiry, when known.
    #[serde(default)]
    expiry_epoch_seconds: Option<u64>,
}

/// Reads a pre-minted token from a JSON file on every call, so an
/// external refresher can rotate the file contents underneath us.
pub struct CredentialsFileSource {
    path: PathBuf,
}

impl CredentialsFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_token(&self) -> ConnectorResult<AccessToken> {
        let bytes = std::fs::read(&self.path).map_err(|e| {
            ConnectorError::Config(format!(
                "failed to read credentials file {}: {e}",
                self.path.display()
            ))
        })?;
        let parsed: CredentialsFile = serde_json::from_slice(&bytes).map_err(|e| {
            ConnectorError::Config(format!(
                "failed to parse credentials file {}: {e}",
                self.path.display()
            ))
        })?;
        let token = match parsed.expiry_epoch_seconds {
            Some(secs) => AccessToken::with_expiry(
                parsed.access_token,
                UNIX_EPOCH + Duration::from_secs(secs),
            ),
            None => AccessToken::new(parsed.access_token),
        };
        Ok(token)
    }
}

#[async_trait]
impl CredentialSource for CredentialsFileSource {
    async fn api_token(&self) -> ConnectorResult<AccessToken> {
        self.read_token()
    }

    async fn db_user_token(&self) -> ConnectorResult<AccessToken> {
        self.read_token()
    }
}

// ── Resolution ───────────────────────────────────────────────────────

/// Pick a credential source for the given configuration: an explicit
/// token wins, then an explicit file, then `GOOGLE_APPLICATION_CREDENTIALS`.
pub fn resolve_credentials(
    config: &ConnectorConfig,
) -> ConnectorResult<std::sync::Arc<dyn CredentialSource>> {
    if let Some(token) = &config.oauth2_token {
        debug!("using static oauth2Token credential source");
        return Ok(std::sync::Arc::new(StaticTokenSource::new(
            AccessToken::new(token.clone()),
        )));
    }
    if let Some(path) = &config.credentials_file {
        debug!(path = %path.display(), "using credentialsFile credential source");
        return Ok(std::sync::Arc::new(CredentialsFileSource::new(path)));
    }
    if let Ok(path) = std::env::var(CREDENTIALS_ENV) {
        debug!(path = %path, "using {CREDENTIALS_ENV} credential source");
        return Ok(std::sync::Arc::new(CredentialsFileSource::new(
            Path::new(&path),
        )));
    }
    Err(ConnectorError::Config(format!(
        "no credential source configured: set oauth2Token, credentialsFile, or {CREDENTIALS_ENV}"
    )))
}
