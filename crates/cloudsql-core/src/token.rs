//! OAuth2 access tokens.
//!
//! Tokens are produced by a credential source and consumed in two places:
//! as bearer credentials on Admin API calls, and as the database user's
//! password when IAM database authentication is enabled. The latter use
//! requires the token to be non-empty and unexpired at refresh time.

use std::time::SystemTime;

use crate::error::{ConnectorError, ConnectorResult};

/// An OAuth2 access token with an optional expiration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    token: String,
    expires_at: Option<SystemTime>,
}

impl AccessToken {
    /// A token without a known expiration.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    /// A token that expires at the given time.
    pub fn with_expiry(token: impl Into<String>, expires_at: SystemTime) -> Self {
        Self {
            token: token.into(),
            expires_at: Some(expires_at),
        }
    }

    /// The raw token value.
    pub fn secret(&self) -> &str {
        &self.token
    }

    /// When the token expires, if known.
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    /// Whether the token's expiration time has passed.
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|at| at <= SystemTime::now())
    }

    /// Validate that this token is usable as an IAM database login
    /// credential right now.
    pub fn validate_for_login(&self) -> ConnectorResult<()> {
        if self.token.is_empty() {
            return Err(ConnectorError::TokenInvalid(
                "Access Token has length of zero".to_string(),
            ));
        }
        if self.is_expired() {
            return Err(ConnectorError::TokenInvalid(
                "Access Token expiration time is in the past".to_string(),
            ));
        }
        Ok(())
    }
}
