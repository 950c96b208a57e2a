//! Connector error taxonomy.
//!
//! One enum covers every failure surface of the connector. Variants carry
//! owned strings rather than source errors so a single refresh outcome can
//! be cloned out to every caller awaiting the same cached result.

use thiserror::Error;

/// Result type alias for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Errors produced by the connector.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectorError {
    /// The instance connection name did not parse.
    #[error("invalid instance connection name: {0}")]
    InvalidInstanceName(String),

    /// The Admin API rejected the caller's credentials (HTTP 401/403).
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The instance does not exist (HTTP 404).
    #[error("instance not found: {0}")]
    NotFound(String),

    /// A retryable Admin API failure (HTTP 5xx, timeout, transport error).
    #[error("transient Admin API failure: {0}")]
    TransientApi(String),

    /// IAM database authentication was requested on an engine that does
    /// not support it.
    #[error("[{instance}] IAM Authentication is not supported for SQL Server instances")]
    IamUnsupported {
        /// The instance connection name.
        instance: String,
    },

    /// The database-user access token is unusable.
    #[error("invalid access token: {0}")]
    TokenInvalid(String),

    /// The TLS peer presented a certificate for a different instance.
    #[error("[{instance}] server certificate does not match expected instance identity")]
    ServerIdentityMismatch {
        /// The instance connection name.
        instance: String,
    },

    /// The TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// The TCP connection could not be established, or no usable IP
    /// address was available.
    #[error("connection failed: {0}")]
    DialFailed(String),

    /// The instance entry or registry has been shut down.
    #[error("[{0}] connector has been shut down")]
    EntryClosed(String),

    /// A local TLS configuration could not be assembled.
    #[error("TLS configuration error: {0}")]
    TlsBuild(String),

    /// A configuration property was malformed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ConnectorError {
    /// Whether a bounded retry of the same operation may succeed.
    ///
    /// Only transient Admin API failures qualify; everything else either
    /// reflects caller input, credentials, or terminal state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectorError::TransientApi(_))
    }
}
