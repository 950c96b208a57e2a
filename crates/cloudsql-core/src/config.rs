//! Driver-facing configuration.
//!
//! SQL driver integrations hand the connector a flat string property map
//! (JDBC-style). [`ConnectorConfig::from_properties`] validates the known
//! keys and warns on unknown ones for forward compatibility rather than
//! failing.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{ConnectorError, ConnectorResult};
use crate::instance::{AuthType, InstanceName, IpType};

/// Recognized property keys.
const KNOWN_KEYS: &[&str] = &[
    "cloudSqlInstance",
    "ipTypes",
    "enableIamAuth",
    "unixSocketPath",
    "credentialsFile",
    "oauth2Token",
];

/// Parsed connector configuration for a single instance.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// The target instance.
    pub instance: InstanceName,
    /// IP type preference order. First available wins.
    pub ip_preference: Vec<IpType>,
    /// Database-user authentication mode.
    pub auth_type: AuthType,
    /// When set, the driver shim connects to this Unix socket directly
    /// and the connector core is bypassed.
    pub unix_socket_path: Option<PathBuf>,
    /// Path to a credentials JSON file.
    pub credentials_file: Option<PathBuf>,
    /// A pre-minted OAuth2 token to use instead of a credentials file.
    pub oauth2_token: Option<String>,
}

impl ConnectorConfig {
    /// Configuration with defaults for the given instance: public IP
    /// preferred over private, password authentication.
    pub fn new(instance: InstanceName) -> Self {
        Self {
            instance,
            ip_preference: IpType::default_preferences(),
            auth_type: AuthType::Password,
            unix_socket_path: None,
            credentials_file: None,
            oauth2_token: None,
        }
    }

    /// Parse a driver property map.
    ///
    /// `cloudSqlInstance` is required. Unknown keys log a warning and are
    /// otherwise ignored.
    pub fn from_properties(props: &HashMap<String, String>) -> ConnectorResult<Self> {
        for key in props.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                tracing::warn!(property = %key, "unknown connector property, ignoring");
            }
        }

        let instance = props
            .get("cloudSqlInstance")
            .ok_or_else(|| {
                ConnectorError::Config("missing required property 'cloudSqlInstance'".to_string())
            })
            .and_then(|s| InstanceName::parse(s))?;

        let mut config = Self::new(instance);

        if let Some(ip_types) = props.get("ipTypes") {
            config.ip_preference = IpType::parse_preferences(ip_types)?;
        }

        if let Some(value) = props.get("enableIamAuth") {
            config.auth_type = match value.trim().to_ascii_lowercase().as_str() {
                "true" => AuthType::Iam,
                "false" => AuthType::Password,
                other => {
                    return Err(ConnectorError::Config(format!(
                        "enableIamAuth must be 'true' or 'false', got '{other}'"
                    )));
                }
            };
        }

        config.unix_socket_path = props.get("unixSocketPath").map(PathBuf::from);
        config.credentials_file = props.get("credentialsFile").map(PathBuf::from);
        config.oauth2_token = props.get("oauth2Token").cloned();

        Ok(config)
    }
}
