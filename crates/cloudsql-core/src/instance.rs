//! Instance connection names and connection type enums.
//!
//! A Cloud SQL instance is addressed by its *connection name*,
//! `project:region:instance`. Projects scoped to an organization domain
//! use the four-part form `domain.com:project:region:instance`, where the
//! first two segments together form the project identifier.

use std::fmt;
use std::str::FromStr;

use crate::error::{ConnectorError, ConnectorResult};

// ── InstanceName ─────────────────────────────────────────────────────

/// A parsed, validated instance connection name.
///
/// Immutable once constructed. `Display` re-serializes the canonical
/// colon-joined form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceName {
    /// Organization domain when the project is domain-scoped.
    domain: Option<String>,
    project: String,
    region: String,
    instance: String,
}

impl InstanceName {
    /// Parse a connection name of the form `project:region:instance` or
    /// `domain:project:region:instance`.
    pub fn parse(s: &str) -> ConnectorResult<Self> {
        if s.chars().any(|c| c.is_ascii_control()) {
            return Err(ConnectorError::InvalidInstanceName(format!(
                "'{}' contains control characters",
                s.escape_default()
            )));
        }

        let parts: Vec<&str> = s.split(':').collect();
        let (domain, project, region, instance) = match parts.as_slice() {
            [p, r, i] => (None, *p, *r, *i),
            [d, p, r, i] => (Some(*d), *p, *r, *i),
            _ => {
                return Err(ConnectorError::InvalidInstanceName(format!(
                    "'{s}' must have the form project:region:instance"
                )));
            }
        };

        if project.is_empty()
            || region.is_empty()
            || instance.is_empty()
            || domain.is_some_and(str::is_empty)
        {
            return Err(ConnectorError::InvalidInstanceName(format!(
                "'{s}' has an empty segment"
            )));
        }

        Ok(Self {
            domain: domain.map(str::to_string),
            project: project.to_string(),
            region: region.to_string(),
            instance: instance.to_string(),
        })
    }

    /// The project identifier, including the organization domain prefix
    /// when present (`domain.com:project`).
    pub fn project_id(&self) -> String {
        match &self.domain {
            Some(d) => format!("{d}:{}", self.project),
            None => self.project.clone(),
        }
    }

    /// The region segment.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// The instance segment.
    pub fn instance_id(&self) -> &str {
        &self.instance
    }

    /// The full canonical connection name.
    pub fn connection_name(&self) -> String {
        self.to_string()
    }

    /// The identity the instance's TLS server certificate is expected to
    /// present: `project:instance` (domain-qualified when applicable).
    pub fn server_identity(&self) -> String {
        format!("{}:{}", self.project_id(), self.instance)
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.domain {
            Some(d) => write!(
                f,
                "{d}:{}:{}:{}",
                self.project, self.region, self.instance
            ),
            None => write!(f, "{}:{}:{}", self.project, self.region, self.instance),
        }
    }
}

impl FromStr for InstanceName {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ── IpType ───────────────────────────────────────────────────────────

/// The kind of IP address used to reach an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpType {
    /// The public IP address. Accepted spellings: `PRIMARY`, `PUBLIC`.
    Primary,
    /// The VPC-private IP address.
    Private,
    /// Private Service Connect.
    Psc,
}

impl IpType {
    /// Parse a single IP type name (case-insensitive). `PUBLIC` is a
    /// synonym for `PRIMARY`.
    pub fn parse(s: &str) -> ConnectorResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PRIMARY" | "PUBLIC" => Ok(IpType::Primary),
            "PRIVATE" => Ok(IpType::Private),
            "PSC" => Ok(IpType::Psc),
            other => Err(ConnectorError::Config(format!(
                "unsupported IP type '{other}'"
            ))),
        }
    }

    /// Parse a comma-separated preference list, e.g. `"PUBLIC,PRIVATE"`.
    /// The list must be non-empty; order is preserved.
    pub fn parse_preferences(s: &str) -> ConnectorResult<Vec<IpType>> {
        let prefs: Vec<IpType> = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(IpType::parse)
            .collect::<ConnectorResult<_>>()?;
        if prefs.is_empty() {
            return Err(ConnectorError::Config(
                "ipTypes preference list is empty".to_string(),
            ));
        }
        Ok(prefs)
    }

    /// The default preference order: public first, then private.
    pub fn default_preferences() -> Vec<IpType> {
        vec![IpType::Primary, IpType::Private]
    }
}

impl fmt::Display for IpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IpType::Primary => "PRIMARY",
            IpType::Private => "PRIVATE",
            IpType::Psc => "PSC",
        };
        f.write_str(s)
    }
}

// ── AuthType ─────────────────────────────────────────────────────────

/// How the database user authenticates once the TLS session is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthType {
    /// Built-in database username/password authentication.
    #[default]
    Password,
    /// Cloud IAM database authentication via a short-lived access token.
    Iam,
}
