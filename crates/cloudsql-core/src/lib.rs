//! cloudsql-core — foundational types for the Cloud SQL connector.
//!
//! This crate carries the pieces shared by every layer of the connector
//! and deliberately performs no I/O:
//! - **instance**: instance connection names (`project:region:instance`)
//!   and IP address / authentication type enums
//! - **token**: OAuth2 access tokens with login-time validation
//! - **error**: the connector-wide error taxonomy
//! - **config**: driver-facing configuration parsed from property maps

pub mod config;
pub mod error;
pub mod instance;
pub mod token;

pub use config::ConnectorConfig;
pub use error::{ConnectorError, ConnectorResult};
pub use instance::{AuthType, InstanceName, IpType};
pub use token::AccessToken;
