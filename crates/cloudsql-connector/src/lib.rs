//! cloudsql-connector — authenticated TLS sockets to Cloud SQL instances.
//!
//! Given an instance connection name (`project:region:instance`), the
//! connector resolves the instance's current addresses, maintains a
//! short-lived client certificate signed by the instance CA, and dials
//! mutually-authenticated TLS sockets for SQL drivers to run their wire
//! protocol over. No connection pooling, no protocol awareness.
//!
//! # Architecture
//!
//! ```text
//! Connector (registry)
//!   ├── InstanceEntry per connection name
//!   │   ├── current/next refresh slots (at most one refresh in flight)
//!   │   ├── proactive refresh: expiration − buffer, jittered
//!   │   └── InstanceData = settings + ephemeral cert + rustls config
//!   ├── shared: KeyPairSource (one RSA-2048 pair per process)
//!   ├── shared: CredentialSource (API + IAM tokens)
//!   ├── shared: ConnectApi (Admin API fetcher, retried with backoff)
//!   └── shared: RefreshScheduler (delayed tasks, closed on shutdown)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cloudsql_connector::{AccessToken, AuthType, Connector, IpType};
//! use cloudsql_connector::credentials::StaticTokenSource;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = Connector::builder()
//!     .credentials(Arc::new(StaticTokenSource::new(AccessToken::new("token"))))
//!     .build()?;
//!
//! let socket = connector
//!     .connect("my-project:us-central1:my-db", AuthType::Password, &[IpType::Primary])
//!     .await?;
//! // Hand `socket` (std Read + Write) to the database driver.
//! connector.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod credentials;
pub mod dial;
pub mod entry;
pub mod keys;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod verify;

pub use admin::{AdminApiClient, ConnectApi, EphemeralCertificate, InstanceMetadata};
pub use credentials::{resolve_credentials, CredentialSource};
pub use dial::{InstanceData, TlsSocket, DEFAULT_SERVER_PORT};
pub use entry::{InstanceEntry, RefreshOptions};
pub use keys::{ClientKeyPair, KeyPairSource};
pub use registry::{Connector, ConnectorBuilder, ConnectorOptions};
pub use retry::RetryPolicy;
pub use scheduler::RefreshScheduler;

pub use cloudsql_core::{
    AccessToken, AuthType, ConnectorConfig, ConnectorError, ConnectorResult, InstanceName, IpType,
};
