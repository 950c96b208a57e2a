//! The connector registry — the caller-facing surface.
//!
//! A [`Connector`] owns the process-wide map from instance connection
//! name to [`InstanceEntry`], plus everything the entries share: the
//! client key pair, the credential source, the Admin API client, and the
//! refresh scheduler. Entries are created on first use and live until
//! `shutdown()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use cloudsql_core::{
    AuthType, ConnectorConfig, ConnectorError, ConnectorResult, InstanceName, IpType,
};

use crate::admin::{AdminApiClient, ConnectApi, InstanceMetadata};
use crate::credentials::{resolve_credentials, CredentialSource};
use crate::dial::{self, TlsSocket, DEFAULT_SERVER_PORT};
use crate::entry::{InstanceEntry, RefreshOptions};
use crate::keys::KeyPairSource;
use crate::retry::RetryPolicy;
use crate::scheduler::RefreshScheduler;

/// Connector-wide tuning.
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// Port of the instance's server-side proxy.
    pub server_port: u16,
    /// Deadline for the TCP connect and the TLS handshake.
    pub connect_timeout: Duration,
    /// Retry policy around Admin API calls.
    pub retry: RetryPolicy,
    /// Refresh cycle tuning shared by all entries.
    pub refresh: RefreshOptions,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_SERVER_PORT,
            connect_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            refresh: RefreshOptions::default(),
        }
    }
}

/// Builder for [`Connector`].
#[derive(Default)]
pub struct ConnectorBuilder {
    credentials: Option<Arc<dyn CredentialSource>>,
    api: Option<Arc<dyn ConnectApi>>,
    keys: Option<Arc<KeyPairSource>>,
    options: Option<ConnectorOptions>,
}

impl ConnectorBuilder {
    /// The credential source for Admin API and IAM tokens. Required.
    pub fn credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Override the Admin API implementation (tests, private gateways).
    /// Defaults to [`AdminApiClient`] against the production endpoint.
    pub fn api(mut self, api: Arc<dyn ConnectApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Override the client key pair source. Defaults to a lazily
    /// generated process-wide RSA-2048 pair.
    pub fn keys(mut self, keys: Arc<KeyPairSource>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn options(mut self, options: ConnectorOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn build(self) -> ConnectorResult<Connector> {
        let credentials = self.credentials.ok_or_else(|| {
            ConnectorError::Config("a credential source is required".to_string())
        })?;
        let custom_api = self.api.is_some();
        let api = self
            .api
            .unwrap_or_else(|| Arc::new(AdminApiClient::new(credentials.clone())));
        Ok(Connector {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                keys: self.keys.unwrap_or_else(|| Arc::new(KeyPairSource::new())),
                credentials,
                api,
                custom_api,
                scheduler: RefreshScheduler::new(),
                options: self.options.unwrap_or_default(),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

struct Inner {
    entries: Mutex<HashMap<String, Arc<InstanceEntry>>>,
    keys: Arc<KeyPairSource>,
    credentials: Arc<dyn CredentialSource>,
    api: Arc<dyn ConnectApi>,
    /// Whether `api` was injected by the builder rather than being the
    /// default HTTPS client; injected implementations carry their own
    /// authentication and are never rebuilt per entry.
    custom_api: bool,
    scheduler: Arc<RefreshScheduler>,
    options: ConnectorOptions,
    shut_down: AtomicBool,
}

/// The process-wide connector. Cheap to clone; all clones share the same
/// registry and lifecycle.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

impl Connector {
    pub fn builder() -> ConnectorBuilder {
        ConnectorBuilder::default()
    }

    /// Open an authenticated TLS socket to the instance, dialing the
    /// first available address from `ip_preference` (the default order
    /// when empty). One TLS-level failure triggers a certificate refresh
    /// and a single retry; a second failure is surfaced.
    pub async fn connect(
        &self,
        instance: &str,
        auth_type: AuthType,
        ip_preference: &[IpType],
    ) -> ConnectorResult<TlsSocket> {
        let name = InstanceName::parse(instance)?;
        self.connect_inner(name, auth_type, ip_preference, None).await
    }

    async fn connect_inner(
        &self,
        name: InstanceName,
        auth_type: AuthType,
        ip_preference: &[IpType],
        config_credentials: Option<Arc<dyn CredentialSource>>,
    ) -> ConnectorResult<TlsSocket> {
        let preferences = if ip_preference.is_empty() {
            IpType::default_preferences()
        } else {
            ip_preference.to_vec()
        };
        let entry = self.entry(&name, auth_type, config_credentials)?;

        let mut refreshed = false;
        let mut data = entry.instance_data().await?;
        loop {
            let (ip_type, ip) = data.preferred_ip(&name, &preferences)?;
            debug!(instance = %name, %ip_type, %ip, "dialing instance");

            let dial_name = name.clone();
            let dial_data = data.clone();
            let port = self.inner.options.server_port;
            let timeout = self.inner.options.connect_timeout;
            let result = tokio::task::spawn_blocking(move || {
                dial::connect(&dial_name, &dial_data, &ip, port, timeout)
            })
            .await
            .map_err(|e| ConnectorError::DialFailed(format!("[{name}] dial task: {e}")))?;

            match result {
                Ok(socket) => {
                    info!(instance = %name, %ip_type, "connection established");
                    return Ok(socket);
                }
                Err(
                    err @ (ConnectorError::HandshakeFailed(_)
                    | ConnectorError::ServerIdentityMismatch { .. }),
                ) if !refreshed => {
                    // The cached certificate may have been invalidated
                    // (e.g. CA rotation). Refresh once and retry with the
                    // next attempt's data.
                    warn!(instance = %name, error = %err, "TLS failure, refreshing certificate and retrying");
                    refreshed = true;
                    data = entry.refresh_and_wait().await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Connect using a parsed driver configuration.
    ///
    /// `unixSocketPath` is the driver shim's concern; a config carrying
    /// it is rejected here rather than silently ignored. When the config
    /// names its own credential source (`oauth2Token` or
    /// `credentialsFile`), the instance entry it creates uses that
    /// source instead of the connector-wide one; an entry that already
    /// exists keeps the source it was created with.
    pub async fn connect_with_config(
        &self,
        config: &ConnectorConfig,
    ) -> ConnectorResult<TlsSocket> {
        if config.unix_socket_path.is_some() {
            return Err(ConnectorError::Config(
                "unixSocketPath connections are handled by the driver integration".to_string(),
            ));
        }
        let config_credentials =
            if config.oauth2_token.is_some() || config.credentials_file.is_some() {
                Some(resolve_credentials(config)?)
            } else {
                None
            };
        self.connect_inner(
            config.instance.clone(),
            config.auth_type,
            &config.ip_preference,
            config_credentials,
        )
        .await
    }

    /// The instance's connection settings (IP map, engine version).
    /// Driver shims use this to pick a dialect before connecting.
    pub async fn get_metadata(&self, instance: &str) -> ConnectorResult<InstanceMetadata> {
        let name = InstanceName::parse(instance)?;
        let entry = self.entry(&name, AuthType::Password, None)?;
        let data = entry.instance_data().await?;
        Ok(data.metadata().clone())
    }

    /// The database engine version string, e.g. `POSTGRES_14`.
    pub async fn get_database_version(&self, instance: &str) -> ConnectorResult<String> {
        Ok(self.get_metadata(instance).await?.database_version)
    }

    /// Terminate every entry and stop the scheduler. Idempotent; any
    /// operation afterwards fails with `EntryClosed`.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries: Vec<Arc<InstanceEntry>> = {
            let mut map = self.inner.entries.lock().expect("registry lock");
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.terminate();
        }
        self.inner.scheduler.close();
        info!(entries = entries.len(), "connector shut down");
    }

    /// Resolve or create the entry for `name`. Creation is serialized
    /// under the registry lock so concurrent callers share one entry.
    ///
    /// `config_credentials` (from a per-connection configuration) binds
    /// the entry it creates: it becomes the entry's token source, and
    /// the default Admin API client is rebuilt around it so control-plane
    /// calls are authenticated with the same identity. First use wins;
    /// later lookups reuse the existing entry as-is.
    fn entry(
        &self,
        name: &InstanceName,
        auth_type: AuthType,
        config_credentials: Option<Arc<dyn CredentialSource>>,
    ) -> ConnectorResult<Arc<InstanceEntry>> {
        let mut map = self.inner.entries.lock().expect("registry lock");
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(ConnectorError::EntryClosed(name.connection_name()));
        }
        if let Some(entry) = map.get(&name.connection_name()) {
            if config_credentials.is_some() {
                debug!(instance = %name, "entry already exists, keeping its original credential source");
            }
            return Ok(entry.clone());
        }

        let (credentials, api) = match config_credentials {
            Some(credentials) => {
                let api: Arc<dyn ConnectApi> = if self.inner.custom_api {
                    self.inner.api.clone()
                } else {
                    Arc::new(AdminApiClient::new(credentials.clone()))
                };
                (credentials, api)
            }
            None => (self.inner.credentials.clone(), self.inner.api.clone()),
        };

        debug!(instance = %name, ?auth_type, "creating instance entry");
        let entry = InstanceEntry::new(
            name.clone(),
            auth_type,
            self.inner.keys.clone(),
            credentials,
            api,
            self.inner.scheduler.clone(),
            self.inner.options.retry.clone(),
            self.inner.options.refresh.clone(),
        );
        map.insert(name.connection_name(), entry.clone());
        Ok(entry)
    }

    /// Number of live entries (diagnostics).
    pub fn entry_count(&self) -> usize {
        self.inner.entries.lock().expect("registry lock").len()
    }
}
