//! Per-instance cache and refresh state machine.
//!
//! Each instance entry owns two result slots: `current`, the most recent
//! completed-or-in-flight refresh outcome that callers await, and `next`,
//! the single in-flight (or last-failed) attempt. The entry guarantees:
//!
//! - at most one refresh is in flight at any instant
//! - fresh data is fetched proactively, well before certificate expiry
//! - a failed refresh never displaces still-valid data
//! - `force_refresh` requests coalesce into at most one follow-up beyond
//!   the attempt already in flight
//!
//! ```text
//! current ──awaited by──> connect() callers
//!    ▲ publish on success (or on failure when nothing valid remains)
//! next ───single in-flight refresh──> Admin API (+ key pair, credentials)
//!    ▲ scheduled at expiration − buffer, on force_refresh, or on backoff
//! ```
//!
//! The entry mutex guards slot swaps and the termination flag only; all
//! I/O runs outside it.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use cloudsql_core::{AuthType, ConnectorError, ConnectorResult, InstanceName};

use crate::admin::ConnectApi;
use crate::credentials::CredentialSource;
use crate::dial::{build_client_config, InstanceData};
use crate::keys::KeyPairSource;
use crate::retry::RetryPolicy;
use crate::scheduler::{RefreshScheduler, TaskHandle};

type RefreshResult = ConnectorResult<Arc<InstanceData>>;

// ── RefreshOptions ───────────────────────────────────────────────────

/// Tuning knobs for the refresh cycle.
#[derive(Debug, Clone)]
pub struct RefreshOptions {
    /// How long before certificate expiry the proactive refresh runs.
    pub refresh_buffer: Duration,
    /// Floor on the delay before any scheduled refresh, so a fleet of
    /// processes does not stampede the Admin API in lockstep.
    pub min_refresh_delay: Duration,
    /// First delay after a failed refresh while valid data remains.
    pub failure_backoff_base: Duration,
    /// Cap on the failure backoff.
    pub failure_backoff_cap: Duration,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::from_secs(4 * 60),
            min_refresh_delay: Duration::from_secs(60),
            failure_backoff_base: Duration::from_secs(1),
            failure_backoff_cap: Duration::from_secs(60),
        }
    }
}

// ── ResultSlot ───────────────────────────────────────────────────────

/// A write-once, many-reader promise for one refresh attempt.
struct ResultSlot {
    tx: watch::Sender<Option<RefreshResult>>,
}

impl ResultSlot {
    fn pending() -> Arc<Self> {
        let (tx, _rx) = watch::channel(None);
        Arc::new(Self { tx })
    }

    /// Resolve the slot. The first write wins; later writes are ignored.
    fn complete(&self, result: RefreshResult) {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(result);
                true
            } else {
                false
            }
        });
    }

    /// The resolved value, if any.
    fn peek(&self) -> Option<RefreshResult> {
        self.tx.borrow().clone()
    }

    /// Await resolution. Dropping the returned future abandons only this
    /// caller's wait; the refresh itself continues.
    async fn wait(&self, name: &InstanceName) -> RefreshResult {
        let mut rx = self.tx.subscribe();
        let result = match rx.wait_for(|slot| slot.is_some()).await {
            Ok(resolved) => resolved.clone().expect("slot checked to be resolved"),
            Err(_) => Err(ConnectorError::EntryClosed(name.connection_name())),
        };
        result
    }
}

// ── InstanceEntry ────────────────────────────────────────────────────

struct EntryState {
    current: Arc<ResultSlot>,
    /// The in-flight refresh, or the last failed attempt retained so
    /// probes can observe the error while `current` stays valid.
    next: Option<Arc<ResultSlot>>,
    /// A force-refresh arrived while a refresh was in flight; run one
    /// more when it completes.
    refresh_again: bool,
    scheduled: Option<TaskHandle>,
    consecutive_failures: u32,
    terminated: bool,
}

/// The per-instance cache entry. Created by the registry on first use and
/// retained until shutdown.
pub struct InstanceEntry {
    name: InstanceName,
    auth_type: AuthType,
    keys: Arc<KeyPairSource>,
    credentials: Arc<dyn CredentialSource>,
    api: Arc<dyn ConnectApi>,
    scheduler: Arc<RefreshScheduler>,
    retry: RetryPolicy,
    options: RefreshOptions,
    state: Mutex<EntryState>,
    /// Self-reference handed to refresh tasks; breaks the
    /// construction-order cycle between the entry and its tasks.
    weak: Weak<InstanceEntry>,
}

impl InstanceEntry {
    /// Create the entry and start its first refresh immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: InstanceName,
        auth_type: AuthType,
        keys: Arc<KeyPairSource>,
        credentials: Arc<dyn CredentialSource>,
        api: Arc<dyn ConnectApi>,
        scheduler: Arc<RefreshScheduler>,
        retry: RetryPolicy,
        options: RefreshOptions,
    ) -> Arc<Self> {
        let first = ResultSlot::pending();
        let entry = Arc::new_cyclic(|weak| Self {
            name,
            auth_type,
            keys,
            credentials,
            api,
            scheduler,
            retry,
            options,
            state: Mutex::new(EntryState {
                current: first.clone(),
                next: Some(first.clone()),
                refresh_again: false,
                scheduled: None,
                consecutive_failures: 0,
                terminated: false,
            }),
            weak: weak.clone(),
        });
        entry.spawn_attempt(first, Duration::ZERO);
        entry
    }

    pub fn name(&self) -> &InstanceName {
        &self.name
    }

    pub fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    /// Await the current instance data. If the cached value has already
    /// expired, a replacement refresh is requested and its outcome is
    /// returned instead.
    pub async fn instance_data(&self) -> RefreshResult {
        let slot = {
            let state = self.state.lock().expect("entry lock");
            if state.terminated {
                return Err(ConnectorError::EntryClosed(self.name.connection_name()));
            }
            state.current.clone()
        };

        let result = slot.wait(&self.name).await;
        match result {
            Ok(data) if data.expired_at(SystemTime::now()) => {
                debug!(instance = %self.name, "cached instance data expired, awaiting replacement");
                let follow = self.start_or_join_refresh(false)?;
                follow.wait(&self.name).await
            }
            other => other,
        }
    }

    /// Hint that the cached certificate is no longer usable. Starts a
    /// refresh unless one is already in flight, in which case exactly one
    /// more will follow it.
    pub fn force_refresh(&self) -> ConnectorResult<()> {
        self.request_refresh().map(|_| ())
    }

    /// Start or join a refresh and await that attempt's outcome. Unlike
    /// [`Self::instance_data`], this never serves the previously cached
    /// value; callers use it after observing a handshake failure with
    /// the current certificate.
    pub async fn refresh_and_wait(&self) -> RefreshResult {
        let slot = self.request_refresh()?;
        slot.wait(&self.name).await
    }

    /// Whether a refresh is currently in flight.
    pub fn refresh_in_flight(&self) -> bool {
        let state = self.state.lock().expect("entry lock");
        state
            .next
            .as_ref()
            .is_some_and(|slot| slot.peek().is_none())
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().expect("entry lock").terminated
    }

    /// One-way shutdown: pending waiters are failed, the scheduled
    /// refresh is cancelled, and every later operation errors.
    pub fn terminate(&self) {
        let (current, next) = {
            let mut state = self.state.lock().expect("entry lock");
            if state.terminated {
                return;
            }
            state.terminated = true;
            if let Some(handle) = state.scheduled.take() {
                self.scheduler.cancel(handle);
            }
            (state.current.clone(), state.next.take())
        };

        let closed = ConnectorError::EntryClosed(self.name.connection_name());
        current.complete(Err(closed.clone()));
        if let Some(slot) = next {
            slot.complete(Err(closed));
        }
        debug!(instance = %self.name, "instance entry terminated");
    }

    // ── Refresh orchestration ────────────────────────────────────

    /// A forced refresh: start one, or coalesce onto the one in flight
    /// and queue exactly one more behind it, so the eventual result
    /// postdates the hint.
    fn request_refresh(&self) -> ConnectorResult<Arc<ResultSlot>> {
        self.start_or_join_refresh(true)
    }

    /// Start a refresh now, or return the in-flight attempt's slot.
    fn start_or_join_refresh(&self, ensure_follow_up: bool) -> ConnectorResult<Arc<ResultSlot>> {
        let slot = {
            let mut state = self.state.lock().expect("entry lock");
            if state.terminated {
                return Err(ConnectorError::EntryClosed(self.name.connection_name()));
            }
            if let Some(next) = state.next.clone() {
                if next.peek().is_none() {
                    if ensure_follow_up {
                        state.refresh_again = true;
                    }
                    return Ok(next);
                }
            }
            if let Some(handle) = state.scheduled.take() {
                self.scheduler.cancel(handle);
            }
            let slot = ResultSlot::pending();
            state.next = Some(slot.clone());
            slot
        };
        self.spawn_attempt(slot.clone(), Duration::ZERO);
        Ok(slot)
    }

    /// Run one refresh attempt after `delay`, resolving `slot`.
    fn spawn_attempt(&self, slot: Arc<ResultSlot>, delay: Duration) {
        let Some(entry) = self.weak.upgrade() else {
            slot.complete(Err(ConnectorError::EntryClosed(
                self.name.connection_name(),
            )));
            return;
        };
        let task_slot = slot.clone();
        let scheduled = self.scheduler.schedule(delay, async move {
            let result = entry.perform_refresh().await;
            entry.publish(task_slot, result);
        });
        if scheduled.is_none() {
            slot.complete(Err(ConnectorError::EntryClosed(
                self.name.connection_name(),
            )));
        }
    }

    /// Fired by the scheduler for proactive and backoff refreshes.
    async fn scheduled_refresh(self: Arc<Self>) {
        let slot = {
            let mut state = self.state.lock().expect("entry lock");
            if state.terminated {
                return;
            }
            state.scheduled = None;
            if let Some(next) = &state.next {
                if next.peek().is_none() {
                    // A forced refresh is already running.
                    return;
                }
            }
            let slot = ResultSlot::pending();
            state.next = Some(slot.clone());
            slot
        };
        let result = self.perform_refresh().await;
        self.publish(slot, result);
    }

    /// Publish a finished attempt and plan the next one. Holds the entry
    /// mutex only for the slot swaps.
    fn publish(&self, slot: Arc<ResultSlot>, result: RefreshResult) {
        let mut state = self.state.lock().expect("entry lock");
        if state.terminated {
            slot.complete(Err(ConnectorError::EntryClosed(
                self.name.connection_name(),
            )));
            return;
        }

        match result {
            Ok(data) => {
                state.consecutive_failures = 0;
                slot.complete(Ok(data.clone()));
                state.current = slot;
                state.next = None;

                let now = SystemTime::now();
                let run_again = std::mem::take(&mut state.refresh_again);
                info!(
                    instance = %self.name,
                    expiration = ?data.expiration(),
                    "instance data refreshed"
                );

                if run_again || data.expired_at(now) {
                    let follow = ResultSlot::pending();
                    state.next = Some(follow.clone());
                    drop(state);
                    self.spawn_attempt(follow, Duration::ZERO);
                } else {
                    let delay = self.proactive_delay(now, data.expiration());
                    drop(state);
                    self.schedule_next(delay);
                }
            }
            Err(err) => {
                state.consecutive_failures += 1;
                let failures = state.consecutive_failures;
                warn!(
                    instance = %self.name,
                    error = %err,
                    consecutive_failures = failures,
                    "instance refresh failed"
                );
                slot.complete(Err(err));

                let current_valid = matches!(
                    state.current.peek(),
                    Some(Ok(data)) if !data.expired_at(SystemTime::now())
                );
                if !current_valid {
                    // Nothing usable remains; unblock awaiters with the
                    // failure. Probes of the retained failed attempt see
                    // the same error.
                    state.current = slot;
                    state.next = None;
                }

                let run_again = std::mem::take(&mut state.refresh_again);
                let delay = if run_again {
                    Duration::ZERO
                } else {
                    self.failure_backoff(failures)
                };
                drop(state);
                self.schedule_next(delay);
            }
        }
    }

    /// Schedule a `scheduled_refresh` after `delay`, remembering the
    /// handle so `force_refresh` and `terminate` can cancel it.
    fn schedule_next(&self, delay: Duration) {
        let Some(entry) = self.weak.upgrade() else {
            return;
        };
        if let Some(handle) = self
            .scheduler
            .schedule(delay, async move { entry.scheduled_refresh().await })
        {
            let mut state = self.state.lock().expect("entry lock");
            if state.terminated {
                self.scheduler.cancel(handle);
            } else {
                state.scheduled = Some(handle);
            }
        }
    }

    /// Delay until the proactive refresh: `expiration − buffer`, floored
    /// at the minimum delay and kept at least the minimum short of
    /// expiry, with up to 10% shaved off to spread out a fleet.
    ///
    /// When the remaining lifetime is too short to satisfy both bounds
    /// (more than the floor, but not more than twice it), the floor
    /// wins: waiting the full minimum delay close to expiry is
    /// preferable to a fleet refreshing in lockstep.
    fn proactive_delay(&self, now: SystemTime, expiration: SystemTime) -> Duration {
        let remaining = expiration
            .duration_since(now)
            .unwrap_or(Duration::ZERO);
        let floor = self.options.min_refresh_delay;
        if remaining <= floor {
            return Duration::ZERO;
        }
        let base = remaining
            .saturating_sub(self.options.refresh_buffer)
            .max(floor);
        let spread: f64 = rand::thread_rng().gen_range(0.0..0.1);
        let jittered = base.mul_f64(1.0 - spread);
        let ceiling = remaining.saturating_sub(floor).max(floor);
        jittered.clamp(floor, ceiling)
    }

    fn failure_backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.options
            .failure_backoff_base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.options.failure_backoff_cap)
    }

    // ── The refresh itself (no entry lock held) ───────────────────

    async fn perform_refresh(&self) -> RefreshResult {
        debug!(instance = %self.name, auth = ?self.auth_type, "starting instance refresh");
        let keys = self.keys.get().await?;

        let db_token = match self.auth_type {
            AuthType::Iam => {
                let token = self.credentials.db_user_token().await?;
                token.validate_for_login()?;
                Some(token)
            }
            AuthType::Password => None,
        };

        let settings = {
            let api = self.api.clone();
            let name = self.name.clone();
            self.retry.call(move || {
                let api = api.clone();
                let name = name.clone();
                async move { api.connect_settings(&name).await }
            })
        };
        let certificate = {
            let api = self.api.clone();
            let name = self.name.clone();
            let public_key = keys.public_key_pem().to_string();
            let token = db_token.clone();
            self.retry.call(move || {
                let api = api.clone();
                let name = name.clone();
                let public_key = public_key.clone();
                let token = token.clone();
                async move {
                    api.generate_ephemeral_cert(&name, &public_key, token.as_ref())
                        .await
                }
            })
        };
        let (metadata, client_cert) = tokio::try_join!(settings, certificate)?;

        if self.auth_type == AuthType::Iam && metadata.is_sql_server() {
            return Err(ConnectorError::IamUnsupported {
                instance: self.name.connection_name(),
            });
        }

        let tls = build_client_config(&self.name, &metadata, &client_cert, &keys)?;

        let mut expiration = client_cert.not_after;
        if let Some(token) = &db_token {
            if let Some(token_expiry) = token.expires_at() {
                expiration = expiration.min(token_expiry);
            }
        }

        Ok(Arc::new(InstanceData::new(
            metadata,
            client_cert,
            tls,
            expiration,
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Mutex as StdMutex, OnceLock};

    use async_trait::async_trait;
    use rsa::pkcs8::EncodePrivateKey;
    use rsa::RsaPrivateKey;

    use cloudsql_core::{AccessToken, IpType};

    use crate::admin::{EphemeralCertificate, InstanceMetadata};
    use crate::credentials::StaticTokenSource;

    use super::*;

    // RSA generation is expensive; share one key across the test binary.
    fn test_rsa_key() -> RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
            .clone()
    }

    /// Control-plane stub that signs real ephemeral certificates for the
    /// shared client key, so the produced TLS configs are well-formed.
    struct StubApi {
        ca_key: rcgen::KeyPair,
        ca_cert: rcgen::Certificate,
        client_key: rcgen::KeyPair,
        database_version: String,
        cert_lifetime: StdMutex<Duration>,
        settings_delay: StdMutex<Duration>,
        fail_settings: AtomicBool,
        settings_calls: AtomicU32,
    }

    impl StubApi {
        fn create(database_version: &str) -> (Arc<Self>, Arc<KeyPairSource>) {
            let rsa = test_rsa_key();
            let keys = Arc::new(KeyPairSource::from_private_key(&rsa).unwrap());

            let pkcs8 = rsa.to_pkcs8_der().unwrap().as_bytes().to_vec();
            let client_key = rcgen::KeyPair::from_pkcs8_der_and_sign_algo(
                &pkcs8.into(),
                &rcgen::PKCS_RSA_SHA256,
            )
            .unwrap();

            let ca_key = rcgen::KeyPair::generate().unwrap();
            let mut params = rcgen::CertificateParams::default();
            params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
            let ca_cert = params.self_signed(&ca_key).unwrap();

            let api = Arc::new(Self {
                ca_key,
                ca_cert,
                client_key,
                database_version: database_version.to_string(),
                cert_lifetime: StdMutex::new(Duration::from_secs(3600)),
                settings_delay: StdMutex::new(Duration::ZERO),
                fail_settings: AtomicBool::new(false),
                settings_calls: AtomicU32::new(0),
            });
            (api, keys)
        }

        fn set_cert_lifetime(&self, lifetime: Duration) {
            *self.cert_lifetime.lock().unwrap() = lifetime;
        }

        fn set_settings_delay(&self, delay: Duration) {
            *self.settings_delay.lock().unwrap() = delay;
        }

        fn set_failing(&self, failing: bool) {
            self.fail_settings.store(failing, Ordering::SeqCst);
        }

        fn settings_calls(&self) -> u32 {
            self.settings_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConnectApi for StubApi {
        async fn connect_settings(
            &self,
            _name: &InstanceName,
        ) -> ConnectorResult<InstanceMetadata> {
            self.settings_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.settings_delay.lock().unwrap();
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            if self.fail_settings.load(Ordering::SeqCst) {
                return Err(ConnectorError::TransientApi("stub outage".into()));
            }
            let mut ip_addrs = HashMap::new();
            ip_addrs.insert(IpType::Primary, "127.0.0.1".to_string());
            Ok(InstanceMetadata {
                ip_addrs,
                server_ca_cert: self.ca_cert.der().clone(),
                database_version: self.database_version.clone(),
            })
        }

        async fn generate_ephemeral_cert(
            &self,
            _name: &InstanceName,
            _public_key_pem: &str,
            _db_user_token: Option<&AccessToken>,
        ) -> ConnectorResult<EphemeralCertificate> {
            let lifetime = *self.cert_lifetime.lock().unwrap();
            let not_after = SystemTime::now() + lifetime;
            let mut params = rcgen::CertificateParams::default();
            let mut dn = rcgen::DistinguishedName::new();
            dn.push(rcgen::DnType::CommonName, "Cloud SQL Client");
            params.distinguished_name = dn;
            params.not_after = not_after.into();
            let cert = params
                .signed_by(&self.client_key, &self.ca_cert, &self.ca_key)
                .map_err(|e| ConnectorError::TlsBuild(format!("stub signing: {e}")))?;
            Ok(EphemeralCertificate {
                cert: cert.der().clone(),
                not_after,
            })
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            factor: 2,
            max_delay: Duration::from_millis(4),
            jitter: 0.0,
        }
    }

    fn quiet_options() -> RefreshOptions {
        RefreshOptions {
            refresh_buffer: Duration::from_secs(240),
            min_refresh_delay: Duration::from_secs(60),
            failure_backoff_base: Duration::from_secs(30),
            failure_backoff_cap: Duration::from_secs(60),
        }
    }

    fn make_entry(
        api: Arc<StubApi>,
        keys: Arc<KeyPairSource>,
        auth_type: AuthType,
        credentials: Arc<dyn CredentialSource>,
        options: RefreshOptions,
    ) -> (Arc<InstanceEntry>, Arc<RefreshScheduler>) {
        let scheduler = RefreshScheduler::new();
        let entry = InstanceEntry::new(
            "p:r:i".parse().unwrap(),
            auth_type,
            keys,
            credentials,
            api,
            scheduler.clone(),
            fast_retry(),
            options,
        );
        (entry, scheduler)
    }

    fn password_credentials() -> Arc<dyn CredentialSource> {
        Arc::new(StaticTokenSource::new(AccessToken::new("api-token")))
    }

    #[tokio::test]
    async fn first_refresh_provides_instance_data() {
        let (api, keys) = StubApi::create("POSTGRES_14");
        let (entry, scheduler) = make_entry(
            api.clone(),
            keys,
            AuthType::Password,
            password_credentials(),
            quiet_options(),
        );

        let data = entry.instance_data().await.unwrap();
        assert_eq!(data.metadata().database_version, "POSTGRES_14");
        assert!(!data.expired_at(SystemTime::now()));
        assert_eq!(api.settings_calls(), 1);

        entry.terminate();
        scheduler.close();
    }

    #[tokio::test]
    async fn concurrent_force_refreshes_coalesce_into_one_follow_up() {
        let (api, keys) = StubApi::create("POSTGRES_14");
        api.set_settings_delay(Duration::from_millis(150));
        let (entry, scheduler) = make_entry(
            api.clone(),
            keys,
            AuthType::Password,
            password_credentials(),
            quiet_options(),
        );

        // The initial refresh is now in flight (held by the stub delay).
        tokio::time::sleep(Duration::from_millis(30)).await;
        for _ in 0..5 {
            entry.force_refresh().unwrap();
        }

        // Initial attempt + exactly one coalesced follow-up.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(api.settings_calls(), 2);

        entry.terminate();
        scheduler.close();
    }

    #[tokio::test]
    async fn failed_refresh_keeps_valid_data_in_place() {
        let (api, keys) = StubApi::create("POSTGRES_14");
        let (entry, scheduler) = make_entry(
            api.clone(),
            keys,
            AuthType::Password,
            password_credentials(),
            quiet_options(),
        );

        let first = entry.instance_data().await.unwrap();

        // Break the control plane, then force a refresh.
        api.set_failing(true);
        entry.force_refresh().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Callers still get the previously cached, valid data.
        let second = entry.instance_data().await.unwrap();
        assert_eq!(second.expiration(), first.expiration());

        entry.terminate();
        scheduler.close();
    }

    #[tokio::test]
    async fn refresh_and_wait_surfaces_the_attempt_outcome() {
        let (api, keys) = StubApi::create("POSTGRES_14");
        let (entry, scheduler) = make_entry(
            api.clone(),
            keys,
            AuthType::Password,
            password_credentials(),
            quiet_options(),
        );

        let first = entry.instance_data().await.unwrap();

        // A forced-and-awaited refresh returns the new attempt's data,
        // never the cached value.
        api.set_failing(true);
        let err = entry.refresh_and_wait().await.unwrap_err();
        assert!(err.is_retryable(), "{err}");

        // The cache itself is still intact.
        let cached = entry.instance_data().await.unwrap();
        assert_eq!(cached.expiration(), first.expiration());

        entry.terminate();
        scheduler.close();
    }

    #[tokio::test]
    async fn first_refresh_failure_surfaces_the_error() {
        let (api, keys) = StubApi::create("POSTGRES_14");
        api.set_failing(true);
        let (entry, scheduler) = make_entry(
            api.clone(),
            keys,
            AuthType::Password,
            password_credentials(),
            quiet_options(),
        );

        let err = entry.instance_data().await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
        // Bounded retry inside the attempt: two API calls, one attempt.
        assert_eq!(api.settings_calls(), 2);

        entry.terminate();
        scheduler.close();
    }

    #[tokio::test]
    async fn force_refresh_recovers_after_initial_failure() {
        let (api, keys) = StubApi::create("POSTGRES_14");
        api.set_failing(true);
        let (entry, scheduler) = make_entry(
            api.clone(),
            keys,
            AuthType::Password,
            password_credentials(),
            quiet_options(),
        );

        assert!(entry.instance_data().await.is_err());

        api.set_failing(false);
        let recovered = entry.refresh_and_wait().await;
        assert!(recovered.is_ok(), "{recovered:?}");
        assert!(entry.instance_data().await.is_ok());

        entry.terminate();
        scheduler.close();
    }

    #[tokio::test]
    async fn expired_data_triggers_an_immediate_replacement() {
        let (api, keys) = StubApi::create("POSTGRES_14");
        api.set_cert_lifetime(Duration::from_millis(1));
        let options = RefreshOptions {
            refresh_buffer: Duration::from_millis(50),
            min_refresh_delay: Duration::from_millis(10),
            failure_backoff_base: Duration::from_millis(10),
            failure_backoff_cap: Duration::from_millis(50),
        };
        let (entry, scheduler) = make_entry(
            api.clone(),
            keys,
            AuthType::Password,
            password_credentials(),
            options,
        );

        // Every published value is already expired, so the entry chains
        // replacement refreshes; awaiting returns an attempt's outcome.
        let _ = entry.instance_data().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(api.settings_calls() >= 2);

        entry.terminate();
        scheduler.close();
    }

    #[tokio::test]
    async fn proactive_refresh_runs_before_expiry() {
        let (api, keys) = StubApi::create("POSTGRES_14");
        api.set_cert_lifetime(Duration::from_millis(400));
        let options = RefreshOptions {
            refresh_buffer: Duration::from_millis(200),
            min_refresh_delay: Duration::from_millis(50),
            failure_backoff_base: Duration::from_millis(50),
            failure_backoff_cap: Duration::from_millis(100),
        };
        let (entry, scheduler) = make_entry(
            api.clone(),
            keys,
            AuthType::Password,
            password_credentials(),
            options,
        );

        let first = entry.instance_data().await.unwrap();
        assert_eq!(api.settings_calls(), 1);

        // The proactive refresh fires around lifetime − buffer.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(api.settings_calls() >= 2, "proactive refresh did not run");

        let second = entry.instance_data().await.unwrap();
        assert!(second.expiration() > first.expiration());

        entry.terminate();
        scheduler.close();
    }

    #[tokio::test]
    async fn proactive_delay_never_drops_below_the_floor() {
        let (api, keys) = StubApi::create("POSTGRES_14");
        // floor = 60s, buffer = 240s.
        let (entry, scheduler) = make_entry(
            api,
            keys,
            AuthType::Password,
            password_credentials(),
            quiet_options(),
        );
        let now = SystemTime::now();
        let floor = Duration::from_secs(60);

        // Remaining lifetime between floor and 2*floor: the two bounds
        // conflict and the floor wins.
        for secs in [61u64, 90, 120] {
            let delay = entry.proactive_delay(now, now + Duration::from_secs(secs));
            assert!(delay >= floor, "remaining {secs}s scheduled after {delay:?}");
            assert!(delay <= Duration::from_secs(secs));
        }

        // At or below the floor (or already expired): refresh immediately.
        assert_eq!(
            entry.proactive_delay(now, now + floor),
            Duration::ZERO
        );
        assert_eq!(
            entry.proactive_delay(now, now - Duration::from_secs(10)),
            Duration::ZERO
        );

        // A healthy lifetime honors the buffer and stays at least a
        // floor short of expiry.
        let delay = entry.proactive_delay(now, now + Duration::from_secs(3600));
        assert!(delay >= Duration::from_secs(3024), "{delay:?}");
        assert!(delay <= Duration::from_secs(3540), "{delay:?}");

        entry.terminate();
        scheduler.close();
    }

    #[tokio::test]
    async fn terminate_fails_every_operation() {
        let (api, keys) = StubApi::create("POSTGRES_14");
        let (entry, scheduler) = make_entry(
            api,
            keys,
            AuthType::Password,
            password_credentials(),
            quiet_options(),
        );

        entry.terminate();
        assert!(entry.is_terminated());

        let err = entry.instance_data().await.unwrap_err();
        assert!(matches!(err, ConnectorError::EntryClosed(_)), "{err}");
        assert!(matches!(
            entry.force_refresh(),
            Err(ConnectorError::EntryClosed(_))
        ));

        // Idempotent.
        entry.terminate();
        scheduler.close();
    }

    // ── IAM authentication ──────────────────────────────────────────

    #[tokio::test]
    async fn iam_on_sql_server_is_rejected() {
        let (api, keys) = StubApi::create("SQLSERVER_2019_STANDARD");
        let credentials = Arc::new(StaticTokenSource::new(AccessToken::with_expiry(
            "db-token",
            SystemTime::now() + Duration::from_secs(3600),
        )));
        let (entry, scheduler) =
            make_entry(api, keys, AuthType::Iam, credentials, quiet_options());

        let err = entry.instance_data().await.unwrap_err();
        assert!(
            err.to_string()
                .contains("[p:r:i] IAM Authentication is not supported for SQL Server instances"),
            "{err}"
        );

        entry.terminate();
        scheduler.close();
    }

    #[tokio::test]
    async fn iam_with_empty_token_is_rejected() {
        let (api, keys) = StubApi::create("POSTGRES_14");
        let credentials = Arc::new(StaticTokenSource::new(AccessToken::new("")));
        let (entry, scheduler) =
            make_entry(api.clone(), keys, AuthType::Iam, credentials, quiet_options());

        let err = entry.instance_data().await.unwrap_err();
        assert!(err.to_string().contains("Access Token has length of zero"), "{err}");
        // The token is validated before any control-plane call.
        assert_eq!(api.settings_calls(), 0);

        entry.terminate();
        scheduler.close();
    }

    #[tokio::test]
    async fn iam_with_expired_token_is_rejected() {
        let (api, keys) = StubApi::create("POSTGRES_14");
        let credentials = Arc::new(StaticTokenSource::new(AccessToken::with_expiry(
            "db-token",
            SystemTime::now() - Duration::from_secs(3600),
        )));
        let (entry, scheduler) =
            make_entry(api, keys, AuthType::Iam, credentials, quiet_options());

        let err = entry.instance_data().await.unwrap_err();
        assert!(
            err.to_string()
                .contains("Access Token expiration time is in the past"),
            "{err}"
        );

        entry.terminate();
        scheduler.close();
    }

    #[tokio::test]
    async fn iam_expiration_is_capped_by_the_token() {
        let (api, keys) = StubApi::create("POSTGRES_14");
        let token_expiry = SystemTime::now() + Duration::from_secs(600);
        let credentials = Arc::new(StaticTokenSource::new(AccessToken::with_expiry(
            "db-token",
            token_expiry,
        )));
        let (entry, scheduler) =
            make_entry(api, keys, AuthType::Iam, credentials, quiet_options());

        // Cert lives an hour; the token expires first and wins.
        let data = entry.instance_data().await.unwrap();
        assert_eq!(data.expiration(), token_expiry);
        assert!(data.expiration() < data.client_cert().not_after);

        entry.terminate();
        scheduler.close();
    }

    #[tokio::test]
    async fn cert_expiry_wins_when_earlier_than_the_token() {
        let (api, keys) = StubApi::create("POSTGRES_14");
        api.set_cert_lifetime(Duration::from_secs(300));
        let credentials = Arc::new(StaticTokenSource::new(AccessToken::with_expiry(
            "db-token",
            SystemTime::now() + Duration::from_secs(7200),
        )));
        let (entry, scheduler) =
            make_entry(api, keys, AuthType::Iam, credentials, quiet_options());

        let data = entry.instance_data().await.unwrap();
        assert_eq!(data.expiration(), data.client_cert().not_after);

        entry.terminate();
        scheduler.close();
    }
}
