//! Lease-based registry on etcd.
//!
//! Each instance is stored as JSON under `{prefix}{name}/{id}`, attached to a
//! lease. A background task keeps the lease alive; when the keepalive stream
//! dies while the instance is still registered, the task grants a new lease
//! and rewrites the key, backing off per [`RetryPolicy`].

mod watch;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, KeyValue, PutOptions};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::instance::{validate_service_name, ServiceInstance};
use crate::registrar::{Discovery, Registrar, Watcher};
use crate::retry::{self, RetryPolicy, Retried};
use crate::watcher::{self, DEFAULT_WATCH_BUFFER};

#[derive(Debug, Clone)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    /// Credentials are only sent when both are set.
    pub username: Option<String>,
    pub password: Option<String>,
    pub dial_timeout: Duration,
    /// Lease TTL. Rounded up to whole seconds, minimum one.
    pub ttl: Duration,
    /// Key prefix for every record (e.g. "/services/" or "/test-{uuid}/").
    pub prefix: String,
    pub retry: RetryPolicy,
    pub watch_buffer: usize,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            username: None,
            password: None,
            dial_timeout: Duration::from_secs(5),
            ttl: Duration::from_secs(15),
            prefix: "/services/".to_string(),
            retry: RetryPolicy::default(),
            watch_buffer: DEFAULT_WATCH_BUFFER,
        }
    }
}

impl EtcdConfig {
    fn lease_ttl_secs(&self) -> i64 {
        let secs = self.ttl.as_secs() + u64::from(self.ttl.subsec_nanos() > 0);
        i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
    }

    /// Three renewals per TTL.
    fn keepalive_interval(&self) -> Duration {
        (self.ttl / 3).max(Duration::from_millis(100))
    }
}

/// All etcd key patterns used by the registry.
enum StoreKey<'a> {
    Instance { name: &'a str, id: &'a str },
    Service(&'a str),
}

impl StoreKey<'_> {
    fn resolve(&self, prefix: &str) -> String {
        match self {
            StoreKey::Instance { name, id } => format!("{prefix}{name}/{id}"),
            StoreKey::Service(name) => format!("{prefix}{name}/"),
        }
    }
}

struct Registration {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    /// Updated by the keepalive task whenever it re-registers.
    lease_id: Arc<AtomicI64>,
}

struct Inner {
    client: Client,
    config: EtcdConfig,
    registrations: Mutex<HashMap<String, Registration>>,
    /// Parent of every keepalive task token; cancelled when the registry is dropped.
    shutdown: CancellationToken,
}

/// etcd implementation of [`Registrar`] and [`Discovery`].
///
/// Dropping the registry stops every keepalive task without deleting keys,
/// so the records expire with their leases like those of a crashed process.
pub struct EtcdRegistry {
    inner: Arc<Inner>,
}

impl EtcdRegistry {
    pub async fn connect(config: EtcdConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(Error::InvalidConfig("no etcd endpoints".to_string()));
        }
        let mut options = ConnectOptions::new().with_connect_timeout(config.dial_timeout);
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            if !user.is_empty() && !password.is_empty() {
                options = options.with_user(user.clone(), password.clone());
            }
        }
        let client = Client::connect(&config.endpoints, Some(options)).await?;
        tracing::debug!(endpoints = ?config.endpoints, "connected to etcd");
        Ok(Self::with_client(client, config))
    }

    /// Build a registry over an existing client (`Client` is cheap to clone).
    pub fn with_client(client: Client, config: EtcdConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                registrations: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &EtcdConfig {
        &self.inner.config
    }

    /// Lease currently backing a registered instance.
    pub async fn lease_id(&self, instance_id: &str) -> Option<i64> {
        self.inner
            .registrations
            .lock()
            .await
            .get(instance_id)
            .map(|r| r.lease_id.load(Ordering::SeqCst))
    }
}

impl Drop for EtcdRegistry {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    fn key(&self, k: StoreKey<'_>) -> String {
        k.resolve(&self.config.prefix)
    }

    fn instance_key(&self, instance: &ServiceInstance) -> String {
        self.key(StoreKey::Instance {
            name: &instance.name,
            id: &instance.id,
        })
    }

    /// Grant a fresh lease and write the record under it.
    async fn put_with_lease(&self, instance: &ServiceInstance) -> Result<i64> {
        let value = serde_json::to_string(instance)?;
        let lease_id = self
            .client
            .clone()
            .lease_grant(self.config.lease_ttl_secs(), None)
            .await?
            .id();

        let options = PutOptions::new().with_lease(lease_id);
        if let Err(e) = self
            .client
            .clone()
            .put(self.instance_key(instance), value, Some(options))
            .await
        {
            // Best-effort: an orphaned lease holds no keys and expires on its own.
            drop(self.client.clone().lease_revoke(lease_id).await);
            return Err(e.into());
        }
        Ok(lease_id)
    }

    async fn delete_record(&self, instance: &ServiceInstance) -> Result<()> {
        self.client
            .clone()
            .delete(self.instance_key(instance), None)
            .await?;
        Ok(())
    }

    async fn revoke(&self, lease_id: i64) {
        if let Err(e) = self.client.clone().lease_revoke(lease_id).await {
            tracing::debug!(lease_id, error = %e, "lease revoke failed");
        }
    }

    async fn list(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        let options = GetOptions::new().with_prefix();
        let resp = self
            .client
            .clone()
            .get(self.key(StoreKey::Service(name)), Some(options))
            .await?;
        resp.kvs().iter().map(decode_record).collect()
    }

    /// Renew `lease_id` until cancelled. Returns an error when the lease can
    /// no longer be renewed.
    async fn keep_lease_alive(&self, lease_id: i64, cancel: &CancellationToken) -> Result<()> {
        let (mut keeper, mut stream) = self.client.clone().lease_keep_alive(lease_id).await?;
        let interval = self.config.keepalive_interval();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {
                    keeper.keep_alive().await?;
                    match stream.message().await? {
                        Some(resp) if resp.ttl() > 0 => {
                            tracing::trace!(lease_id, ttl = resp.ttl(), "lease renewed");
                        }
                        // TTL 0 means the lease expired before this renewal reached etcd.
                        Some(_) | None => return Err(Error::LeaseLost { lease_id }),
                    }
                }
            }
        }
    }
}

pub(crate) fn decode_record(kv: &KeyValue) -> Result<ServiceInstance> {
    Ok(serde_json::from_slice(kv.value())?)
}

/// Keepalive task for one registration. Exits on cancellation, or after the
/// retry policy is exhausted, leaving the instance to expire with its lease.
async fn run_keepalive(
    inner: Arc<Inner>,
    instance: ServiceInstance,
    lease_slot: Arc<AtomicI64>,
    cancel: CancellationToken,
) {
    loop {
        let lease_id = lease_slot.load(Ordering::SeqCst);
        match inner.keep_lease_alive(lease_id, &cancel).await {
            Ok(()) => return,
            Err(e) => {
                if cancel.is_cancelled() {
                    return;
                }
                tracing::warn!(
                    service = %instance.name,
                    instance_id = %instance.id,
                    lease_id,
                    error = %e,
                    "lease keepalive lost, re-registering"
                );
            }
        }

        match retry::retry(&inner.config.retry, &cancel, "etcd re-register", || {
            inner.put_with_lease(&instance)
        })
        .await
        {
            Retried::Done(new_lease) => {
                if cancel.is_cancelled() {
                    // Deregistered while the write was in flight; undo it.
                    drop(inner.delete_record(&instance).await);
                    inner.revoke(new_lease).await;
                    return;
                }
                lease_slot.store(new_lease, Ordering::SeqCst);
                tracing::info!(
                    service = %instance.name,
                    instance_id = %instance.id,
                    lease_id = new_lease,
                    "re-registered with etcd"
                );
            }
            Retried::Cancelled => return,
            Retried::Exhausted(e) => {
                tracing::error!(
                    service = %instance.name,
                    instance_id = %instance.id,
                    error = %e,
                    "giving up on re-registration, instance will expire from etcd"
                );
                return;
            }
        }
    }
}

#[async_trait]
impl Registrar for EtcdRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        instance.validate()?;
        let inner = &self.inner;
        let lease_id = inner.put_with_lease(instance).await?;

        let lease_slot = Arc::new(AtomicI64::new(lease_id));
        let cancel = inner.shutdown.child_token();
        // No await between spawn and insert: a cancelled register leaves no untracked task.
        let mut registrations = inner.registrations.lock().await;
        let task = tokio::spawn(run_keepalive(
            Arc::clone(inner),
            instance.clone(),
            Arc::clone(&lease_slot),
            cancel.clone(),
        ));
        let previous = registrations.insert(
            instance.id.clone(),
            Registration {
                cancel,
                task,
                lease_id: lease_slot,
            },
        );
        drop(registrations);
        if let Some(previous) = previous {
            previous.cancel.cancel();
            previous.task.abort();
            let old_lease = previous.lease_id.load(Ordering::SeqCst);
            if old_lease != lease_id {
                inner.revoke(old_lease).await;
            }
        }

        tracing::info!(
            service = %instance.name,
            instance_id = %instance.id,
            lease_id,
            "registered with etcd"
        );
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        let inner = &self.inner;
        let registration = inner.registrations.lock().await.remove(&instance.id);
        let lease_id = registration.map(|r| {
            r.cancel.cancel();
            r.task.abort();
            r.lease_id.load(Ordering::SeqCst)
        });

        inner.delete_record(instance).await?;
        if let Some(lease_id) = lease_id {
            inner.revoke(lease_id).await;
        }

        tracing::info!(
            service = %instance.name,
            instance_id = %instance.id,
            "deregistered from etcd"
        );
        Ok(())
    }
}

#[async_trait]
impl Discovery for EtcdRegistry {
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        validate_service_name(name)?;
        self.inner.list(name).await
    }

    async fn watch(&self, name: &str, parent: &CancellationToken) -> Result<Box<dyn Watcher>> {
        validate_service_name(name)?;
        let (watcher, feed) = watcher::channel(name, parent, self.inner.config.watch_buffer);
        let prefix = self.inner.key(StoreKey::Service(name));
        tokio::spawn(watch::run_watch(self.inner.client.clone(), prefix, feed));
        Ok(Box::new(watcher))
    }
}
