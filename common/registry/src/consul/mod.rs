//! Session/TTL-check based registry on consul.
//!
//! Every instance is registered as a consul service with a TTL check. A
//! heartbeat task marks the check passing twice per TTL; when that fails the
//! task registers the service again from scratch.

pub mod api;
mod watch;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};
use crate::instance::{validate_service_name, ServiceInstance};
use crate::registrar::{Discovery, Registrar, Watcher};
use crate::retry::{self, RetryPolicy, Retried};
use crate::watcher::{self, DEFAULT_WATCH_BUFFER};

use api::{format_duration, AgentService, ConsulApi, ServiceRegistration, TtlCheck};

/// Meta key holding the instance's full endpoint list as a JSON array.
/// Reserved: instance metadata may not use it.
pub const ENDPOINTS_META_KEY: &str = "__endpoints";

#[derive(Debug, Clone)]
pub struct ConsulConfig {
    /// Agent address as `host:port`.
    pub address: String,
    pub scheme: String,
    /// ACL token, sent with every request when set.
    pub token: Option<String>,
    pub ttl: Duration,
    /// Timeout for non-blocking requests, and slack on top of blocking ones.
    pub timeout: Duration,
    /// Server-side wait for blocking watch queries.
    pub wait: Duration,
    pub deregister_critical_after: Duration,
    pub retry: RetryPolicy,
    pub watch_buffer: usize,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8500".to_string(),
            scheme: "http".to_string(),
            token: None,
            ttl: Duration::from_secs(15),
            timeout: Duration::from_secs(5),
            wait: Duration::from_secs(30),
            deregister_critical_after: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            watch_buffer: DEFAULT_WATCH_BUFFER,
        }
    }
}

impl ConsulConfig {
    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&format!("{}://{}", self.scheme, self.address)).map_err(|e| {
            Error::InvalidConfig(format!(
                "bad consul address {}://{}: {e}",
                self.scheme, self.address
            ))
        })
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.ttl / 2).max(Duration::from_millis(50))
    }
}

pub(crate) fn check_id(instance_id: &str) -> String {
    format!("service:{instance_id}")
}

/// Build the consul registration for an instance.
pub(crate) fn to_registration(
    instance: &ServiceInstance,
    config: &ConsulConfig,
) -> Result<ServiceRegistration> {
    let (address, port) = instance
        .endpoints
        .iter()
        .filter_map(|e| Url::parse(e).ok())
        .find_map(|url| {
            let host = url.host_str()?.to_string();
            let port = url.port_or_known_default()?;
            Some((host, port))
        })
        .unwrap_or_default();

    if instance.metadata.contains_key(ENDPOINTS_META_KEY) {
        return Err(Error::InvalidInstance(format!(
            "metadata key {ENDPOINTS_META_KEY:?} is reserved"
        )));
    }

    let mut meta = instance.metadata.clone();
    meta.insert(
        ENDPOINTS_META_KEY.to_string(),
        serde_json::to_string(&instance.endpoints)?,
    );

    Ok(ServiceRegistration {
        id: instance.id.clone(),
        name: instance.name.clone(),
        tags: vec![instance.version.clone()],
        address,
        port,
        meta,
        check: TtlCheck {
            check_id: check_id(&instance.id),
            ttl: format_duration(config.ttl),
            deregister_critical_service_after: format_duration(config.deregister_critical_after),
            status: "passing".to_string(),
        },
    })
}

/// Rebuild an instance from a consul health entry.
pub(crate) fn from_service(service: AgentService) -> ServiceInstance {
    let AgentService {
        id,
        service: name,
        tags,
        address,
        port,
        mut meta,
    } = service;

    let endpoints = match meta
        .remove(ENDPOINTS_META_KEY)
        .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
    {
        Some(endpoints) => endpoints,
        None if !address.is_empty() => vec![format!("http://{address}:{port}")],
        None => Vec::new(),
    };

    ServiceInstance {
        id,
        name,
        version: tags.into_iter().next().unwrap_or_default(),
        metadata: meta,
        endpoints,
    }
}

struct Registration {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    api: ConsulApi,
    config: ConsulConfig,
    registrations: Mutex<HashMap<String, Registration>>,
    shutdown: CancellationToken,
}

/// consul implementation of [`Registrar`] and [`Discovery`].
///
/// Dropping the registry stops the heartbeats; consul then marks the checks
/// critical after one TTL and removes the services after
/// `deregister_critical_after`.
pub struct ConsulRegistry {
    inner: Arc<Inner>,
}

impl ConsulRegistry {
    pub fn new(config: ConsulConfig) -> Result<Self> {
        let api = ConsulApi::new(config.base_url()?, config.token.clone(), config.timeout)?;
        Ok(Self {
            inner: Arc::new(Inner {
                api,
                config,
                registrations: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &ConsulConfig {
        &self.inner.config
    }

    pub async fn is_registered(&self, instance_id: &str) -> bool {
        self.inner
            .registrations
            .lock()
            .await
            .contains_key(instance_id)
    }
}

impl Drop for ConsulRegistry {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    async fn register_service(&self, instance: &ServiceInstance) -> Result<()> {
        let registration = to_registration(instance, &self.config)?;
        self.api.register(&registration).await
    }

    async fn list(&self, name: &str) -> Result<(Vec<ServiceInstance>, u64)> {
        // Zero index: answer immediately.
        let (entries, index) = self.api.health_service(name, 0, self.config.wait).await?;
        let members = entries.into_iter().map(|e| from_service(e.service)).collect();
        Ok((members, index))
    }
}

/// Heartbeat task for one registration.
async fn run_heartbeat(inner: Arc<Inner>, instance: ServiceInstance, cancel: CancellationToken) {
    let check = check_id(&instance.id);
    let mut interval = tokio::time::interval(inner.config.heartbeat_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The check starts out passing; the first tick fires immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        if !inner.registrations.lock().await.contains_key(&instance.id) {
            tracing::debug!(instance_id = %instance.id, "instance no longer registered, stopping heartbeat");
            return;
        }

        let err = match inner.api.pass_check(&check).await {
            Ok(()) => {
                tracing::trace!(check_id = %check, "consul check passed");
                continue;
            }
            Err(e) => e,
        };
        if cancel.is_cancelled() {
            return;
        }
        tracing::warn!(
            service = %instance.name,
            instance_id = %instance.id,
            error = %err,
            "consul check update failed, re-registering"
        );

        match retry::retry(&inner.config.retry, &cancel, "consul re-register", || {
            inner.register_service(&instance)
        })
        .await
        {
            Retried::Done(()) => {
                if cancel.is_cancelled() {
                    // Deregistered while the registration was in flight; undo it.
                    drop(inner.api.deregister(&instance.id).await);
                    return;
                }
                tracing::info!(
                    service = %instance.name,
                    instance_id = %instance.id,
                    "re-registered with consul"
                );
            }
            Retried::Cancelled => return,
            Retried::Exhausted(e) => {
                tracing::error!(
                    service = %instance.name,
                    instance_id = %instance.id,
                    error = %e,
                    "giving up on re-registration, instance will drop out of consul"
                );
                return;
            }
        }
    }
}

#[async_trait]
impl Registrar for ConsulRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        instance.validate()?;
        let inner = &self.inner;
        inner.register_service(instance).await?;

        let cancel = inner.shutdown.child_token();
        // No await between spawn and insert: a cancelled register leaves no untracked task.
        let mut registrations = inner.registrations.lock().await;
        let task = tokio::spawn(run_heartbeat(
            Arc::clone(inner),
            instance.clone(),
            cancel.clone(),
        ));
        let previous = registrations.insert(instance.id.clone(), Registration { cancel, task });
        drop(registrations);
        if let Some(previous) = previous {
            previous.cancel.cancel();
            previous.task.abort();
        }

        tracing::info!(
            service = %instance.name,
            instance_id = %instance.id,
            "registered with consul"
        );
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        if let Some(registration) = self.inner.registrations.lock().await.remove(&instance.id) {
            registration.cancel.cancel();
            registration.task.abort();
        }
        self.inner.api.deregister(&instance.id).await?;

        tracing::info!(
            service = %instance.name,
            instance_id = %instance.id,
            "deregistered from consul"
        );
        Ok(())
    }
}

#[async_trait]
impl Discovery for ConsulRegistry {
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        validate_service_name(name)?;
        let (members, _) = self.inner.list(name).await?;
        Ok(members)
    }

    async fn watch(&self, name: &str, parent: &CancellationToken) -> Result<Box<dyn Watcher>> {
        validate_service_name(name)?;
        let (watcher, feed) = watcher::channel(name, parent, self.inner.config.watch_buffer);
        tokio::spawn(watch::run_watch(
            self.inner.api.clone(),
            name.to_string(),
            self.inner.config.wait,
            feed,
        ));
        Ok(Box::new(watcher))
    }
}
