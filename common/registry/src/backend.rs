use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{RegistryConfig, RegistryKind};
use crate::consul::ConsulRegistry;
use crate::error::Result;
use crate::etcd::EtcdRegistry;
use crate::instance::ServiceInstance;
use crate::registrar::{Discovery, Registrar, Watcher};

/// A registry backend chosen at runtime.
pub enum Registry {
    Etcd(EtcdRegistry),
    Consul(ConsulRegistry),
}

impl Registry {
    /// Build the backend named by `config.kind`. etcd connects eagerly;
    /// consul only validates its address, since the agent API is stateless.
    pub async fn connect(config: &RegistryConfig) -> Result<Self> {
        let registry = match config.kind {
            RegistryKind::Etcd => Registry::Etcd(EtcdRegistry::connect(config.etcd()).await?),
            RegistryKind::Consul => Registry::Consul(ConsulRegistry::new(config.consul())?),
        };
        tracing::info!(kind = %registry.kind(), "service registry ready");
        Ok(registry)
    }

    pub fn kind(&self) -> RegistryKind {
        match self {
            Registry::Etcd(_) => RegistryKind::Etcd,
            Registry::Consul(_) => RegistryKind::Consul,
        }
    }
}

impl From<EtcdRegistry> for Registry {
    fn from(registry: EtcdRegistry) -> Self {
        Registry::Etcd(registry)
    }
}

impl From<ConsulRegistry> for Registry {
    fn from(registry: ConsulRegistry) -> Self {
        Registry::Consul(registry)
    }
}

#[async_trait]
impl Registrar for Registry {
    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        match self {
            Registry::Etcd(r) => r.register(instance).await,
            Registry::Consul(r) => r.register(instance).await,
        }
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        match self {
            Registry::Etcd(r) => r.deregister(instance).await,
            Registry::Consul(r) => r.deregister(instance).await,
        }
    }
}

#[async_trait]
impl Discovery for Registry {
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        match self {
            Registry::Etcd(r) => r.get_service(name).await,
            Registry::Consul(r) => r.get_service(name).await,
        }
    }

    async fn watch(&self, name: &str, parent: &CancellationToken) -> Result<Box<dyn Watcher>> {
        match self {
            Registry::Etcd(r) => r.watch(name, parent).await,
            Registry::Consul(r) => r.watch(name, parent).await,
        }
    }
}
