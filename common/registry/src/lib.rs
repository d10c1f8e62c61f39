//! Service registration and discovery.
//!
//! A [`Registrar`] publishes a [`ServiceInstance`] and keeps it alive in the
//! backing store; a [`Discovery`] lists live instances of a service and
//! watches them for changes. Two backends are provided:
//!
//! - [`EtcdRegistry`]: one key per instance under a lease that a background
//!   task keeps alive. Watches stream etcd revisions.
//! - [`ConsulRegistry`]: one consul service per instance with a TTL check that
//!   a background task marks passing. Watches use blocking queries.
//!
//! [`Registry`] wraps either, selected by [`RegistryConfig`].

mod backend;
pub mod config;
pub mod consul;
mod error;
pub mod etcd;
mod instance;
mod registrar;
mod retry;
mod watcher;

use std::future::Future;
use std::time::Duration;

pub use backend::Registry;
pub use config::{RegistryConfig, RegistryKind};
pub use consul::{ConsulConfig, ConsulRegistry};
pub use error::{Error, Result};
pub use etcd::{EtcdConfig, EtcdRegistry};
pub use instance::ServiceInstance;
pub use registrar::{Discovery, Registrar, Watcher};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use watcher::{ChannelWatcher, DEFAULT_WATCH_BUFFER};

/// Bound a registry call. The inner future is dropped on timeout.
pub async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::Timeout(timeout))?
}
