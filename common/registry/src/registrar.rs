use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::instance::ServiceInstance;

/// Publishes an instance so peers can find it.
///
/// Implementations own one liveness task per registered instance id.
/// Registering the same id again replaces that task instead of adding one.
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Create or refresh the registration record and start renewing it.
    async fn register(&self, instance: &ServiceInstance) -> Result<()>;

    /// Remove the registration record and stop renewing it. Safe to call
    /// after the liveness task already gave up, or for an unknown instance.
    async fn deregister(&self, instance: &ServiceInstance) -> Result<()>;
}

/// Resolves a service name to its live instances.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Current members of `name`. Empty when nothing is registered.
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>>;

    /// Start watching `name` for membership changes.
    ///
    /// The first [`Watcher::next`] returns the members at the time the watch
    /// was established; later calls return the full list after each change.
    ///
    /// The watcher lives until [`Watcher::stop`] is called, it is dropped, or
    /// `parent` is cancelled. Watchers are owned by the caller; nothing else
    /// stops them.
    async fn watch(&self, name: &str, parent: &CancellationToken) -> Result<Box<dyn Watcher>>;
}

/// Stream of membership snapshots for one service name.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Wait for the next full member list.
    ///
    /// Fails with [`Error::WatcherStopped`](crate::Error::WatcherStopped) after
    /// [`stop`](Watcher::stop), or [`Error::WatchCancelled`](crate::Error::WatchCancelled)
    /// once the parent token is cancelled.
    async fn next(&self) -> Result<Vec<ServiceInstance>>;

    /// Stop the background watch. Calling it more than once is a no-op.
    fn stop(&self) -> Result<()>;
}
