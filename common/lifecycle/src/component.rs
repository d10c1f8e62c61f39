use std::any::Any;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::time::Instant;

/// A listener a component exposes once started, e.g. `http` on `0.0.0.0:8080`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenEndpoint {
    pub scheme: String,
    pub addr: SocketAddr,
}

impl ListenEndpoint {
    pub fn new(scheme: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            scheme: scheme.into(),
            addr,
        }
    }
}

/// An independently startable subsystem owned by an [`App`](crate::App):
/// an HTTP or RPC server, a broker consumer, a producer client.
///
/// `start` and `stop` receive the deadline shared by every component in the
/// phase; a call still running when it passes is dropped. `stop` may be
/// called even if `start` never completed, and must then be a no-op.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    async fn start(&self, deadline: Instant) -> anyhow::Result<()>;

    async fn stop(&self, deadline: Instant) -> anyhow::Result<()>;

    /// The underlying live handle, see [`App::component`](crate::App::component).
    fn get(&self) -> &(dyn Any + Send + Sync);

    /// Listen address to advertise. Only consulted after `start` succeeded.
    fn endpoint(&self) -> Option<ListenEndpoint> {
        None
    }
}
