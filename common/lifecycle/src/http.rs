//! Axum HTTP server as an app [`Component`].

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::OnceLock;

use anyhow::Context;
use async_trait::async_trait;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::component::{Component, ListenEndpoint};

/// Binds in `start`, serves until `stop`, then drains in-flight requests.
pub struct HttpServer {
    bind: SocketAddr,
    router: Router,
    local_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<io::Result<()>>>>,
}

impl HttpServer {
    pub fn new(bind: SocketAddr, router: Router) -> Self {
        Self {
            bind,
            router,
            local_addr: OnceLock::new(),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// The bound address, once started. Differs from the bind address when
    /// binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }
}

#[async_trait]
impl Component for HttpServer {
    async fn start(&self, _deadline: Instant) -> anyhow::Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            anyhow::bail!("http server already started");
        }

        let listener = TcpListener::bind(self.bind)
            .await
            .with_context(|| format!("failed to bind {}", self.bind))?;
        let addr = listener.local_addr()?;
        // Restarts are not supported, so the first address sticks.
        drop(self.local_addr.set(addr));

        let router = self.router.clone();
        let token = self.shutdown.clone();
        *task = Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        }));
        tracing::info!(%addr, "http server listening");
        Ok(())
    }

    /// Stops accepting and drains open connections until `deadline`, then
    /// aborts whatever is left.
    async fn stop(&self, deadline: Instant) -> anyhow::Result<()> {
        self.shutdown.cancel();
        let Some(mut task) = self.task.lock().await.take() else {
            return Ok(());
        };
        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(joined) => joined.context("http server task failed")??,
            Err(_) => {
                task.abort();
                anyhow::bail!("http server did not drain before the deadline");
            }
        }
        tracing::info!("http server stopped");
        Ok(())
    }

    fn get(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn endpoint(&self) -> Option<ListenEndpoint> {
        self.local_addr().map(|addr| ListenEndpoint::new("http", addr))
    }
}
