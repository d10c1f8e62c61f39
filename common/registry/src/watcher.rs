//! Channel-backed [`Watcher`] shared by both backends.
//!
//! A backend spawns one task per watch session holding the [`WatchFeed`]
//! half. The task owns its cursor and member cache; the [`ChannelWatcher`]
//! half only receives snapshots and signals the task through its token.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::instance::ServiceInstance;
use crate::registrar::Watcher;

pub const DEFAULT_WATCH_BUFFER: usize = 100;

/// Create the two halves of a watch session.
///
/// The session token is a child of `parent`, so cancelling the parent ends
/// the background task as well as an explicit [`Watcher::stop`].
pub(crate) fn channel(
    service: &str,
    parent: &CancellationToken,
    capacity: usize,
) -> (ChannelWatcher, WatchFeed) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let token = parent.child_token();
    let watcher = ChannelWatcher {
        service: service.to_string(),
        rx: Mutex::new(rx),
        token: token.clone(),
        parent: parent.clone(),
        stopped: AtomicBool::new(false),
    };
    let feed = WatchFeed { tx, token };
    (watcher, feed)
}

/// Producer half, owned by the backend's watch task.
pub(crate) struct WatchFeed {
    tx: mpsc::Sender<Vec<ServiceInstance>>,
    token: CancellationToken,
}

impl WatchFeed {
    /// Queue a snapshot. Returns false once the session has ended, in which
    /// case the task should exit. A full queue blocks only until stop/cancel.
    pub(crate) async fn push(&self, instances: Vec<ServiceInstance>) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            sent = self.tx.send(instances) => sent.is_ok(),
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Consumer half handed to callers of [`Discovery::watch`](crate::Discovery::watch).
pub struct ChannelWatcher {
    service: String,
    rx: Mutex<mpsc::Receiver<Vec<ServiceInstance>>>,
    token: CancellationToken,
    parent: CancellationToken,
    stopped: AtomicBool,
}

impl ChannelWatcher {
    fn terminal_error(&self) -> Error {
        if self.stopped.load(Ordering::SeqCst) || !self.parent.is_cancelled() {
            Error::WatcherStopped
        } else {
            Error::WatchCancelled
        }
    }
}

#[async_trait]
impl Watcher for ChannelWatcher {
    async fn next(&self) -> Result<Vec<ServiceInstance>> {
        if self.token.is_cancelled() {
            return Err(self.terminal_error());
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.terminal_error()),
            // The feed side dropped: the backend task gave up for good.
            received = rx.recv() => received.ok_or(Error::WatcherStopped),
        }
    }

    fn stop(&self) -> Result<()> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!(service = %self.service, "watcher stopped");
            self.token.cancel();
        }
        Ok(())
    }
}

impl Drop for ChannelWatcher {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
