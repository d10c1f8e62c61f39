use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("etcd request failed: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("consul request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("consul returned {status} for {path}: {body}")]
    Consul {
        status: u16,
        path: String,
        body: String,
    },

    #[error("failed to (de)serialize service instance: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid service instance: {0}")]
    InvalidInstance(String),

    #[error("invalid registry configuration: {0}")]
    InvalidConfig(String),

    #[error("lease {lease_id} is no longer alive")]
    LeaseLost { lease_id: i64 },

    /// The watcher was stopped explicitly.
    #[error("watcher stopped")]
    WatcherStopped,

    /// The token the watcher was created under was cancelled.
    #[error("watch cancelled")]
    WatchCancelled,

    #[error("registry operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// True for the two terminal watcher states.
    pub fn is_watch_terminal(&self) -> bool {
        matches!(self, Error::WatcherStopped | Error::WatchCancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
