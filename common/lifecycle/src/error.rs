//! Errors returned by [`App::run`](crate::App::run).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Hook lists run around startup and shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    BeforeStart,
    AfterStart,
    BeforeStop,
    AfterStop,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            HookStage::BeforeStart => "before_start",
            HookStage::AfterStart => "after_start",
            HookStage::BeforeStop => "before_stop",
            HookStage::AfterStop => "after_stop",
        };
        f.write_str(stage)
    }
}

/// Startup failures. Shutdown never fails: its errors are logged instead.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("initializer '{name}' failed: {source:#}")]
    Init {
        name: String,
        source: anyhow::Error,
    },

    #[error("component '{name}' failed to start: {source:#}")]
    ComponentStart {
        name: String,
        source: anyhow::Error,
    },

    /// The shared start deadline passed with components still starting.
    #[error("components did not start within {timeout:?}: {pending:?}")]
    StartTimeout {
        timeout: Duration,
        pending: Vec<String>,
    },

    #[error("{stage} hook failed: {source:#}")]
    Hook {
        stage: HookStage,
        source: anyhow::Error,
    },

    #[error("service registration failed: {0}")]
    Register(#[source] registry::Error),

    #[error("failed to install signal handler: {0}")]
    Signal(#[from] std::io::Error),

    /// [`App::run`](crate::App::run) was called more than once.
    #[error("app has already been started")]
    AlreadyStarted,
}
