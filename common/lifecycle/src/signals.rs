use std::fmt;
use std::io;
use std::str::FromStr;

use futures::future::{select_all, FutureExt};
use tokio::signal::unix::{signal, Signal, SignalKind};

/// OS signals that end the `running` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Quit,
    Hangup,
    User1,
    User2,
}

pub const DEFAULT_SIGNALS: [ShutdownSignal; 3] = [
    ShutdownSignal::Interrupt,
    ShutdownSignal::Terminate,
    ShutdownSignal::Quit,
];

impl ShutdownSignal {
    pub fn kind(self) -> SignalKind {
        match self {
            ShutdownSignal::Interrupt => SignalKind::interrupt(),
            ShutdownSignal::Terminate => SignalKind::terminate(),
            ShutdownSignal::Quit => SignalKind::quit(),
            ShutdownSignal::Hangup => SignalKind::hangup(),
            ShutdownSignal::User1 => SignalKind::user_defined1(),
            ShutdownSignal::User2 => SignalKind::user_defined2(),
        }
    }

    /// Parse a comma separated list such as `INT,TERM,QUIT`.
    pub fn parse_list(s: &str) -> Result<Vec<ShutdownSignal>, String> {
        let mut signals = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let signal = part.parse()?;
            if !signals.contains(&signal) {
                signals.push(signal);
            }
        }
        Ok(signals)
    }
}

impl FromStr for ShutdownSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        match upper.strip_prefix("SIG").unwrap_or(&upper) {
            "INT" => Ok(ShutdownSignal::Interrupt),
            "TERM" => Ok(ShutdownSignal::Terminate),
            "QUIT" => Ok(ShutdownSignal::Quit),
            "HUP" => Ok(ShutdownSignal::Hangup),
            "USR1" => Ok(ShutdownSignal::User1),
            "USR2" => Ok(ShutdownSignal::User2),
            _ => Err(format!(
                "Unknown signal: {s}, must be one of INT, TERM, QUIT, HUP, USR1, USR2"
            )),
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Quit => "SIGQUIT",
            ShutdownSignal::Hangup => "SIGHUP",
            ShutdownSignal::User1 => "SIGUSR1",
            ShutdownSignal::User2 => "SIGUSR2",
        };
        f.write_str(name)
    }
}

/// Installed handlers for a signal set. Installing replaces the default
/// action, so signals arriving before [`recv`](Self::recv) is polled are
/// buffered instead of killing the process.
pub(crate) struct ShutdownSignals {
    streams: Vec<(ShutdownSignal, Signal)>,
}

impl ShutdownSignals {
    pub(crate) fn install(signals: &[ShutdownSignal]) -> io::Result<Self> {
        let streams = signals
            .iter()
            .map(|s| Ok((*s, signal(s.kind())?)))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self { streams })
    }

    /// Wait for any installed signal. Never resolves for an empty set.
    pub(crate) async fn recv(&mut self) -> ShutdownSignal {
        if self.streams.is_empty() {
            return futures::future::pending().await;
        }
        let waits = self.streams.iter_mut().map(|(which, stream)| {
            let which = *which;
            async move {
                stream.recv().await;
                which
            }
            .boxed()
        });
        let (which, _, _) = select_all(waits).await;
        which
    }
}
