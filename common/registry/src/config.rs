use std::time::Duration;

use envconfig::Envconfig;

use crate::consul::ConsulConfig;
use crate::etcd::EtcdConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    Etcd,
    Consul,
}

impl std::str::FromStr for RegistryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "etcd" => Ok(RegistryKind::Etcd),
            "consul" => Ok(RegistryKind::Consul),
            _ => Err(format!("Unknown registry kind: {s}, must be etcd or consul")),
        }
    }
}

impl std::fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryKind::Etcd => write!(f, "etcd"),
            RegistryKind::Consul => write!(f, "consul"),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct RegistryConfig {
    #[envconfig(from = "REGISTRY_KIND", default = "etcd")]
    pub kind: RegistryKind,

    /// Comma separated. Empty selects the backend's local default.
    #[envconfig(from = "REGISTRY_ENDPOINTS", default = "")]
    pub endpoints: String,

    // ── etcd ────────────────────────────────────────────────────────
    #[envconfig(from = "REGISTRY_USERNAME", default = "")]
    pub username: String,

    #[envconfig(from = "REGISTRY_PASSWORD", default = "")]
    pub password: String,

    #[envconfig(from = "REGISTRY_PREFIX", default = "/services/")]
    pub prefix: String,

    // ── consul ──────────────────────────────────────────────────────
    #[envconfig(from = "REGISTRY_TOKEN", default = "")]
    pub token: String,

    #[envconfig(from = "REGISTRY_SCHEME", default = "http")]
    pub scheme: String,

    #[envconfig(from = "REGISTRY_WAIT_SECS", default = "30")]
    pub wait_secs: u64,

    // ── shared ──────────────────────────────────────────────────────
    #[envconfig(from = "REGISTRY_TTL_SECS", default = "15")]
    pub ttl_secs: u64,

    /// etcd dial timeout, consul request timeout.
    #[envconfig(from = "REGISTRY_TIMEOUT_SECS", default = "5")]
    pub timeout_secs: u64,

    #[envconfig(from = "REGISTRY_RETRY_MAX_ATTEMPTS", default = "8")]
    pub retry_max_attempts: u32,

    #[envconfig(from = "REGISTRY_RETRY_INITIAL_INTERVAL_MS", default = "1000")]
    pub retry_initial_interval_ms: u64,

    #[envconfig(from = "REGISTRY_RETRY_MAXIMUM_INTERVAL_SECS", default = "30")]
    pub retry_maximum_interval_secs: u64,

    #[envconfig(from = "REGISTRY_WATCH_BUFFER", default = "100")]
    pub watch_buffer: usize,
}

impl RegistryConfig {
    pub fn endpoint_list(&self) -> Vec<String> {
        self.endpoints
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(2, Duration::from_millis(self.retry_initial_interval_ms))
            .max_attempts(self.retry_max_attempts)
            .maximum_interval(Duration::from_secs(self.retry_maximum_interval_secs))
            .provide()
    }

    pub fn etcd(&self) -> EtcdConfig {
        let defaults = EtcdConfig::default();
        let endpoints = self.endpoint_list();
        EtcdConfig {
            endpoints: if endpoints.is_empty() {
                defaults.endpoints
            } else {
                endpoints
            },
            username: non_empty(&self.username),
            password: non_empty(&self.password),
            dial_timeout: self.timeout(),
            ttl: self.ttl(),
            prefix: self.prefix.clone(),
            retry: self.retry_policy(),
            watch_buffer: self.watch_buffer,
        }
    }

    /// consul talks to a single agent: the first endpoint wins.
    pub fn consul(&self) -> ConsulConfig {
        let defaults = ConsulConfig::default();
        ConsulConfig {
            address: self
                .endpoint_list()
                .into_iter()
                .next()
                .unwrap_or(defaults.address),
            scheme: self.scheme.clone(),
            token: non_empty(&self.token),
            ttl: self.ttl(),
            timeout: self.timeout(),
            wait: Duration::from_secs(self.wait_secs),
            retry: self.retry_policy(),
            watch_buffer: self.watch_buffer,
            ..defaults
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
