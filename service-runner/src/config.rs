use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use lifecycle::ShutdownSignal;
use registry::RegistryConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "SERVICE_NAME")]
    pub service_name: String,

    #[envconfig(from = "SERVICE_VERSION", default = "0.0.0")]
    pub service_version: String,

    /// Empty generates a fresh id per process.
    #[envconfig(from = "SERVICE_ID", default = "")]
    pub service_id: String,

    /// Comma separated `scheme://host:port`; listener endpoints fill in the rest.
    #[envconfig(from = "SERVICE_ENDPOINTS", default = "")]
    pub service_endpoints: String,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(from = "ENABLE_HTTP", default = "true")]
    pub enable_http: bool,

    #[envconfig(from = "ENABLE_REGISTRY", default = "true")]
    pub enable_registry: bool,

    #[envconfig(from = "SHUTDOWN_SIGNALS", default = "INT,TERM,QUIT")]
    pub shutdown_signals: SignalList,

    #[envconfig(from = "COMPONENT_TIMEOUT_SECS", default = "5")]
    pub component_timeout_secs: u64,

    #[envconfig(nested = true)]
    pub registry: RegistryConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.service_endpoints
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    pub fn component_timeout(&self) -> Duration {
        Duration::from_secs(self.component_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalList(pub Vec<ShutdownSignal>);

impl FromStr for SignalList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ShutdownSignal::parse_list(s).map(SignalList)
    }
}
