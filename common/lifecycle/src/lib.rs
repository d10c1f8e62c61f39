//! Application lifecycle: concurrent initializers and component start,
//! service registration, signal trapping, and deregistration followed by a
//! bounded concurrent stop. Also ships an axum [`HttpServer`] component and
//! K8s readiness/liveness probes.

mod app;
mod component;
mod endpoint;
mod error;
mod http;
mod metrics;
mod probes;
mod signals;

pub use app::{App, AppBuilder, AppInfo, AppState, StopHandle};
pub use component::{Component, ListenEndpoint};
pub use endpoint::outbound_ip;
pub use error::{AppError, HookStage};
pub use http::HttpServer;
pub use probes::{probe_router, LivenessHandler, LivenessStatus, ReadinessHandler};
pub use signals::{ShutdownSignal, DEFAULT_SIGNALS};
