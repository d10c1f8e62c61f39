//! Application orchestrator: initializers, concurrent component start,
//! registration, signal wait, deregistration and bounded concurrent stop.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{try_join_all, BoxFuture, FutureExt};
use registry::{Registrar, ServiceInstance};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::component::Component;
use crate::endpoint;
use crate::error::{AppError, HookStage};
use crate::metrics;
use crate::probes::ReadinessHandler;
use crate::signals::{ShutdownSignal, ShutdownSignals, DEFAULT_SIGNALS};

/// Where [`App::run`] is. Published on a watch channel, see [`App::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Initializing,
    Starting,
    Registered,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            AppState::Initializing => "initializing",
            AppState::Starting => "starting",
            AppState::Registered => "registered",
            AppState::Running => "running",
            AppState::Stopping => "stopping",
            AppState::Stopped => "stopped",
        };
        f.write_str(state)
    }
}

/// Identity handed to hooks. Endpoints are only complete from `after_start` on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub metadata: HashMap<String, String>,
    pub endpoints: Vec<String>,
}

/// How far startup got before failing, i.e. what needs undoing.
#[derive(Clone, Copy)]
enum Startup {
    /// Nothing started yet.
    Initializing,
    /// Components may be running; nothing is registered.
    Starting,
    /// The instance may be in the store.
    Registered,
}

type Hook = Box<dyn Fn(AppInfo) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type Initializer = (String, BoxFuture<'static, anyhow::Result<()>>);

#[derive(Default)]
struct Hooks {
    before_start: Vec<Hook>,
    after_start: Vec<Hook>,
    before_stop: Vec<Hook>,
    after_stop: Vec<Hook>,
}

impl Hooks {
    fn stage(&self, stage: HookStage) -> &[Hook] {
        match stage {
            HookStage::BeforeStart => &self.before_start,
            HookStage::AfterStart => &self.after_start,
            HookStage::BeforeStop => &self.before_stop,
            HookStage::AfterStop => &self.after_stop,
        }
    }
}

#[derive(Clone, Debug)]
struct AppOptions {
    pub id: String,
    pub name: String,
    pub version: String,
    pub metadata: HashMap<String, String>,
    /// Explicit endpoints; listener-derived ones are added for other schemes.
    pub endpoints: Vec<String>,
    /// Bound on register and deregister calls.
    pub registry_timeout: Duration,
    /// Shared bound on the whole start phase, and separately on the stop phase.
    pub component_timeout: Duration,
    pub signals: Vec<ShutdownSignal>,
    pub trap_signals: bool,
}

/// Cloneable trigger for a programmatic shutdown, equivalent to a signal.
#[derive(Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }
}

pub struct AppBuilder {
    options: AppOptions,
    components: Vec<(String, Arc<dyn Component>)>,
    initializers: Vec<Initializer>,
    hooks: Hooks,
    registrar: Option<Arc<dyn Registrar>>,
    state: watch::Sender<AppState>,
    stop: CancellationToken,
}

impl AppBuilder {
    fn new(name: &str, version: &str) -> Self {
        let (state, _) = watch::channel(AppState::Initializing);
        Self {
            options: AppOptions {
                id: ServiceInstance::new(name, version).id,
                name: name.to_string(),
                version: version.to_string(),
                metadata: HashMap::new(),
                endpoints: Vec::new(),
                registry_timeout: Duration::from_secs(5),
                component_timeout: Duration::from_secs(5),
                signals: DEFAULT_SIGNALS.to_vec(),
                trap_signals: true,
            },
            components: Vec::new(),
            initializers: Vec::new(),
            hooks: Hooks::default(),
            registrar: None,
            state,
            stop: CancellationToken::new(),
        }
    }

    /// Override the generated instance id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.options.id = id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.options.endpoints = endpoints;
        self
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn Registrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn with_registry_timeout(mut self, timeout: Duration) -> Self {
        self.options.registry_timeout = timeout;
        self
    }

    pub fn with_component_timeout(mut self, timeout: Duration) -> Self {
        self.options.component_timeout = timeout;
        self
    }

    pub fn with_signals(mut self, signals: Vec<ShutdownSignal>) -> Self {
        self.options.signals = signals;
        self
    }

    /// Install OS signal handlers in [`App::run`] (default: true).
    pub fn with_trap_signals(mut self, trap: bool) -> Self {
        self.options.trap_signals = trap;
        self
    }

    /// Add a component. A second component with the same name replaces the first.
    pub fn with_component(mut self, name: impl Into<String>, component: Arc<dyn Component>) -> Self {
        let name = name.into();
        match self.components.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = component,
            None => self.components.push((name, component)),
        }
        self
    }

    /// Add a one-shot initializer for a local resource (cache, DB pool).
    /// Initializers run concurrently before any component starts.
    pub fn with_initializer<F>(mut self, name: impl Into<String>, init: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.initializers.push((name.into(), init.boxed()));
        self
    }

    /// Runs before components start. Failure aborts startup.
    pub fn with_before_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(AppInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.before_start.push(boxed_hook(hook));
        self
    }

    /// Runs once registered. Failure aborts startup.
    pub fn with_after_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(AppInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.after_start.push(boxed_hook(hook));
        self
    }

    /// Runs when shutdown begins, before deregistration. Failure is logged.
    pub fn with_before_stop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(AppInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.before_stop.push(boxed_hook(hook));
        self
    }

    /// Runs after every component was asked to stop. Failure is logged.
    pub fn with_after_stop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(AppInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.after_stop.push(boxed_hook(hook));
        self
    }

    /// Readiness probe for this app, available before [`build`](Self::build)
    /// so it can be mounted on a component's router.
    pub fn readiness_handler(&self) -> ReadinessHandler {
        ReadinessHandler::new(self.state.subscribe())
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.stop.clone(),
        }
    }

    pub fn build(self) -> App {
        App {
            options: self.options,
            components: self.components,
            initializers: Mutex::new(self.initializers),
            hooks: self.hooks,
            registrar: self.registrar,
            instance: Mutex::new(None),
            state: self.state,
            stop: self.stop,
            started: AtomicBool::new(false),
        }
    }
}

fn boxed_hook<F, Fut>(hook: F) -> Hook
where
    F: Fn(AppInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |info| hook(info).boxed())
}

/// Owns a set of components and drives them through the app lifecycle.
pub struct App {
    options: AppOptions,
    components: Vec<(String, Arc<dyn Component>)>,
    initializers: Mutex<Vec<Initializer>>,
    hooks: Hooks,
    registrar: Option<Arc<dyn Registrar>>,
    /// Set once components have started; read again by the shutdown path.
    instance: Mutex<Option<ServiceInstance>>,
    state: watch::Sender<AppState>,
    stop: CancellationToken,
    started: AtomicBool,
}

impl App {
    pub fn builder(name: &str, version: &str) -> AppBuilder {
        AppBuilder::new(name, version)
    }

    pub fn id(&self) -> &str {
        &self.options.id
    }

    pub fn state(&self) -> AppState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.state.subscribe()
    }

    pub fn readiness_handler(&self) -> ReadinessHandler {
        ReadinessHandler::new(self.state.subscribe())
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.stop.clone(),
        }
    }

    /// Request shutdown, as if a configured signal arrived.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// The registered instance, once built.
    pub async fn instance(&self) -> Option<ServiceInstance> {
        self.instance.lock().await.clone()
    }

    /// Live handle of component `name`, downcast to `T`.
    pub fn component<T: 'static>(&self, name: &str) -> Option<&T> {
        self.components
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, c)| c.get().downcast_ref::<T>())
    }

    /// Run the app to completion: start, register, wait for a signal or
    /// [`stop`](Self::stop), then deregister and stop.
    ///
    /// Startup failures are returned after every started component got a stop
    /// attempt. Shutdown problems are logged and never returned.
    pub async fn run(&self) -> Result<(), AppError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::AlreadyStarted);
        }
        let name = self.options.name.as_str();

        let mut signals = if self.options.trap_signals {
            Some(ShutdownSignals::install(&self.options.signals)?)
        } else {
            None
        };

        self.set_state(AppState::Initializing);
        if let Err(e) = self.run_initializers().await {
            return self.abort_startup(e, Startup::Initializing).await;
        }
        if let Err(e) = self.run_hooks(HookStage::BeforeStart, self.info(None)).await {
            return self.abort_startup(e, Startup::Initializing).await;
        }

        self.set_state(AppState::Starting);
        if let Err(e) = self.start_components().await {
            return self.abort_startup(e, Startup::Starting).await;
        }

        let instance = self.build_instance();
        *self.instance.lock().await = Some(instance.clone());
        if let Err(e) = self.register(&instance).await {
            // A timed-out register may still have landed in the store.
            let reached = match e {
                AppError::Register(registry::Error::Timeout(_)) => Startup::Registered,
                _ => Startup::Starting,
            };
            return self.abort_startup(e, reached).await;
        }
        self.set_state(AppState::Registered);

        let info = self.info(Some(&instance));
        if let Err(e) = self.run_hooks(HookStage::AfterStart, info).await {
            return self.abort_startup(e, Startup::Registered).await;
        }

        self.set_state(AppState::Running);
        metrics::emit_startup_result(name, "success");
        info!(
            service = name,
            instance_id = %instance.id,
            endpoints = ?instance.endpoints,
            "app running"
        );

        let trigger = tokio::select! {
            signal = wait_for_signal(&mut signals) => signal.to_string(),
            _ = self.stop.cancelled() => "stop".to_string(),
        };
        metrics::emit_shutdown_initiated(name, &trigger);
        info!(service = name, trigger_reason = %trigger, "shutdown initiated");

        self.shutdown(true).await;
        Ok(())
    }

    fn set_state(&self, state: AppState) {
        debug!(service = %self.options.name, %state, "app state changed");
        self.state.send_replace(state);
    }

    fn info(&self, instance: Option<&ServiceInstance>) -> AppInfo {
        AppInfo {
            id: self.options.id.clone(),
            name: self.options.name.clone(),
            version: self.options.version.clone(),
            metadata: self.options.metadata.clone(),
            endpoints: instance
                .map(|i| i.endpoints.clone())
                .unwrap_or_else(|| self.options.endpoints.clone()),
        }
    }

    async fn abort_startup(&self, err: AppError, reached: Startup) -> Result<(), AppError> {
        error!(service = %self.options.name, error = %err, "startup failed");
        metrics::emit_startup_result(&self.options.name, "failure");
        match reached {
            Startup::Initializing => self.set_state(AppState::Stopped),
            Startup::Starting => self.shutdown(false).await,
            Startup::Registered => self.shutdown(true).await,
        }
        Err(err)
    }

    async fn run_initializers(&self) -> Result<(), AppError> {
        let initializers = std::mem::take(&mut *self.initializers.lock().await);
        if initializers.is_empty() {
            return Ok(());
        }
        let pending = initializers.into_iter().map(|(name, init)| async move {
            init.await.map_err(|source| AppError::Init {
                name: name.clone(),
                source,
            })?;
            debug!(initializer = %name, "initializer finished");
            Ok::<_, AppError>(())
        });
        try_join_all(pending).await?;
        Ok(())
    }

    async fn run_hooks(&self, stage: HookStage, info: AppInfo) -> Result<(), AppError> {
        for hook in self.hooks.stage(stage) {
            hook(info.clone())
                .await
                .map_err(|source| AppError::Hook { stage, source })?;
        }
        Ok(())
    }

    /// Shutdown hooks must not keep later hooks, deregistration or stops from running.
    async fn run_hooks_logged(&self, stage: HookStage, info: AppInfo) {
        for hook in self.hooks.stage(stage) {
            if let Err(e) = hook(info.clone()).await {
                warn!(service = %self.options.name, %stage, error = %format!("{e:#}"), "hook failed");
            }
        }
    }

    /// Start every component concurrently; the first failure aborts the rest.
    async fn start_components(&self) -> Result<(), AppError> {
        let name = self.options.name.as_str();
        let timeout = self.options.component_timeout;
        let deadline = Instant::now() + timeout;
        let mut pending: BTreeSet<String> = BTreeSet::new();
        let mut tasks = JoinSet::new();

        for (component_name, component) in &self.components {
            pending.insert(component_name.clone());
            let component_name = component_name.clone();
            let component = Arc::clone(component);
            tasks.spawn(async move {
                let begun = Instant::now();
                let result = AssertUnwindSafe(component.start(deadline))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(panic_error(panic)));
                (component_name, result, begun.elapsed())
            });
        }

        loop {
            let joined = match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => return Ok(()),
                Err(_) => {
                    tasks.abort_all();
                    for component in &pending {
                        metrics::emit_component_start_duration(
                            name,
                            component,
                            "timeout",
                            timeout.as_secs_f64(),
                        );
                    }
                    return Err(AppError::StartTimeout {
                        timeout,
                        pending: pending.into_iter().collect(),
                    });
                }
            };

            let (component, result, elapsed) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tasks.abort_all();
                    return Err(AppError::ComponentStart {
                        name: "<unknown>".to_string(),
                        source: anyhow::anyhow!("start task failed: {e}"),
                    });
                }
            };
            pending.remove(&component);

            match result {
                Ok(()) => {
                    metrics::emit_component_start_duration(
                        name,
                        &component,
                        "started",
                        elapsed.as_secs_f64(),
                    );
                    info!(
                        component = %component,
                        duration_secs = elapsed.as_secs_f64(),
                        "component started"
                    );
                }
                Err(source) => {
                    tasks.abort_all();
                    metrics::emit_component_start_duration(
                        name,
                        &component,
                        "failed",
                        elapsed.as_secs_f64(),
                    );
                    return Err(AppError::ComponentStart {
                        name: component,
                        source,
                    });
                }
            }
        }
    }

    fn build_instance(&self) -> ServiceInstance {
        let listeners: Vec<_> = self
            .components
            .iter()
            .filter_map(|(_, c)| c.endpoint())
            .collect();
        let endpoints = endpoint::merge_endpoints(&self.options.endpoints, &listeners, || {
            match endpoint::outbound_ip() {
                Ok(ip) => Some(ip),
                Err(e) => {
                    warn!(error = %e, "could not determine outbound ip");
                    None
                }
            }
        });

        ServiceInstance {
            id: self.options.id.clone(),
            name: self.options.name.clone(),
            version: self.options.version.clone(),
            metadata: self.options.metadata.clone(),
            endpoints,
        }
    }

    async fn register(&self, instance: &ServiceInstance) -> Result<(), AppError> {
        let Some(registrar) = &self.registrar else {
            debug!("no registrar configured, skipping registration");
            return Ok(());
        };
        let result =
            registry::with_timeout(self.options.registry_timeout, registrar.register(instance))
                .await;
        let outcome = if result.is_ok() { "success" } else { "failure" };
        metrics::emit_registration_result(&self.options.name, "register", outcome);
        result.map_err(AppError::Register)
    }

    async fn deregister(&self) {
        let Some(registrar) = &self.registrar else {
            return;
        };
        let Some(instance) = self.instance.lock().await.clone() else {
            return;
        };
        let result =
            registry::with_timeout(self.options.registry_timeout, registrar.deregister(&instance))
                .await;
        match result {
            Ok(()) => {
                metrics::emit_registration_result(&self.options.name, "deregister", "success");
                info!(instance = %instance, "deregistered");
            }
            Err(e) => {
                metrics::emit_registration_result(&self.options.name, "deregister", "failure");
                error!(instance = %instance, error = %e, "deregistration failed");
            }
        }
    }

    /// Stop hooks, deregistration (when `registered`), then a concurrent stop
    /// of every component under one shared deadline.
    async fn shutdown(&self, registered: bool) {
        self.set_state(AppState::Stopping);
        let instance = self.instance.lock().await.clone();
        let info = self.info(instance.as_ref());

        self.run_hooks_logged(HookStage::BeforeStop, info.clone()).await;
        if registered {
            self.deregister().await;
        }
        let clean = self.stop_components().await;
        self.run_hooks_logged(HookStage::AfterStop, info).await;

        self.set_state(AppState::Stopped);
        metrics::emit_shutdown_completed(&self.options.name, clean);
        if clean {
            info!(service = %self.options.name, clean, "shutdown complete");
        } else {
            warn!(service = %self.options.name, clean, "shutdown complete with failures");
        }
    }

    /// Returns true when every component stopped cleanly in time.
    async fn stop_components(&self) -> bool {
        let name = self.options.name.as_str();
        let timeout = self.options.component_timeout;
        let shutdown_clock = Instant::now();
        let deadline = shutdown_clock + timeout;
        let mut pending: BTreeSet<String> = BTreeSet::new();
        let mut tasks = JoinSet::new();

        for (component_name, component) in &self.components {
            pending.insert(component_name.clone());
            let component_name = component_name.clone();
            let component = Arc::clone(component);
            tasks.spawn(async move {
                let result = AssertUnwindSafe(component.stop(deadline))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(panic_error(panic)));
                (component_name, result)
            });
        }

        let mut clean = true;
        loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(None) => return clean,
                Ok(Some(Ok((component, result)))) => {
                    pending.remove(&component);
                    let elapsed = shutdown_clock.elapsed().as_secs_f64();
                    match result {
                        Ok(()) => {
                            metrics::emit_component_stop_duration(name, &component, "completed", elapsed);
                            metrics::emit_component_stop_result(name, &component, "completed");
                            info!(
                                component = %component,
                                duration_secs = elapsed,
                                result = "completed",
                                "component stopped"
                            );
                        }
                        Err(e) => {
                            clean = false;
                            metrics::emit_component_stop_duration(name, &component, "failed", elapsed);
                            metrics::emit_component_stop_result(name, &component, "failed");
                            warn!(
                                component = %component,
                                duration_secs = elapsed,
                                result = "failed",
                                error = %format!("{e:#}"),
                                "component failed to stop"
                            );
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    clean = false;
                    warn!(error = %e, "component stop task failed");
                }
                Err(_) => {
                    tasks.abort_all();
                    for component in &pending {
                        metrics::emit_component_stop_result(name, component, "timeout");
                    }
                    warn!(
                        timeout_secs = timeout.as_secs_f64(),
                        remaining = ?pending,
                        "components did not stop in time"
                    );
                    return false;
                }
            }
        }
    }
}

async fn wait_for_signal(signals: &mut Option<ShutdownSignals>) -> ShutdownSignal {
    match signals {
        Some(signals) => signals.recv().await,
        None => futures::future::pending().await,
    }
}

fn panic_error(panic: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    anyhow::anyhow!("panicked: {message}")
}
