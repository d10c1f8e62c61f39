#![allow(dead_code)]

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lifecycle::{App, AppState, Component, ListenEndpoint};
use registry::{Registrar, ServiceInstance};
use tokio::time::Instant;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared, ordered record of what happened across components and registrar.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.position(event).is_some()
    }
}

// ── Components ──────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Ok,
    Fail,
    Hang,
    Panic,
}

pub struct FakeComponent {
    pub name: String,
    log: EventLog,
    start: Behavior,
    stop: Behavior,
    start_delay: Duration,
    endpoint: Option<ListenEndpoint>,
}

impl FakeComponent {
    pub fn new(name: &str, log: &EventLog) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            start: Behavior::Ok,
            stop: Behavior::Ok,
            start_delay: Duration::ZERO,
            endpoint: None,
        }
    }

    pub fn start_behavior(mut self, behavior: Behavior) -> Self {
        self.start = behavior;
        self
    }

    pub fn stop_behavior(mut self, behavior: Behavior) -> Self {
        self.stop = behavior;
        self
    }

    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn listening(mut self, scheme: &str, addr: &str) -> Self {
        self.endpoint = Some(ListenEndpoint::new(scheme, addr.parse().unwrap()));
        self
    }

    pub fn arc(self) -> Arc<dyn Component> {
        Arc::new(self)
    }
}

async fn act(behavior: Behavior, what: &str) -> anyhow::Result<()> {
    match behavior {
        Behavior::Ok => Ok(()),
        Behavior::Fail => anyhow::bail!("{what} failed"),
        Behavior::Hang => futures::future::pending().await,
        Behavior::Panic => panic!("{what} panicked"),
    }
}

#[async_trait]
impl Component for FakeComponent {
    async fn start(&self, _deadline: Instant) -> anyhow::Result<()> {
        tokio::time::sleep(self.start_delay).await;
        self.log.push(format!("start:{}", self.name));
        act(self.start, "start").await
    }

    async fn stop(&self, _deadline: Instant) -> anyhow::Result<()> {
        self.log.push(format!("stop:{}", self.name));
        act(self.stop, "stop").await
    }

    fn get(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn endpoint(&self) -> Option<ListenEndpoint> {
        self.endpoint.clone()
    }
}

// ── Registrar ───────────────────────────────────────────────────

pub struct RecordingRegistrar {
    log: EventLog,
    fail_register: bool,
    fail_deregister: bool,
    register_delay: Duration,
    pub registered: Mutex<Vec<ServiceInstance>>,
}

impl RecordingRegistrar {
    pub fn new(log: &EventLog) -> Self {
        Self {
            log: log.clone(),
            fail_register: false,
            fail_deregister: false,
            register_delay: Duration::ZERO,
            registered: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_register(mut self) -> Self {
        self.fail_register = true;
        self
    }

    /// Register hangs for `delay` after being logged.
    pub fn slow_register(mut self, delay: Duration) -> Self {
        self.register_delay = delay;
        self
    }

    pub fn failing_deregister(mut self) -> Self {
        self.fail_deregister = true;
        self
    }

    pub fn last_registered(&self) -> Option<ServiceInstance> {
        self.registered.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Registrar for RecordingRegistrar {
    async fn register(&self, instance: &ServiceInstance) -> registry::Result<()> {
        self.log.push(format!("register:{}", instance.id));
        tokio::time::sleep(self.register_delay).await;
        if self.fail_register {
            return Err(registry::Error::InvalidConfig("store unreachable".to_string()));
        }
        self.registered.lock().unwrap().push(instance.clone());
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> registry::Result<()> {
        self.log.push(format!("deregister:{}", instance.id));
        if self.fail_deregister {
            return Err(registry::Error::InvalidConfig("store unreachable".to_string()));
        }
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────

pub fn test_app(name: &str) -> lifecycle::AppBuilder {
    App::builder(name, "1.0.0")
        .with_id("a1")
        .with_trap_signals(false)
        .with_component_timeout(Duration::from_secs(2))
}

pub async fn wait_for_state(app: &App, state: AppState) {
    let mut rx = app.subscribe();
    tokio::time::timeout(WAIT_TIMEOUT, rx.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for app state")
        .expect("state channel closed");
}
