#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use registry::{
    ConsulConfig, ConsulRegistry, EtcdConfig, EtcdRegistry, RetryPolicy, ServiceInstance, Watcher,
};

pub const ETCD_ENDPOINT: &str = "http://localhost:2379";
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Each test writes under its own prefix so runs never see each other's keys.
pub fn etcd_config(test_name: &str, ttl: Duration) -> EtcdConfig {
    EtcdConfig {
        endpoints: vec![ETCD_ENDPOINT.to_string()],
        prefix: format!("/test-{}-{}/", test_name, uuid::Uuid::new_v4()),
        ttl,
        retry: fast_retry(),
        ..Default::default()
    }
}

pub async fn etcd_registry(test_name: &str, ttl: Duration) -> EtcdRegistry {
    EtcdRegistry::connect(etcd_config(test_name, ttl))
        .await
        .expect("failed to connect to etcd")
}

pub fn consul_config(address: &str) -> ConsulConfig {
    ConsulConfig {
        address: address.to_string(),
        timeout: Duration::from_secs(2),
        wait: Duration::from_millis(200),
        retry: fast_retry(),
        ..Default::default()
    }
}

pub fn consul_registry(config: ConsulConfig) -> ConsulRegistry {
    ConsulRegistry::new(config).expect("valid consul config")
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::build(1, Duration::from_millis(20))
        .max_attempts(50)
        .provide()
}

pub fn instance(name: &str, id: &str, port: u16) -> ServiceInstance {
    ServiceInstance::with_id(id, name, "1.0.0")
        .with_endpoint(format!("http://127.0.0.1:{port}"))
        .with_metadata("zone", "test")
}

pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition not met within {timeout:?}");
}

pub async fn next_members(watcher: &dyn Watcher) -> Vec<ServiceInstance> {
    tokio::time::timeout(WAIT_TIMEOUT, watcher.next())
        .await
        .expect("timed out waiting for watch")
        .expect("watch failed")
}

/// Pull snapshots until one satisfies `done`.
pub async fn next_until<F>(watcher: &dyn Watcher, done: F) -> Vec<ServiceInstance>
where
    F: Fn(&[ServiceInstance]) -> bool,
{
    tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            let members = watcher.next().await.expect("watch failed");
            if done(&members) {
                return members;
            }
        }
    })
    .await
    .expect("timed out waiting for watch")
}

pub fn ids(instances: &[ServiceInstance]) -> Vec<String> {
    let mut ids: Vec<String> = instances.iter().map(|i| i.id.clone()).collect();
    ids.sort();
    ids
}
