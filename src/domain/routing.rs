use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Error;
use async_trait::async_trait;
use itertools::Itertools;
use log::{debug, warn};

use super::{
    model::InstanceStatus,
    port::{SharedRuntime, SharedStore},
};

/// Process-wide rotation shared by every request.
///
/// Increments are atomic but selection is only approximately fair under
/// concurrency: two racing requests may observe different backend lists.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn next_index(&self, len: usize) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % len.max(1)
    }
}

#[async_trait]
pub trait BackendDiscovery {
    /// Base URLs of the current backends, empty when there is nothing to route to.
    async fn backends(&self) -> Result<Vec<String>, Error>;
}

/// Assumes replicas listen on the contiguous range `base .. base + replicas`.
pub struct DesiredStateDiscovery {
    pub store: SharedStore,
    pub backend_host: String,
    pub base_port: u16,
}

#[async_trait]
impl BackendDiscovery for DesiredStateDiscovery {
    async fn backends(&self) -> Result<Vec<String>, Error> {
        let Some(desired) = self.store.get().await? else {
            return Ok(vec![]);
        };
        let base = desired.base_port(self.base_port);
        Ok((base..=u16::MAX)
            .take(usize::try_from(desired.replicas).unwrap_or(usize::MAX))
            .map(|port| format!("http://{}:{}", self.backend_host, port))
            .collect())
    }
}

/// Uses the host ports actually bound by the running replicas.
pub struct RuntimeDiscovery {
    pub store: SharedStore,
    pub runtime: SharedRuntime,
    pub backend_host: String,
}

#[async_trait]
impl BackendDiscovery for RuntimeDiscovery {
    async fn backends(&self) -> Result<Vec<String>, Error> {
        let Some(desired) = self.store.get().await? else {
            return Ok(vec![]);
        };
        let instances = self.runtime.list(&desired.service_name, false).await?;
        Ok(instances
            .into_iter()
            .filter(|instance| {
                instance.status == InstanceStatus::Running
                    && instance.belongs_to(&desired.service_name)
            })
            .filter_map(|instance| instance.host_port)
            .sorted()
            .dedup()
            .map(|port| format!("http://{}:{}", self.backend_host, port))
            .collect())
    }
}

pub struct BackendSelector {
    pub discovery: Box<dyn BackendDiscovery + Send + Sync>,
    pub balancer: RoundRobin,
    pub default_backend: String,
}

impl BackendSelector {
    /// Re-resolves the backend set and picks the next one in rotation.
    pub async fn select(&self) -> String {
        let backends = match self.discovery.backends().await {
            Ok(backends) if !backends.is_empty() => backends,
            Ok(_) => {
                debug!(
                    "No backend discovered, falling back to {}",
                    self.default_backend
                );
                vec![self.default_backend.clone()]
            }
            Err(e) => {
                warn!("Service discovery failed: {:?}", e);
                vec![self.default_backend.clone()]
            }
        };
        let index = self.balancer.next_index(backends.len());
        backends
            .into_iter()
            .nth(index)
            .unwrap_or_else(|| self.default_backend.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, HashMap},
        sync::Arc,
    };

    use super::*;
    use crate::domain::{
        fake::{instance, FakeRuntime, MemoryStore},
        model::DesiredSpec,
    };

    fn spec(replicas: u32) -> DesiredSpec {
        DesiredSpec {
            service_name: "web".to_string(),
            image: "nginx".to_string(),
            replicas,
            port_mapping: BTreeMap::new(),
        }
    }

    fn desired_selector(store: Arc<MemoryStore>) -> BackendSelector {
        BackendSelector {
            discovery: Box::new(DesiredStateDiscovery {
                store,
                backend_host: "localhost".to_string(),
                base_port: 8080,
            }),
            balancer: RoundRobin::default(),
            default_backend: "http://localhost:8080".to_string(),
        }
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let balancer = RoundRobin::default();
        let picks: Vec<usize> = (0..7).map(|_| balancer.next_index(3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(RoundRobin::default().next_index(0), 0);
    }

    #[tokio::test]
    async fn sequential_requests_spread_evenly() {
        let selector = desired_selector(Arc::new(MemoryStore::new(Some(spec(3)))));
        let mut hits: HashMap<String, usize> = HashMap::new();
        for _ in 0..9 {
            *hits.entry(selector.select().await).or_default() += 1;
        }
        assert_eq!(hits.len(), 3);
        assert!(hits.values().all(|count| *count == 3));
        assert_eq!(hits.get("http://localhost:8082"), Some(&3));
    }

    #[tokio::test]
    async fn falls_back_to_default_without_deployment() {
        let store = Arc::new(MemoryStore::new(None));
        let selector = desired_selector(store.clone());
        for _ in 0..3 {
            assert_eq!(selector.select().await, "http://localhost:8080");
        }

        store.set_failing(true);
        assert_eq!(selector.select().await, "http://localhost:8080");
    }

    #[tokio::test]
    async fn zero_replicas_routes_to_default() {
        let selector = desired_selector(Arc::new(MemoryStore::new(Some(spec(0)))));
        assert_eq!(selector.select().await, "http://localhost:8080");
    }

    #[tokio::test]
    async fn desired_discovery_honours_requested_base() {
        let mut desired = spec(2);
        desired
            .port_mapping
            .insert("80/tcp".to_string(), Some(9000));
        let discovery = DesiredStateDiscovery {
            store: Arc::new(MemoryStore::new(Some(desired))),
            backend_host: "10.0.0.2".to_string(),
            base_port: 8080,
        };
        assert_eq!(
            discovery.backends().await.unwrap(),
            vec!["http://10.0.0.2:9000", "http://10.0.0.2:9001"]
        );
    }

    #[tokio::test]
    async fn runtime_discovery_uses_bound_ports() {
        let runtime = Arc::new(FakeRuntime::with_instances(vec![
            instance("web-3", InstanceStatus::Running, 8085, 3),
            instance("web-1", InstanceStatus::Running, 8080, 1),
            instance("web-2", InstanceStatus::Exited, 8081, 2),
            instance("web-api-1", InstanceStatus::Running, 8090, 1),
        ]));
        let discovery = RuntimeDiscovery {
            store: Arc::new(MemoryStore::new(Some(spec(2)))),
            runtime,
            backend_host: "localhost".to_string(),
        };
        assert_eq!(
            discovery.backends().await.unwrap(),
            vec!["http://localhost:8080", "http://localhost:8085"]
        );
    }
}
