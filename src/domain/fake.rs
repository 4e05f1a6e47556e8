//! In-memory runtime and store used by the tests.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, RwLock,
};

use anyhow::{anyhow, Error};
use async_trait::async_trait;

use super::{
    model::{ContainerInstance, DesiredSpec, InstanceStatus, PortBinding},
    port::{ContainerRuntime, DesiredStateStore},
};

pub fn instance(name: &str, status: InstanceStatus, host_port: u16, created: i64) -> ContainerInstance {
    ContainerInstance {
        id: format!("id-{}", name),
        name: name.to_string(),
        status,
        host_port: Some(host_port),
        created,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List { service: String, all: bool },
    Run { name: String, host_port: u16 },
    Stop(String),
    Remove { id: String, force: bool },
}

#[derive(Default)]
struct State {
    instances: Vec<ContainerInstance>,
    calls: Vec<Call>,
    clock: i64,
}

/// Behaves like the Docker engine: name filtering is a loose substring match.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
    failing: AtomicBool,
    hanging: AtomicBool,
}

impl FakeRuntime {
    pub fn with_instances(instances: Vec<ContainerInstance>) -> Self {
        let clock = instances.iter().map(|i| i.created).max().unwrap_or(0);
        Self {
            state: Mutex::new(State {
                instances,
                calls: vec![],
                clock,
            }),
            ..Default::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn all(&self) -> Vec<ContainerInstance> {
        self.state.lock().unwrap().instances.clone()
    }

    pub fn running(&self) -> Vec<ContainerInstance> {
        self.all()
            .into_iter()
            .filter(|i| i.status == InstanceStatus::Running)
            .collect()
    }

    async fn enter(&self, call: Call) -> Result<(), Error> {
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("Cannot connect to the Docker daemon"));
        }
        self.state.lock().unwrap().calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list(&self, service_name: &str, all: bool) -> Result<Vec<ContainerInstance>, Error> {
        self.enter(Call::List {
            service: service_name.to_string(),
            all,
        })
        .await?;
        Ok(self
            .all()
            .into_iter()
            .filter(|i| i.name.contains(service_name))
            .filter(|i| all || i.status == InstanceStatus::Running)
            .collect())
    }

    async fn run(
        &self,
        _image: &str,
        name: &str,
        binding: &PortBinding,
    ) -> Result<ContainerInstance, Error> {
        self.enter(Call::Run {
            name: name.to_string(),
            host_port: binding.host_port,
        })
        .await?;
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let started = ContainerInstance {
            id: format!("id-{}", name),
            name: name.to_string(),
            status: InstanceStatus::Running,
            host_port: Some(binding.host_port),
            created: state.clock,
        };
        state.instances.push(started.clone());
        Ok(started)
    }

    async fn stop(&self, instance: &ContainerInstance) -> Result<(), Error> {
        self.enter(Call::Stop(instance.id.clone())).await?;
        let mut state = self.state.lock().unwrap();
        state
            .instances
            .iter_mut()
            .filter(|i| i.id == instance.id)
            .for_each(|i| i.status = InstanceStatus::Exited);
        Ok(())
    }

    async fn remove(&self, instance: &ContainerInstance, force: bool) -> Result<(), Error> {
        self.enter(Call::Remove {
            id: instance.id.clone(),
            force,
        })
        .await?;
        self.state
            .lock()
            .unwrap()
            .instances
            .retain(|i| i.id != instance.id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    spec: RwLock<Option<DesiredSpec>>,
    failing: AtomicBool,
    hanging: AtomicBool,
}

impl MemoryStore {
    pub fn new(spec: Option<DesiredSpec>) -> Self {
        Self {
            spec: RwLock::new(spec),
            failing: AtomicBool::new(false),
            hanging: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }
}

#[async_trait]
impl DesiredStateStore for MemoryStore {
    async fn get(&self) -> Result<Option<DesiredSpec>, Error> {
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("store unreachable"));
        }
        Ok(self.spec.read().unwrap().clone())
    }

    async fn set(&self, spec: DesiredSpec) -> Result<(), Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("store unreachable"));
        }
        *self.spec.write().unwrap() = Some(spec);
        Ok(())
    }
}
