use anyhow::Error;
use async_trait::async_trait;

use super::model::{ContainerInstance, DesiredSpec, PortBinding};

#[async_trait]
pub trait ContainerRuntime {
    /// Instances owned by `service_name`. Only running ones unless `all` is set.
    async fn list(&self, service_name: &str, all: bool) -> Result<Vec<ContainerInstance>, Error>;

    async fn run(
        &self,
        image: &str,
        name: &str,
        binding: &PortBinding,
    ) -> Result<ContainerInstance, Error>;

    async fn stop(&self, instance: &ContainerInstance) -> Result<(), Error>;

    async fn remove(&self, instance: &ContainerInstance, force: bool) -> Result<(), Error>;
}

/// Single-record store, last write wins.
#[async_trait]
pub trait DesiredStateStore {
    /// `None` when no deployment was ever submitted.
    async fn get(&self) -> Result<Option<DesiredSpec>, Error>;

    async fn set(&self, spec: DesiredSpec) -> Result<(), Error>;
}

pub type SharedRuntime = std::sync::Arc<dyn ContainerRuntime + Send + Sync + 'static>;
pub type SharedStore = std::sync::Arc<dyn DesiredStateStore + Send + Sync + 'static>;
