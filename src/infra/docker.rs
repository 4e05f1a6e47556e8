use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Error};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions,
    },
    image::CreateImageOptions,
    secret::{ContainerSummary, CreateImageInfo, HostConfig, PortBinding as DockerPortBinding},
    Docker,
};
use futures::TryStreamExt;
use log::{info, warn};
use map_macro::hash_map;

use crate::domain::{
    model::{owned_name, ContainerInstance, InstanceStatus, PortBinding},
    port::ContainerRuntime,
};

const SERVICE_LABEL: &str = "rokku.service";
const HOST_PORT_LABEL: &str = "rokku.host_port";

pub struct DockerRuntime {
    pub docker: Docker,
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list(&self, service_name: &str, all: bool) -> Result<Vec<ContainerInstance>, Error> {
        // Docker matches `name` filters as a regex against the `/`-prefixed name
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all,
                filters: hash_map! {
                    "name".to_string() => vec![format!("^/{}-", service_name)]
                },
                ..Default::default()
            }))
            .await
            .context("Can't list containers from docker daemon")?;
        Ok(containers
            .into_iter()
            .filter_map(to_instance)
            .filter(|instance| owned_name(&instance.name, service_name))
            .collect())
    }

    async fn run(
        &self,
        image: &str,
        name: &str,
        binding: &PortBinding,
    ) -> Result<ContainerInstance, Error> {
        self.ensure_image(image).await?;

        let service_name = name
            .rsplit_once('-')
            .map(|(service, _)| service)
            .unwrap_or(name);
        let config = Config {
            image: Some(image.to_string()),
            exposed_ports: Some(hash_map! {
                binding.container_port.clone() => HashMap::new()
            }),
            host_config: Some(HostConfig {
                port_bindings: Some(hash_map! {
                    binding.container_port.clone() => Some(vec![DockerPortBinding {
                        host_ip: None,
                        host_port: Some(binding.host_port.to_string()),
                    }])
                }),
                ..Default::default()
            }),
            labels: Some(hash_map! {
                SERVICE_LABEL.to_string() => service_name.to_string(),
                HOST_PORT_LABEL.to_string() => binding.host_port.to_string()
            }),
            ..Default::default()
        };
        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .with_context(|| format!("Can't create container {}", name))?;
        if let Err(e) = self
            .docker
            .start_container(container.id.as_str(), None::<StartContainerOptions<String>>)
            .await
        {
            warn!("Start of {} failed, removing the created container", name);
            if let Err(cleanup) = self
                .docker
                .remove_container(
                    container.id.as_str(),
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                warn!("Can't remove container {} after failed start: {}", name, cleanup);
            }
            return Err(Error::new(e).context(format!("Can't start container {}", name)));
        }

        Ok(ContainerInstance {
            id: container.id,
            name: name.to_string(),
            status: InstanceStatus::Running,
            host_port: Some(binding.host_port),
            created: now_secs(),
        })
    }

    async fn stop(&self, instance: &ContainerInstance) -> Result<(), Error> {
        self.docker
            .stop_container(instance.id.as_str(), None::<StopContainerOptions>)
            .await
            .with_context(|| format!("Error while stopping container {}", instance.name))
    }

    async fn remove(&self, instance: &ContainerInstance, force: bool) -> Result<(), Error> {
        self.docker
            .remove_container(
                instance.id.as_str(),
                Some(RemoveContainerOptions {
                    force,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("Error while removing container {}", instance.name))
    }
}

impl DockerRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), Error> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!("Pull image {}", image);
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image,
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<CreateImageInfo>>()
            .await
            .with_context(|| format!("Error while pulling image {}", image))?;
        Ok(())
    }
}

fn to_instance(summary: ContainerSummary) -> Option<ContainerInstance> {
    let name = summary
        .names
        .as_ref()
        .and_then(|names| names.first().cloned())?;
    let host_port = host_port(&summary);
    Some(ContainerInstance {
        id: summary.id.unwrap_or_else(|| name.clone()),
        name: name.trim_start_matches('/').to_string(),
        status: InstanceStatus::parse(summary.state.as_deref().unwrap_or("unknown")),
        host_port,
        created: summary.created.unwrap_or_default(),
    })
}

// The label survives while the container is not running, published ports do not.
fn host_port(summary: &ContainerSummary) -> Option<u16> {
    summary
        .labels
        .as_ref()
        .and_then(|labels| labels.get(HOST_PORT_LABEL))
        .and_then(|port| port.parse::<u16>().ok())
        .or_else(|| {
            summary
                .ports
                .as_ref()
                .and_then(|ports| ports.iter().find_map(|port| port.public_port))
        })
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
