use std::{
    cmp::Ordering,
    collections::HashSet,
    future::Future,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context, Error};
use log::{debug, error, info};
use model::{
    instance_name, ContainerInstance, CycleOutcome, DesiredSpec, InstanceStatus, PortBinding,
    ScaleAction,
};
use port::{SharedRuntime, SharedStore};
use split_iter::Splittable;

pub mod allocator;
pub mod model;
pub mod port;
pub mod routing;

#[cfg(test)]
pub mod fake;

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub base_port: u16,
    pub container_port: String,
    pub call_timeout: Duration,
    pub interval: Duration,
}

pub struct ReconciliationService {
    pub store: SharedStore,
    pub runtime: SharedRuntime,
    pub settings: ReconcileSettings,
}

/// Splits owned instances into `(live, terminal)`.
pub fn prune_candidates(
    observed: Vec<ContainerInstance>,
) -> (Vec<ContainerInstance>, Vec<ContainerInstance>) {
    let (live, terminal) = observed
        .into_iter()
        .split(|instance| instance.status.is_terminal());
    (live.collect(), terminal.collect())
}

/// Decides the single scale action of a cycle.
///
/// Only `running` instances count towards the replica total, but every live
/// instance keeps its host port reserved. When live instances outnumber the
/// replicas, idle `created` ones go first, then `restarting` ones, then the
/// newest running instance.
pub fn plan_scale(
    desired: &DesiredSpec,
    observed: &[ContainerInstance],
    default_base: u16,
) -> Result<ScaleAction, Error> {
    let live: Vec<&ContainerInstance> = observed
        .iter()
        .filter(|instance| !instance.status.is_terminal())
        .collect();
    let active = live
        .iter()
        .filter(|instance| instance.status == InstanceStatus::Running)
        .count();
    let target = usize::try_from(desired.replicas).unwrap_or(usize::MAX);
    if live.len() > target {
        return Ok(live
            .into_iter()
            .max_by(|a, b| surplus_rank(a).cmp(&surplus_rank(b)))
            .cloned()
            .map(|instance| ScaleAction::ScaleDown { instance })
            .unwrap_or(ScaleAction::None));
    }
    match active.cmp(&target) {
        Ordering::Less => {
            let used: HashSet<u16> = live
                .iter()
                .filter_map(|instance| instance.host_port)
                .collect();
            let base = desired.base_port(default_base);
            allocator::allocate(base, &used)
                .map(|host_port| ScaleAction::ScaleUp { host_port })
                .ok_or_else(|| anyhow!("No free host port at or above {}", base))
        }
        _ => Ok(ScaleAction::None),
    }
}

// Highest rank is removed first: not running before running, newest name stamp first.
fn surplus_rank(instance: &ContainerInstance) -> (u8, u128, i64, &str) {
    let idle = match instance.status {
        InstanceStatus::Created => 2,
        InstanceStatus::Running => 0,
        _ => 1,
    };
    (
        idle,
        instance.name_stamp(),
        instance.created,
        instance.id.as_str(),
    )
}

impl ReconciliationService {
    async fn bounded<T>(
        &self,
        call: &str,
        future: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        tokio::time::timeout(self.settings.call_timeout, future)
            .await
            .map_err(|_| {
                anyhow!(
                    "Runtime call {} timed out after {:?}",
                    call,
                    self.settings.call_timeout
                )
            })?
    }

    async fn owned(&self, service_name: &str) -> Result<Vec<ContainerInstance>, Error> {
        let instances = self
            .bounded("list", self.runtime.list(service_name, true))
            .await
            .context("Can't list service instances")?;
        Ok(instances
            .into_iter()
            .filter(|instance| instance.belongs_to(service_name))
            .collect())
    }
}

/// One reconciliation cycle: prune terminal instances, then take at most one scale action.
pub async fn reconcile(service: &ReconciliationService) -> Result<CycleOutcome, Error> {
    let desired = match service
        .bounded("store get", service.store.get())
        .await
        .context("Can't read desired state")?
    {
        Some(desired) => desired,
        None => return Ok(CycleOutcome::NoDeployment),
    };
    let service_name = desired.service_name.as_str();

    let (_, terminal) = prune_candidates(service.owned(service_name).await?);
    let mut pruned = Vec::with_capacity(terminal.len());
    for instance in terminal {
        info!(
            "Pruning dead container {} ({})",
            instance.name,
            instance.status.as_str()
        );
        service
            .bounded("remove", service.runtime.remove(&instance, true))
            .await
            .with_context(|| format!("Can't prune container {}", instance.name))?;
        pruned.push(instance.name);
    }

    let (live, _) = prune_candidates(service.owned(service_name).await?);
    let action = plan_scale(&desired, &live, service.settings.base_port)?;
    match &action {
        ScaleAction::ScaleUp { host_port } => {
            let name = fresh_name(service_name, &live)?;
            let binding = PortBinding {
                container_port: desired
                    .container_port(&service.settings.container_port)
                    .to_string(),
                host_port: *host_port,
            };
            info!(
                "Scaling up: starting {} on port {} ({}/{} running)",
                name,
                host_port,
                running_count(&live),
                desired.replicas
            );
            let started = service
                .bounded("run", service.runtime.run(&desired.image, &name, &binding))
                .await
                .with_context(|| format!("Can't start container {}", name))?;
            info!("Instance {} started", started.id);
        }
        ScaleAction::ScaleDown { instance } => {
            info!(
                "Scaling down: removing surplus container {} ({}/{} running)",
                instance.name,
                running_count(&live),
                desired.replicas
            );
            // Only a running container has anything to stop.
            let running = instance.status == InstanceStatus::Running;
            if running {
                service
                    .bounded("stop", service.runtime.stop(instance))
                    .await
                    .with_context(|| format!("Can't stop container {}", instance.name))?;
            }
            service
                .bounded("remove", service.runtime.remove(instance, !running))
                .await
                .with_context(|| format!("Can't remove container {}", instance.name))?;
        }
        ScaleAction::None => debug!(
            "Service {} is up-to-date with {} replicas",
            service_name, desired.replicas
        ),
    }
    Ok(CycleOutcome::Reconciled { pruned, action })
}

fn running_count(instances: &[ContainerInstance]) -> usize {
    instances
        .iter()
        .filter(|instance| instance.status == InstanceStatus::Running)
        .count()
}

// Millisecond stamp, bumped past any name still held by a live instance.
fn fresh_name(service_name: &str, live: &[ContainerInstance]) -> Result<String, Error> {
    let taken: HashSet<&str> = live
        .iter()
        .map(|instance| instance.name.trim_start_matches('/'))
        .collect();
    let mut stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("Time went backward")?
        .as_millis();
    while taken.contains(instance_name(service_name, stamp).as_str()) {
        stamp += 1;
    }
    Ok(instance_name(service_name, stamp))
}

/// Runs cycles forever, one at a time, sleeping `interval` between them.
///
/// A failed or panicking cycle is logged and the next one is the retry.
pub async fn run_reconciler(service: Arc<ReconciliationService>) {
    info!(
        "Reconciler active, cycle every {:?}",
        service.settings.interval
    );
    loop {
        let cycle = {
            let service = service.clone();
            tokio::spawn(async move { reconcile(&service).await })
        };
        match cycle.await {
            Ok(Ok(CycleOutcome::NoDeployment)) => {
                info!("No active deployment, skipping reconciliation")
            }
            Ok(Ok(CycleOutcome::Reconciled { pruned, action })) => {
                debug!("Cycle done, pruned {:?}, action {:?}", pruned, action)
            }
            Ok(Err(e)) => error!("Reconciliation cycle failed: {:?}", e),
            Err(e) => error!("Reconciliation cycle aborted: {}", e),
        }
        tokio::time::sleep(service.settings.interval).await;
    }
}

/// Every instance of the current service, whatever its status.
pub async fn list_instances(
    service: &ReconciliationService,
) -> Result<Vec<ContainerInstance>, Error> {
    let desired = service
        .bounded("store get", service.store.get())
        .await
        .context("Can't read desired state")?;
    match desired {
        Some(desired) => service.owned(&desired.service_name).await,
        None => Ok(vec![]),
    }
}
