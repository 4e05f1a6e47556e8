use std::{error::Error, sync::Arc};

use anyhow::Context;
use bollard::{Docker, API_DEFAULT_VERSION};
use log::info;
use tokio::{net::TcpListener, task::JoinSet};

use crate::{
    config::{load_config, AppConfig, Component, DiscoveryMode},
    domain::{
        port::{SharedRuntime, SharedStore},
        routing::{
            BackendDiscovery, BackendSelector, DesiredStateDiscovery, RoundRobin,
            RuntimeDiscovery,
        },
        run_reconciler, ReconciliationService,
    },
    infra::{
        docker::DockerRuntime,
        proxy::{self, ServiceRouter},
        store::{FileDesiredStateStore, HttpDesiredStateStore},
        web,
    },
};

mod config;
mod domain;
mod infra;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Start Rokku - single service, single host deployment controller");

    let config = load_config()?;
    info!("Loaded config {:?}", config);
    let docker = Docker::connect_with_socket(
        &config.docker_socket,
        config.docker_timeout_secs,
        API_DEFAULT_VERSION,
    )
    .context("Can't connect to docker socket")?;
    let runtime: SharedRuntime = Arc::new(DockerRuntime { docker });
    let store = open_store(&config).await?;
    let service = Arc::new(ReconciliationService {
        store: store.clone(),
        runtime: runtime.clone(),
        settings: config.reconcile_settings(),
    });

    let mut tasks = JoinSet::new();
    if config.enabled(Component::Reconciler) {
        let service = service.clone();
        tasks.spawn(async move {
            run_reconciler(service).await;
            Ok::<(), anyhow::Error>(())
        });
    }
    if config.enabled(Component::Api) {
        let listener = TcpListener::bind(&config.api_listen)
            .await
            .with_context(|| format!("Can't bind api listener on {}", config.api_listen))?;
        info!("Desired state api listening on {}", config.api_listen);
        let app = web::router(service.clone());
        tasks.spawn(async move { axum::serve(listener, app).await.context("Api server failed") });
    }
    if config.enabled(Component::Router) {
        let listener = TcpListener::bind(&config.router_listen)
            .await
            .with_context(|| format!("Can't bind router listener on {}", config.router_listen))?;
        info!(
            "Service router listening on {} with {:?} discovery",
            config.router_listen, config.discovery
        );
        let selector = BackendSelector {
            discovery: discovery(&config, store, runtime),
            balancer: RoundRobin::default(),
            default_backend: config.default_backend.clone(),
        };
        let app = proxy::router(ServiceRouter::new(selector, config.forward_timeout())?);
        tasks.spawn(async move { axum::serve(listener, app).await.context("Router failed") });
    }

    while let Some(finished) = tasks.join_next().await {
        finished??;
    }
    Ok(())
}

async fn open_store(config: &AppConfig) -> Result<SharedStore, anyhow::Error> {
    Ok(match config.store_url {
        Some(ref url) => {
            info!("Reading desired state from {}", url);
            Arc::new(HttpDesiredStateStore::new(url, config.forward_timeout())?)
        }
        None => {
            let store = FileDesiredStateStore::open(&config.store_path).await?;
            info!("Desired state persisted in {:?}", store.path());
            Arc::new(store)
        }
    })
}

fn discovery(
    config: &AppConfig,
    store: SharedStore,
    runtime: SharedRuntime,
) -> Box<dyn BackendDiscovery + Send + Sync> {
    match config.discovery {
        DiscoveryMode::Runtime => Box::new(RuntimeDiscovery {
            store,
            runtime,
            backend_host: config.backend_host.clone(),
        }),
        DiscoveryMode::Desired => Box::new(DesiredStateDiscovery {
            store,
            backend_host: config.backend_host.clone(),
            base_port: config.base_port,
        }),
    }
}
