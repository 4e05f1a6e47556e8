use std::time::Duration;

use anyhow::{Context, Error};
use config::{Config, ConfigBuilder, Environment, File};

use crate::domain::ReconcileSettings;

#[derive(Debug, Clone, Copy, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Api,
    Reconciler,
    Router,
}

#[derive(Debug, Clone, Copy, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Host ports of the running replicas, as reported by the runtime.
    Runtime,
    /// `base_port + index` for every desired replica.
    Desired,
}

#[derive(Debug, Clone, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub docker_socket: String,
    pub docker_timeout_secs: u64,
    pub store_path: String,
    /// Remote api component to read desired state from instead of `store_path`.
    pub store_url: Option<String>,
    pub api_listen: String,
    pub router_listen: String,
    pub components: Vec<Component>,
    pub reconcile_interval_secs: u64,
    pub runtime_call_timeout_secs: u64,
    pub base_port: u16,
    pub container_port: String,
    pub backend_host: String,
    pub default_backend: String,
    pub forward_timeout_millis: u64,
    pub discovery: DiscoveryMode,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            docker_socket: "/var/run/docker.sock".to_string(),
            docker_timeout_secs: 120,
            store_path: "cluster_state.json".to_string(),
            store_url: None,
            api_listen: "0.0.0.0:5000".to_string(),
            router_listen: "0.0.0.0:80".to_string(),
            components: vec![Component::Api, Component::Reconciler, Component::Router],
            reconcile_interval_secs: 10,
            runtime_call_timeout_secs: 120,
            base_port: 8080,
            container_port: "80/tcp".to_string(),
            backend_host: "localhost".to_string(),
            default_backend: "http://localhost:8080".to_string(),
            forward_timeout_millis: 2000,
            discovery: DiscoveryMode::Runtime,
        }
    }
}

impl AppConfig {
    pub fn enabled(&self, component: Component) -> bool {
        self.components.contains(&component)
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            base_port: self.base_port,
            container_port: self.container_port.clone(),
            call_timeout: Duration::from_secs(self.runtime_call_timeout_secs),
            interval: Duration::from_secs(self.reconcile_interval_secs),
        }
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_millis)
    }
}

pub fn load_config() -> Result<AppConfig, Error> {
    build_config(
        Config::builder()
            .add_source(File::with_name("rokku").required(false))
            .add_source(
                Environment::with_prefix("rokku")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("components"),
            ),
    )
}

fn build_config(
    builder: ConfigBuilder<config::builder::DefaultState>,
) -> Result<AppConfig, Error> {
    let config = builder.build().context("Can't load configuration")?;

    config
        .try_deserialize()
        .context("Can't deserialize AppConfig from loaded configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_sources() {
        let config = build_config(Config::builder()).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(config.enabled(Component::Router));
        assert_eq!(config.forward_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn overrides_individual_keys() {
        let config = build_config(
            Config::builder()
                .set_override("base_port", 9000)
                .unwrap()
                .set_override("components", vec!["api", "reconciler"])
                .unwrap()
                .set_override("discovery", "desired")
                .unwrap(),
        )
        .unwrap();
        assert_eq!(config.base_port, 9000);
        assert_eq!(config.discovery, DiscoveryMode::Desired);
        assert!(!config.enabled(Component::Router));
        assert_eq!(config.reconcile_settings().base_port, 9000);
        assert_eq!(config.docker_socket, "/var/run/docker.sock");
    }
}
