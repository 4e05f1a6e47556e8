use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The single desired deployment. Overwritten wholesale on every deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredSpec {
    pub service_name: String,
    pub image: String,
    pub replicas: u32,
    #[serde(default)]
    pub port_mapping: BTreeMap<String, Option<u16>>,
}

impl DesiredSpec {
    /// Container port every replica publishes, `default` when the mapping is empty.
    pub fn container_port<'a>(&'a self, default: &'a str) -> &'a str {
        self.port_mapping
            .keys()
            .next()
            .map(String::as_str)
            .unwrap_or(default)
    }

    /// First host port handed out to replicas of this service.
    pub fn base_port(&self, default: u16) -> u16 {
        self.port_mapping
            .values()
            .next()
            .copied()
            .flatten()
            .unwrap_or(default)
    }
}

/// Raw submission as received on the wire, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentRequest {
    pub service_name: Option<String>,
    pub image: Option<String>,
    pub replicas: Option<Value>,
    #[serde(default)]
    pub port_mapping: Option<BTreeMap<String, Option<u16>>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("replicas must be a non-negative integer, got {0}")]
    InvalidReplicas(String),
    #[error("invalid service name `{0}`")]
    InvalidServiceName(String),
}

impl TryFrom<DeploymentRequest> for DesiredSpec {
    type Error = ValidationError;

    fn try_from(request: DeploymentRequest) -> Result<Self, Self::Error> {
        let service_name = request
            .service_name
            .filter(|name| !name.trim().is_empty())
            .ok_or(ValidationError::MissingField("service_name"))?;
        if !is_valid_service_name(&service_name) {
            return Err(ValidationError::InvalidServiceName(service_name));
        }
        let image = request
            .image
            .filter(|image| !image.trim().is_empty())
            .ok_or(ValidationError::MissingField("image"))?;
        let replicas = parse_replicas(
            request
                .replicas
                .as_ref()
                .ok_or(ValidationError::MissingField("replicas"))?,
        )?;
        Ok(DesiredSpec {
            service_name,
            image,
            replicas,
            port_mapping: request.port_mapping.unwrap_or_default(),
        })
    }
}

/// Accepts `3` as well as `"3"`, which is what YAML-sourced submissions carry.
pub fn parse_replicas(value: &Value) -> Result<u32, ValidationError> {
    let parsed = match value {
        Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(text) => text.trim().parse::<u32>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ValidationError::InvalidReplicas(value.to_string()))
}

// Docker container name rules, minus the suffix we append ourselves.
fn is_valid_service_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    Restarting,
    Created,
    Exited,
    Dead,
    Other(String),
}

impl InstanceStatus {
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "running" => InstanceStatus::Running,
            "restarting" => InstanceStatus::Restarting,
            "created" => InstanceStatus::Created,
            "exited" => InstanceStatus::Exited,
            "dead" => InstanceStatus::Dead,
            other => InstanceStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Restarting => "restarting",
            InstanceStatus::Created => "created",
            InstanceStatus::Exited => "exited",
            InstanceStatus::Dead => "dead",
            InstanceStatus::Other(state) => state,
        }
    }

    /// Anything not running, restarting or created is pruned.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            InstanceStatus::Running | InstanceStatus::Restarting | InstanceStatus::Created
        )
    }
}

impl Serialize for InstanceStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInstance {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub host_port: Option<u16>,
    /// Creation time, unix seconds as reported by the runtime.
    #[serde(skip)]
    pub created: i64,
}

impl ContainerInstance {
    /// Instances are owned by `service` when named `<service>-<digits>`.
    pub fn belongs_to(&self, service: &str) -> bool {
        owned_name(&self.name, service)
    }

    /// Creation stamp carried by the name suffix, in unix milliseconds.
    pub fn name_stamp(&self) -> u128 {
        self.name
            .rsplit_once('-')
            .and_then(|(_, suffix)| suffix.parse().ok())
            .unwrap_or_default()
    }
}

pub fn owned_name(name: &str, service: &str) -> bool {
    name.trim_start_matches('/')
        .strip_prefix(service)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()))
}

/// Name for a fresh replica, unique per creation.
pub fn instance_name(service: &str, unix_millis: u128) -> String {
    format!("{}-{}", service, unix_millis)
}

/// Host side of the single port binding a new replica gets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: String,
    pub host_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleAction {
    None,
    ScaleUp { host_port: u16 },
    ScaleDown { instance: ContainerInstance },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    NoDeployment,
    Reconciled {
        pruned: Vec<String>,
        action: ScaleAction,
    },
}
