use std::sync::Arc;

use anyhow::Error;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::{
    list_instances,
    model::{parse_replicas, ContainerInstance, DeploymentRequest, DesiredSpec, ValidationError},
    ReconciliationService,
};

pub fn router(service: Arc<ReconciliationService>) -> Router {
    Router::new()
        .route("/deploy", post(deploy))
        .route("/scale", post(scale))
        .route("/status", get(status))
        .route("/containers", get(list_containers))
        .with_state(service)
}

#[derive(Debug, Serialize)]
struct DeployResponse {
    status: &'static str,
    message: &'static str,
    desired_replicas: u32,
}

impl DeployResponse {
    fn accepted(desired_replicas: u32) -> Json<Self> {
        Json(Self {
            status: "success",
            message: "Desired state updated. The reconciler will converge shortly.",
            desired_replicas,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ScaleRequest {
    replicas: Option<Value>,
}

enum ApiError {
    BadRequest(String),
    NoDeployment,
    Internal(&'static str, Error),
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(format!("No valid JSON data received: {}", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::NoDeployment => (
                StatusCode::NOT_FOUND,
                Json(json!({ "message": "No active deployments found" })),
            )
                .into_response(),
            ApiError::Internal(operation, e) => {
                error!("Error during {} {:?}", operation, e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": format!("Something went wrong: {e}") })),
                )
                    .into_response()
            }
        }
    }
}

async fn deploy(
    State(service): State<Arc<ReconciliationService>>,
    payload: Result<Json<DeploymentRequest>, JsonRejection>,
) -> Result<Json<DeployResponse>, ApiError> {
    let Json(request) = payload?;
    let spec = DesiredSpec::try_from(request)?;
    info!(
        "Updating desired state for {}: {} x {}",
        spec.service_name, spec.replicas, spec.image
    );
    let replicas = spec.replicas;
    service
        .store
        .set(spec)
        .await
        .map_err(|e| ApiError::Internal("deploy", e))?;
    Ok(DeployResponse::accepted(replicas))
}

async fn scale(
    State(service): State<Arc<ReconciliationService>>,
    payload: Result<Json<ScaleRequest>, JsonRejection>,
) -> Result<Json<DeployResponse>, ApiError> {
    let Json(request) = payload?;
    let replicas = parse_replicas(
        request
            .replicas
            .as_ref()
            .ok_or(ValidationError::MissingField("replicas"))?,
    )?;
    let current = service
        .store
        .get()
        .await
        .map_err(|e| ApiError::Internal("scale", e))?
        .ok_or(ApiError::NoDeployment)?;
    info!(
        "Scaling {} from {} to {} replicas",
        current.service_name, current.replicas, replicas
    );
    service
        .store
        .set(DesiredSpec {
            replicas,
            ..current
        })
        .await
        .map_err(|e| ApiError::Internal("scale", e))?;
    Ok(DeployResponse::accepted(replicas))
}

async fn status(
    State(service): State<Arc<ReconciliationService>>,
) -> Result<Json<DesiredSpec>, ApiError> {
    service
        .store
        .get()
        .await
        .map_err(|e| ApiError::Internal("status", e))?
        .map(Json)
        .ok_or(ApiError::NoDeployment)
}

async fn list_containers(
    State(service): State<Arc<ReconciliationService>>,
) -> Result<Json<Vec<ContainerInstance>>, ApiError> {
    list_instances(&service)
        .await
        .map(Json)
        .map_err(|e| ApiError::Internal("list_containers", e))
}
