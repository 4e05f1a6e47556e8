use std::{sync::Arc, time::Duration};

use anyhow::{Context, Error};
use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderName, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use log::{info, warn};

use crate::domain::routing::BackendSelector;

fn hop_by_hop() -> [HeaderName; 8] {
    [
        header::CONNECTION,
        header::HOST,
        header::CONTENT_LENGTH,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ]
}

pub struct ServiceRouter {
    pub selector: BackendSelector,
    pub client: reqwest::Client,
}

impl ServiceRouter {
    pub fn new(selector: BackendSelector, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .context("Can't build forwarding client")?;
        Ok(Self { selector, client })
    }
}

/// Every method and path is forwarded to the next backend in rotation.
pub fn router(service_router: ServiceRouter) -> Router {
    Router::new()
        .fallback(forward)
        .with_state(Arc::new(service_router))
}

async fn forward(
    State(service_router): State<Arc<ServiceRouter>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let backend = service_router.selector.select().await;
    let path = uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str())
        .unwrap_or("/");
    let target = format!("{}{}", backend.trim_end_matches('/'), path);
    info!("Round robin: routing {} {} to {}", method, path, target);

    match relay(&service_router.client, method, &target, headers, body).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Replica at {} is unavailable: {:?}", target, e);
            (
                StatusCode::BAD_GATEWAY,
                format!(
                    "Replica at {} is unavailable. Health check will restart it soon.",
                    target
                ),
            )
                .into_response()
        }
    }
}

async fn relay(
    client: &reqwest::Client,
    method: Method,
    target: &str,
    mut headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    for name in hop_by_hop() {
        headers.remove(name);
    }
    let upstream = client
        .request(method, target)
        .headers(headers)
        .body(body)
        .send()
        .await?;
    let status = upstream.status();
    let content_type = upstream.headers().get(header::CONTENT_TYPE).cloned();
    let bytes = upstream.bytes().await?;

    let mut response = (status, bytes).into_response();
    match content_type {
        Some(content_type) => {
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, content_type);
        }
        None => {
            response.headers_mut().remove(header::CONTENT_TYPE);
        }
    }
    Ok(response)
}
