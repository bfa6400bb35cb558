//! HTTP surface for the agent layer and operators.
//!
//! - `GET /health`
//! - `GET /api/customers`
//! - `POST /api/customers/{name}/switch`
//! - `DELETE /api/customers/{name}`
//! - `GET /api/status`

use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::integration::IntegrationType;
use crate::orchestrator::{
    CustomerSwitchCoordinator, OrchestratorError, OrchestratorStatus, SwitchReport,
};

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct CustomerSummary {
    name: String,
    description: String,
    host: String,
    integrations: Vec<IntegrationType>,
    resident: bool,
    default: bool,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    status: &'static str,
    customer: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Orchestrator error mapped onto an HTTP status.
struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_config_error() {
            StatusCode::NOT_FOUND
        } else if self.0.is_transient() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse { status: "healthy" })
}

async fn customers_handler(
    State(coordinator): State<Arc<CustomerSwitchCoordinator>>,
) -> Json<Vec<CustomerSummary>> {
    let catalog = coordinator.catalog();
    let resident = coordinator.manager().resident_customers();
    let default = catalog.default_customer().map(|c| c.name.clone());

    let customers = catalog
        .customer_names()
        .iter()
        .filter_map(|name| catalog.customer(name))
        .map(|spec| CustomerSummary {
            name: spec.name.clone(),
            description: spec.description.clone(),
            host: spec.host.clone(),
            integrations: spec.required_integrations(),
            resident: resident.contains(&spec.name),
            default: default.as_deref() == Some(spec.name.as_str()),
        })
        .collect();
    Json(customers)
}

async fn switch_handler(
    State(coordinator): State<Arc<CustomerSwitchCoordinator>>,
    Path(name): Path<String>,
) -> Result<Json<SwitchReport>, ApiError> {
    let report = coordinator.switch_to(&name).await?;
    Ok(Json(report))
}

async fn cleanup_handler(
    State(coordinator): State<Arc<CustomerSwitchCoordinator>>,
    Path(name): Path<String>,
) -> Result<Json<CleanupResponse>, ApiError> {
    coordinator.cleanup(&name).await?;
    Ok(Json(CleanupResponse {
        status: "released",
        customer: name,
    }))
}

async fn status_handler(
    State(coordinator): State<Arc<CustomerSwitchCoordinator>>,
) -> Json<OrchestratorStatus> {
    Json(coordinator.status())
}

pub fn router(coordinator: Arc<CustomerSwitchCoordinator>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/customers", get(customers_handler))
        .route("/api/customers/{name}/switch", post(switch_handler))
        .route("/api/customers/{name}", delete(cleanup_handler))
        .route("/api/status", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

/// Serve the API on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    coordinator: Arc<CustomerSwitchCoordinator>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("API listening on {}", addr);
    }
    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(shutdown)
        .await
}
