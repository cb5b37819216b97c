//! Health reporting for the service's database dependency.
//!
//! Each check is a single ping against the connection pool: no retries,
//! no caching, no state kept between calls. Retrying is the job of whatever polls
//! the endpoint (load balancer, orchestrator), and a check never influences the
//! lifecycle of the process.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common_database::PostgresClient;
use serde_json::json;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
}

impl IntoResponse for HealthStatus {
    /// `200 {"status":"Healthy"}` or `500 {"error":"<reason>"}`.
    fn into_response(self) -> Response {
        match self {
            HealthStatus::Healthy => {
                (StatusCode::OK, Json(json!({ "status": "Healthy" }))).into_response()
            }
            HealthStatus::Unhealthy { reason } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": reason })),
            )
                .into_response(),
        }
    }
}

#[derive(Clone)]
pub struct HealthReporter {
    name: String,
    client: PostgresClient,
}

impl HealthReporter {
    pub fn new(name: &str, client: PostgresClient) -> Self {
        Self {
            name: name.to_owned(),
            client,
        }
    }

    /// Ping the database once. Can be used as an axum handler through `State`.
    pub async fn check(&self) -> HealthStatus {
        match self.client.ping().await {
            Ok(()) => {
                info!("{} health check passed", self.name);
                HealthStatus::Healthy
            }
            Err(e) => {
                let reason = e.to_string();
                error!(error = %reason, "{} health check failed", self.name);
                HealthStatus::Unhealthy { reason }
            }
        }
    }
}
