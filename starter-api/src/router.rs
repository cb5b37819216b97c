use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use health::{HealthReporter, HealthStatus};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Requests that take longer than `write_timeout` to produce a response get a 408.
pub fn router(reporter: HealthReporter, write_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health))
        .layer(TimeoutLayer::new(write_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(reporter)
}

async fn health(State(reporter): State<HealthReporter>) -> HealthStatus {
    reporter.check().await
}
