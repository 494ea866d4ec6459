/// Axum handlers for the proxy server
use crate::AppState;
use crate::client::HttpClient;
use crate::models::HealthResponse;
use axum::{Json, extract::State, response::Response};
use tracing::{debug, instrument};

/// Liveness check, answered locally and never proxied.
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    debug!("Health check");
    Json(HealthResponse::healthy())
}

/// Hands every other request to the dispatcher.
#[instrument(skip(state, req))]
pub async fn proxy_handler<T: HttpClient + Clone + 'static>(
    State(state): State<AppState<T>>,
    req: axum::extract::Request,
) -> Response {
    state.dispatcher.dispatch(req).await
}
