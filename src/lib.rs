//! wakeproxy - a reverse proxy for LLM backends that may be asleep
//!
//! This library forwards Ollama- or LM Studio-shaped API calls to a backend on another
//! machine. While that machine is asleep it keeps clients working by serving the last
//! known model list, answering with an explicit "waking" response, and sending wake
//! signals to an out-of-band endpoint.

use axum::Router;
use axum::routing::{any, get};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod cache;
pub mod client;
pub mod dialect;
pub mod dispatcher;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod stream;
pub mod wake;

use client::{ClientOptions, HttpClient, HyperClient};
use dispatcher::{Dispatcher, ProxySettings};
use handlers::{health, proxy_handler};

/// The main application state: the dispatcher and everything it owns
#[derive(Clone, Debug)]
pub struct AppState<T: HttpClient> {
    pub dispatcher: Arc<Dispatcher<T>>,
}

impl AppState<HyperClient> {
    /// Create a new AppState with the default Hyper client
    pub fn new(settings: ProxySettings, options: &ClientOptions) -> Self {
        let http_client = client::create_hyper_client(options);
        Self::with_client(settings, http_client)
    }
}

impl<T: HttpClient + Clone + 'static> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(settings: ProxySettings, http_client: T) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(settings, http_client)),
        }
    }
}

/// Build the main router for the proxy
/// This creates routes for:
/// - `/health` - Liveness check, answered locally for any method
/// - `/` and `/{*path}` - Forwarded to the backend for GET, POST, PUT and DELETE
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    let proxy = get(proxy_handler::<T>)
        .post(proxy_handler::<T>)
        .put(proxy_handler::<T>)
        .delete(proxy_handler::<T>);
    Router::new()
        .route("/health", any(health))
        .route("/", proxy.clone())
        .route("/{*path}", proxy)
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` is prepended to every metric name. The Prometheus recorder is global, so
/// this can only be called once per process.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}
