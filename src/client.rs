//! HTTP client abstraction for forwarding requests to the backend and the wake endpoint
//!
//! The dispatcher and the wake scheduler only ever talk to the network through
//! [`HttpClient`], so tests can substitute a mock that records requests and
//! simulates a sleeping backend.
use async_trait::async_trait;
use axum::response::IntoResponse;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioTimer},
};
use std::time::Duration;

pub type HyperClient = Client<hyper_tls::HttpsConnector<HttpConnector>, axum::body::Body>;

#[async_trait]
pub trait HttpClient: std::fmt::Debug + Send + Sync {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>>;
}

#[async_trait]
impl HttpClient for HyperClient {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
        self.request(req)
            .await
            .map(|res: hyper::Response<hyper::body::Incoming>| res.into_response())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
    }
}

/// Connection settings for the upstream client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Maximum number of idle connections kept per upstream host.
    pub pool_max_idle_per_host: usize,
    /// How long an idle pooled connection is kept alive.
    pub pool_idle_timeout: Duration,
    /// Bound on TCP connection establishment. Streaming calls have no overall
    /// timeout, so this is what turns an unreachable backend into a fast failure.
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: 100,
            pool_idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub fn create_hyper_client(options: &ClientOptions) -> HyperClient {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(options.connect_timeout));
    let https = hyper_tls::HttpsConnector::new_with_connector(http);

    tracing::debug!(
        "HTTP client pool config: idle_timeout={:?}, max_idle_per_host={}, connect_timeout={:?}",
        options.pool_idle_timeout,
        options.pool_max_idle_per_host,
        options.connect_timeout
    );

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(options.pool_idle_timeout)
        .pool_max_idle_per_host(options.pool_max_idle_per_host)
        .pool_timer(TokioTimer::new())
        .build(https)
}
