//! The proxy core: routes a request to the backend and decides what to answer when
//! the backend is not there.
//!
//! Requests to the dialect's generation endpoints are streamed line by line with no
//! overall timeout. Everything else is buffered under a path-dependent timeout. When
//! the backend times out or refuses the connection, the model-list path falls back
//! to the cached list, other paths get a synthetic error, and a wake is fired in the
//! background.
use crate::{
    cache::ModelListCache,
    client::HttpClient,
    dialect::Dialect,
    errors::ProxyError,
    models::MessageResponse,
    stream::LineBufferedStream,
    wake::WakeScheduler,
};
use axum::{
    Json,
    body::{Body, Bytes},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bon::Builder;
use futures_util::TryStreamExt;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

/// Headers that describe a single connection hop and must not be relayed.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Redirect hops followed for a single buffered request.
const MAX_REDIRECTS: usize = 10;

/// Resolved, immutable proxy settings.
#[derive(Debug, Clone, Builder)]
pub struct ProxySettings {
    /// Base URL of the backend, e.g. `http://gpu-box:11434`.
    #[builder(into)]
    pub backend_url: String,
    pub dialect: Dialect,
    /// Endpoint that wakes the backend machine. Waking is disabled without it.
    #[builder(into)]
    pub wake_url: Option<String>,
    /// Timeout for the model-list path.
    pub list_timeout: Duration,
    /// Timeout for every other buffered request.
    #[builder(default = Duration::from_secs(30))]
    pub model_timeout: Duration,
    /// Minimum time between preventive wakes.
    #[builder(default = Duration::from_secs(10 * 60))]
    pub wake_interval: Duration,
    /// How long a cached model list stays servable.
    #[builder(default = Duration::from_secs(1440 * 60))]
    pub cache_duration: Duration,
    /// Bound on a single wake call.
    #[builder(default = Duration::from_secs(10))]
    pub wake_timeout: Duration,
}

/// Per-request routing, derived from the path.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub target_url: String,
    pub timeout: Duration,
    pub is_model_list: bool,
    pub is_generation: bool,
}

#[derive(Debug)]
pub struct Dispatcher<T: HttpClient> {
    settings: ProxySettings,
    client: T,
    cache: Arc<ModelListCache>,
    waker: Arc<WakeScheduler<T>>,
}

impl<T: HttpClient + Clone + 'static> Dispatcher<T> {
    pub fn new(settings: ProxySettings, client: T) -> Self {
        let cache = Arc::new(ModelListCache::new(settings.cache_duration));
        let waker = Arc::new(WakeScheduler::new(
            client.clone(),
            settings.wake_url.clone(),
            settings.wake_interval,
            settings.wake_timeout,
        ));
        Self {
            settings,
            client,
            cache,
            waker,
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<ModelListCache> {
        &self.cache
    }

    pub fn waker(&self) -> &Arc<WakeScheduler<T>> {
        &self.waker
    }

    /// Computes target URL, timeout and mode for a request URI.
    pub fn route(&self, uri: &Uri) -> RoutingDecision {
        let path = uri.path().trim_start_matches('/');
        let dialect = self.settings.dialect;
        let is_model_list = dialect.is_model_list(path);

        let mut target_url = format!(
            "{}/{}",
            self.settings.backend_url.trim_end_matches('/'),
            path
        );
        if let Some(query) = uri.query() {
            target_url.push('?');
            target_url.push_str(query);
        }

        RoutingDecision {
            target_url,
            timeout: if is_model_list {
                self.settings.list_timeout
            } else {
                self.settings.model_timeout
            },
            is_model_list,
            is_generation: dialect.is_generation_endpoint(path),
        }
    }

    /// Handles one proxied request. Always produces a response.
    #[instrument(skip(self, req), fields(method = %req.method(), path = %req.uri().path()))]
    pub async fn dispatch(&self, req: axum::extract::Request) -> Response {
        // Preventive wake, awaited so a sleeping machine gets a head start on this request.
        self.waker.wake_if_due().await;

        let method = req.method().clone();
        let route = self.route(req.uri());
        debug!("Routing to {} (timeout {:?})", route.target_url, route.timeout);

        match self.forward(req, &route).await {
            Ok(response) => response,
            Err(err) => self.recover(err, &method, &route).await,
        }
    }

    async fn forward(
        &self,
        req: axum::extract::Request,
        route: &RoutingDecision,
    ) -> Result<Response, ProxyError> {
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| ProxyError::Unexpected(format!("failed to read request body: {e}")))?;
        let headers = strip_hop_by_hop(&parts.headers);

        if route.is_generation && parts.method == Method::POST {
            self.forward_streaming(route, headers, body).await
        } else {
            self.forward_buffered(parts.method, route, headers, body).await
        }
    }

    async fn forward_buffered(
        &self,
        method: Method,
        route: &RoutingDecision,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response, ProxyError> {
        let is_list_get = route.is_model_list && method == Method::GET;

        // Redirects are followed inside the timeout, so the whole chain shares one budget.
        let call = async {
            let (mut method, mut headers, mut body) = (method, headers, body);
            let mut url = route.target_url.clone();
            let mut hops = 0;
            loop {
                let upstream = build_request(method.clone(), &url, headers.clone(), body.clone())?;
                let response = self
                    .client
                    .request(upstream)
                    .await
                    .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;

                if let Some(next) = redirect_location(&response, &url)? {
                    if hops == MAX_REDIRECTS {
                        return Err(ProxyError::Unexpected(format!(
                            "too many redirects from {}",
                            route.target_url
                        )));
                    }
                    hops += 1;
                    debug!("Following {} redirect to {}", response.status(), next);
                    if redirect_switches_to_get(response.status(), &method) {
                        method = Method::GET;
                        body = Bytes::new();
                        headers.remove(header::CONTENT_TYPE);
                    }
                    url = next;
                    continue;
                }

                let (parts, body) = response.into_parts();
                let body = axum::body::to_bytes(body, usize::MAX)
                    .await
                    .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;
                return Ok::<_, ProxyError>((parts, body));
            }
        };
        let (parts, body) = tokio::time::timeout(route.timeout, call)
            .await
            .map_err(|_| ProxyError::UpstreamTimeout(route.timeout))??;

        if is_list_get && parts.status == StatusCode::OK {
            match serde_json::from_slice::<Value>(&body) {
                Ok(payload) => self.cache.put(payload).await,
                Err(e) => warn!("Model list response is not valid JSON, not caching: {}", e),
            }
        }

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = parts.status;
        *response.headers_mut() = strip_hop_by_hop(&parts.headers);
        Ok(response)
    }

    async fn forward_streaming(
        &self,
        route: &RoutingDecision,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response, ProxyError> {
        let mut payload: Value = serde_json::from_slice(&body)
            .map_err(|e| ProxyError::Unexpected(format!("invalid JSON request body: {e}")))?;
        payload
            .as_object_mut()
            .ok_or_else(|| ProxyError::Unexpected("request body must be a JSON object".into()))?
            .insert("stream".into(), Value::Bool(true));
        let body = serde_json::to_vec(&payload)
            .map_err(|e| ProxyError::Unexpected(format!("failed to encode request body: {e}")))?;

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let upstream = build_request(Method::POST, &route.target_url, headers, body.into())?;

        // No overall timeout: generation may legitimately run for minutes.
        let response = self
            .client
            .request(upstream)
            .await
            .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;
        let (parts, body) = response.into_parts();
        info!("Streaming response from {} ({})", route.target_url, parts.status);

        let dialect = self.settings.dialect;
        let target = route.target_url.clone();
        let lines = LineBufferedStream::new(body.into_data_stream(), dialect.stream_framing())
            .inspect_err(move |e| error!("Upstream stream from {} failed: {}", target, e));

        let mut headers = strip_hop_by_hop(&parts.headers);
        if !headers.contains_key(header::CONTENT_TYPE) {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(dialect.stream_content_type()),
            );
        }

        let mut response = Response::new(Body::from_stream(lines));
        *response.status_mut() = parts.status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    /// Turns a failed dispatch into the response the client sees.
    async fn recover(&self, err: ProxyError, method: &Method, route: &RoutingDecision) -> Response {
        if !err.is_wake_trigger() {
            error!("Proxy request to {} failed: {}", route.target_url, err);
            return err.into_response();
        }

        warn!("Backend unavailable at {}: {}", route.target_url, err);
        self.waker.wake_in_background();

        if route.is_model_list && *method == Method::GET {
            if let Some(cached) = self.cache.get().await {
                info!("Serving cached model list");
                return Json(cached.payload).into_response();
            }
            return waking_response();
        }

        // Only a silent backend looks asleep; a refused connection is reported as is.
        match err {
            ProxyError::UpstreamTimeout(_) if self.waker.is_enabled() => waking_response(),
            err => err.into_response(),
        }
    }
}

fn waking_response() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(MessageResponse::waking()),
    )
        .into_response()
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP_HEADERS.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Absolute URL a redirect response points to, if it is one.
fn redirect_location(response: &Response, current: &str) -> Result<Option<String>, ProxyError> {
    if !matches!(response.status().as_u16(), 301 | 302 | 303 | 307 | 308) {
        return Ok(None);
    }
    let Some(location) = response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
    else {
        return Ok(None);
    };
    let next = Url::parse(current)
        .and_then(|base| base.join(location))
        .map_err(|e| ProxyError::Unexpected(format!("invalid redirect location {location}: {e}")))?;
    Ok(Some(next.into()))
}

/// 303 always turns into a GET, 301 and 302 do so for anything but GET and HEAD.
/// 307 and 308 replay the original method and body.
fn redirect_switches_to_get(status: StatusCode, method: &Method) -> bool {
    match status.as_u16() {
        303 => *method != Method::HEAD,
        301 | 302 => *method != Method::GET && *method != Method::HEAD,
        _ => false,
    }
}

fn build_request(
    method: Method,
    target_url: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::extract::Request, ProxyError> {
    let uri = Uri::try_from(target_url)
        .map_err(|e| ProxyError::Unexpected(format!("invalid upstream URI {target_url}: {e}")))?;
    let mut req = Request::new(Body::from(body));
    *req.method_mut() = method;
    *req.uri_mut() = uri;
    *req.headers_mut() = headers;
    Ok(req)
}
