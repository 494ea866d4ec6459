//! Failures that can occur while dispatching a request.
//!
//! Every variant converts into a well-formed HTTP response; nothing on the request
//! path is allowed to escape to the transport layer.
use crate::models::MessageResponse;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The backend did not answer within the resolved timeout.
    #[error("backend did not respond within {0:?}")]
    UpstreamTimeout(Duration),

    /// Connection-level failure talking to the backend.
    #[error("cannot connect to backend: {0}")]
    UpstreamUnreachable(String),

    /// The backend broke off a response that had already started streaming.
    #[error("upstream stream failed: {0}")]
    MidStream(String),

    /// Anything else: malformed request bodies, invalid URIs, internal faults.
    #[error("proxy request failed: {0}")]
    Unexpected(String),
}

impl ProxyError {
    /// Whether this failure suggests the backend is asleep, as opposed to a
    /// defect in the request or the proxy itself.
    pub fn is_wake_trigger(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamTimeout(_) | ProxyError::UpstreamUnreachable(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamUnreachable(_) | ProxyError::MidStream(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let message = match &self {
            ProxyError::UpstreamTimeout(_) => {
                "Server timeout, the backend did not respond".to_string()
            }
            other => other.to_string(),
        };
        (self.status_code(), Json(MessageResponse::new(message))).into_response()
    }
}
