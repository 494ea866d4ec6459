/// Bodies the proxy produces itself rather than relaying from the backend.
use serde::{Deserialize, Serialize};

/// Body of `GET /health`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn healthy() -> Self {
        HealthResponse {
            status: "healthy".into(),
        }
    }
}

/// Synthetic `{"message": ...}` body used for fallback and error responses.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        MessageResponse {
            message: message.into(),
        }
    }

    /// Returned with a 503 while the backend is presumed to be waking up.
    pub fn waking() -> Self {
        Self::new("Server is waking up, please retry later")
    }
}
