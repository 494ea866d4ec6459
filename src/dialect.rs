//! Backend API dialects.
//!
//! The dialect is selected once at startup from whichever backend URL was supplied.
//! Everything the dispatcher needs to know about path shapes lives here, so the
//! dispatch logic itself never branches on the dialect.

use crate::stream::Framing;

/// The request/response shape family of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Ollama,
    LmStudio,
}

impl Dialect {
    /// Path (without leading slash) of the endpoint listing available models.
    pub fn model_list_path(self) -> &'static str {
        match self {
            Dialect::Ollama => "api/tags",
            Dialect::LmStudio => "v1/models",
        }
    }

    /// Paths (without leading slash) that run inference and may stream.
    pub fn generation_endpoints(self) -> &'static [&'static str] {
        match self {
            Dialect::Ollama => &["api/generate", "api/chat"],
            Dialect::LmStudio => &["v1/chat/completions"],
        }
    }

    pub fn is_model_list(self, path: &str) -> bool {
        path == self.model_list_path()
    }

    pub fn is_generation_endpoint(self, path: &str) -> bool {
        self.generation_endpoints().contains(&path)
    }

    /// How a streamed response is cut into frames.
    ///
    /// Ollama streams NDJSON. LM Studio streams server-sent events, where a blank
    /// line ends each event.
    pub fn stream_framing(self) -> Framing {
        match self {
            Dialect::Ollama => Framing::Ndjson,
            Dialect::LmStudio => Framing::Sse,
        }
    }

    /// Content type for streamed responses when the backend does not send one.
    pub fn stream_content_type(self) -> &'static str {
        match self {
            Dialect::Ollama => "application/x-ndjson",
            Dialect::LmStudio => "text/event-stream",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::Ollama => f.write_str("ollama"),
            Dialect::LmStudio => f.write_str("lmstudio"),
        }
    }
}
