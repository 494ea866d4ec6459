//! Configuration parsing and validation for the proxy server
//!
//! Every setting can be given as a command-line flag or through the environment.
//! Missing or conflicting settings are fatal before the server binds.
use anyhow::{anyhow, bail};
use clap::Parser;
use std::time::Duration;
use url::Url;
use wakeproxy::{client::ClientOptions, dialect::Dialect, dispatcher::ProxySettings};

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Base URL of an Ollama backend, e.g. http://gpu-box:11434
    #[arg(long, env = "OLLAMA_URL", conflicts_with = "lmstudio_url")]
    pub ollama_url: Option<Url>,

    /// Base URL of an LM Studio backend, e.g. http://gpu-box:1234
    #[arg(long, env = "LMSTUDIO_URL")]
    pub lmstudio_url: Option<Url>,

    /// URL that wakes the backend machine when requested with GET.
    /// Without it the proxy never sends wake signals.
    #[arg(long, env = "WAKE_URL")]
    pub wake_url: Option<Url>,

    /// Timeout (in seconds) for the model-list endpoint.
    #[arg(long = "timeout", env = "TIMEOUT_SECONDS")]
    pub timeout_secs: u64,

    /// Timeout (in seconds) for every other non-streaming request.
    #[arg(long = "model-timeout", env = "MODEL_TIMEOUT_SECONDS", default_value_t = 30)]
    pub model_timeout_secs: u64,

    /// The port on which the proxy server will listen.
    #[arg(short = 'p', long, env = "PORT")]
    pub port: u16,

    /// Minimum number of minutes between preventive wake requests.
    #[arg(long, env = "WAKE_INTERVAL", default_value_t = 10)]
    pub wake_interval: u64,

    /// Number of minutes a cached model list may be served while the backend is down.
    #[arg(long, env = "CACHE_DURATION", default_value_t = 1440)]
    pub cache_duration: u64,

    /// Timeout (in seconds) for a single wake request.
    #[arg(long = "wake-timeout", env = "WAKE_TIMEOUT_SECONDS", default_value_t = 10)]
    pub wake_timeout_secs: u64,

    /// Whether to serve Prometheus metrics.
    #[arg(short = 'm', long, env = "METRICS")]
    pub metrics: bool,

    /// The port on which the metrics server will listen.
    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "wakeproxy")]
    pub metrics_prefix: String,

    /// Maximum number of idle HTTP connections to keep alive per upstream host.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if self.ollama_url.is_some() && self.lmstudio_url.is_some() {
            bail!("Only one of --ollama-url and --lmstudio-url may be set");
        }
        self.backend()?;
        if self.timeout_secs == 0 || self.model_timeout_secs == 0 || self.wake_timeout_secs == 0 {
            bail!("Timeouts must be at least one second");
        }
        minutes("--wake-interval", self.wake_interval)?;
        minutes("--cache-duration", self.cache_duration)?;
        if self.metrics && self.metrics_port == self.port {
            bail!(
                "Metrics port {} must differ from the proxy port",
                self.metrics_port
            );
        }
        Ok(self)
    }

    /// The backend dialect and base URL, chosen by which URL was supplied.
    pub fn backend(&self) -> Result<(Dialect, &Url), anyhow::Error> {
        match (&self.ollama_url, &self.lmstudio_url) {
            (Some(url), None) => Ok((Dialect::Ollama, url)),
            (None, Some(url)) => Ok((Dialect::LmStudio, url)),
            _ => Err(anyhow!(
                "Exactly one backend is required: set OLLAMA_URL or LMSTUDIO_URL"
            )),
        }
    }

    pub fn proxy_settings(&self) -> Result<ProxySettings, anyhow::Error> {
        let (dialect, backend_url) = self.backend()?;
        Ok(ProxySettings::builder()
            .backend_url(backend_url.as_str())
            .dialect(dialect)
            .maybe_wake_url(self.wake_url.as_ref().map(Url::as_str))
            .list_timeout(Duration::from_secs(self.timeout_secs))
            .model_timeout(Duration::from_secs(self.model_timeout_secs))
            .wake_interval(minutes("--wake-interval", self.wake_interval)?)
            .cache_duration(minutes("--cache-duration", self.cache_duration)?)
            .wake_timeout(Duration::from_secs(self.wake_timeout_secs))
            .build())
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            pool_max_idle_per_host: self.pool_max_idle_per_host,
            pool_idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            // A sleeping machine never completes the handshake; fail as fast as the
            // model-list timeout so streaming calls can fall back too.
            connect_timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

fn minutes(name: &str, value: u64) -> Result<Duration, anyhow::Error> {
    value
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow!("{name} of {value} minutes is too large"))
}
