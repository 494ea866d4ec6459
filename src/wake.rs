//! Rate-limited wake signals for a sleeping backend machine.
//!
//! A wake is a single best-effort `GET` against an out-of-band URL (a wake-on-LAN
//! relay, a smart plug, ...). The timestamp is recorded when an attempt is
//! dispatched, not when it succeeds, so an unreachable wake endpoint is not hammered.
use crate::client::HttpClient;
use axum::{
    body::Body,
    http::{Method, Request},
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, error, info};

#[derive(Debug)]
pub struct WakeScheduler<T: HttpClient> {
    client: T,
    wake_url: Option<String>,
    interval: Duration,
    timeout: Duration,
    last_wake_at: Mutex<Option<Instant>>,
}

impl<T: HttpClient> WakeScheduler<T> {
    pub fn new(client: T, wake_url: Option<String>, interval: Duration, timeout: Duration) -> Self {
        Self {
            client,
            wake_url,
            interval,
            timeout,
            last_wake_at: Mutex::new(None),
        }
    }

    /// Whether a wake URL is configured at all.
    pub fn is_enabled(&self) -> bool {
        self.wake_url.is_some()
    }

    pub async fn last_wake_at(&self) -> Option<Instant> {
        *self.last_wake_at.lock().await
    }

    /// True when a wake URL is configured and no wake was sent within the interval.
    pub async fn should_wake(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.is_due(*self.last_wake_at.lock().await)
    }

    fn is_due(&self, last_wake_at: Option<Instant>) -> bool {
        match last_wake_at {
            None => true,
            Some(at) => at.elapsed() > self.interval,
        }
    }

    /// Sends one wake request and waits for its outcome. Failures are logged only.
    pub async fn wake(&self) {
        let Some(url) = self.wake_url.as_deref() else {
            return;
        };
        *self.last_wake_at.lock().await = Some(Instant::now());
        self.send(url).await;
    }

    /// Like [`WakeScheduler::wake`], but only if one is due. The check and the
    /// timestamp update happen under one lock, so concurrent callers send at most
    /// one wake per interval.
    pub async fn wake_if_due(&self) -> bool {
        let Some(url) = self.wake_url.as_deref() else {
            return false;
        };
        {
            let mut last_wake_at = self.last_wake_at.lock().await;
            if !self.is_due(*last_wake_at) {
                return false;
            }
            *last_wake_at = Some(Instant::now());
        }
        info!("Wake interval elapsed, sending preventive wake request");
        self.send(url).await;
        true
    }

    async fn send(&self, url: &str) {
        let req = match Request::builder()
            .method(Method::GET)
            .uri(url)
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => {
                error!("Invalid wake URL {}: {}", url, e);
                return;
            }
        };

        debug!("Sending wake request to {}", url);
        match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(response)) => info!(
                "Wake request sent to {}, responded with {}",
                url,
                response.status()
            ),
            Ok(Err(e)) => error!("Wake request to {} failed: {}", url, e),
            Err(_) => error!("Wake request to {} timed out after {:?}", url, self.timeout),
        }
    }
}

impl<T: HttpClient + 'static> WakeScheduler<T> {
    /// Fires a wake on a detached task. The caller never observes its outcome.
    pub fn wake_in_background(self: &Arc<Self>) {
        if !self.is_enabled() {
            return;
        }
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.wake().await;
        });
    }
}
