//! Single-slot cache for the backend's model list.
//!
//! The model list is the only response worth serving while the backend sleeps: UI
//! clients poll it constantly and it rarely changes. Entries are never evicted; an
//! entry older than the configured duration is simply no longer returned.
use serde_json::Value;
use std::time::Duration;
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, info};

/// The last successful model-list response and when it was fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedModelList {
    pub payload: Value,
    pub fetched_at: Instant,
}

#[derive(Debug)]
pub struct ModelListCache {
    duration: Duration,
    slot: RwLock<Option<CachedModelList>>,
}

impl ModelListCache {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            slot: RwLock::new(None),
        }
    }

    /// Returns the stored entry if it is at most `duration` old.
    pub async fn get(&self) -> Option<CachedModelList> {
        let slot = self.slot.read().await;
        match slot.as_ref() {
            Some(entry) if entry.fetched_at.elapsed() <= self.duration => Some(entry.clone()),
            Some(entry) => {
                debug!(
                    "Cached model list is stale (fetched {:?} ago)",
                    entry.fetched_at.elapsed()
                );
                None
            }
            None => None,
        }
    }

    /// Replaces whatever is stored, stamping it with the current time.
    pub async fn put(&self, payload: Value) {
        let entry = CachedModelList {
            payload,
            fetched_at: Instant::now(),
        };
        *self.slot.write().await = Some(entry);
        info!("Model list cache updated");
    }
}
