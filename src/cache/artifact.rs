//! Time-limited artifacts stored as `{data, timestamp}` JSON in tab storage.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::storage::TabStorage;

/// Source of wall-clock time in unix milliseconds.
///
/// Timestamps are compared across tabs, so this is wall time rather than a
/// monotonic instant.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Stored envelope around a cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedArtifact<T> {
    pub data: T,
    /// Write time, unix milliseconds.
    pub timestamp: i64,
}

impl<T> CachedArtifact<T> {
    /// Age relative to `now_millis`, clamped at zero for clock skew between tabs.
    pub fn age(&self, now_millis: i64) -> Duration {
        let age = now_millis.saturating_sub(self.timestamp).max(0);
        Duration::from_millis(u64::try_from(age).unwrap_or_default())
    }
}

/// Whether a cached artifact is still within its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Expired,
}

/// TTL cache over tab storage.
#[derive(Clone)]
pub struct ArtifactCache {
    storage: TabStorage,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl ArtifactCache {
    /// Create a cache using the system clock.
    pub fn new(storage: TabStorage, ttl: Duration) -> Self {
        Self::with_clock(storage, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: TabStorage, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Store `data` stamped with the current time. Returns the envelope written.
    pub fn put<T: Serialize + Clone>(&self, key: &str, data: &T) -> CachedArtifact<T> {
        let artifact = CachedArtifact {
            data: data.clone(),
            timestamp: self.clock.now_millis(),
        };
        match serde_json::to_string(&artifact) {
            Ok(json) => self.storage.set(key, json),
            Err(e) => tracing::warn!(key, "Failed to serialize cached artifact: {e}"),
        }
        artifact
    }

    /// Fresh value for `key`. Expired or undecodable entries are evicted.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.peek::<T>(key)? {
            (artifact, Freshness::Fresh) => Some(artifact.data),
            (_, Freshness::Expired) => {
                tracing::debug!(key, "Evicting expired artifact");
                self.storage.remove(key);
                None
            }
        }
    }

    /// Read without evicting, reporting freshness alongside the value.
    ///
    /// Undecodable entries are removed and reported as absent.
    pub fn peek<T: DeserializeOwned>(&self, key: &str) -> Option<(CachedArtifact<T>, Freshness)> {
        let raw = self.storage.get(key)?;
        let artifact = match Self::decode::<T>(&raw) {
            Some(artifact) => artifact,
            None => {
                tracing::warn!(key, "Removing undecodable cached artifact");
                self.storage.remove(key);
                return None;
            }
        };
        let freshness = self.freshness(&artifact);
        Some((artifact, freshness))
    }

    /// Freshness of an artifact under this cache's TTL.
    pub fn freshness<T>(&self, artifact: &CachedArtifact<T>) -> Freshness {
        if artifact.age(self.clock.now_millis()) <= self.ttl {
            Freshness::Fresh
        } else {
            Freshness::Expired
        }
    }

    /// Decode a raw stored envelope, e.g. from a cross-tab storage event.
    pub fn decode<T: DeserializeOwned>(raw: &str) -> Option<CachedArtifact<T>> {
        serde_json::from_str(raw).ok()
    }

    pub fn remove(&self, key: &str) {
        self.storage.remove(key);
    }
}
