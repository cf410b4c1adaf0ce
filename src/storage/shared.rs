//! In-memory key/value store with per-tab handles and change fan-out.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::auth::AuthError;

/// Buffered change notifications per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 256;

/// A change to one storage key, as seen by tabs other than the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    /// Tab that performed the write.
    pub source_tab: String,
}

/// What a tab's change stream yields next.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageNotice {
    Changed(StorageEvent),
    /// The tab fell behind and this many events were dropped unseen.
    Missed(u64),
}

/// The storage area shared by all tabs.
pub struct SharedStorage {
    entries: Mutex<BTreeMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
    /// Optional JSON mirror on disk.
    path: Option<PathBuf>,
}

impl SharedStorage {
    /// Volatile storage, gone when the process exits.
    pub fn in_memory() -> Arc<Self> {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            entries: Mutex::new(BTreeMap::new()),
            events,
            path: None,
        })
    }

    /// Storage mirrored to a JSON document at `path`.
    ///
    /// An absent file starts empty; an unreadable one is an error, a corrupt
    /// one is logged and replaced on the next write.
    pub fn open(path: &Path) -> Result<Arc<Self>, AuthError> {
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Discarding corrupt storage file: {e}");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Ok(Arc::new(Self {
            entries: Mutex::new(entries),
            events,
            path: Some(path.to_path_buf()),
        }))
    }

    /// Open a handle for a new tab with a fresh tab id.
    pub fn tab(self: &Arc<Self>) -> TabStorage {
        TabStorage {
            shared: Arc::clone(self),
            tab_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    fn write(&self, source_tab: &str, key: &str, value: Option<String>) {
        let mut entries = self.entries.lock();
        let old_value = match &value {
            Some(v) => entries.insert(key.to_string(), v.clone()),
            None => entries.remove(key),
        };
        if old_value == value {
            return;
        }
        if let Some(path) = &self.path {
            persist(path, &entries);
        }
        drop(entries);

        // No receivers is fine: no other tab is listening yet.
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            old_value,
            new_value: value,
            source_tab: source_tab.to_string(),
        });
    }
}

fn persist(path: &Path, entries: &BTreeMap<String, String>) {
    let result = serde_json::to_vec_pretty(entries)
        .map_err(std::io::Error::other)
        .and_then(|bytes| {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, bytes)?;
            std::fs::rename(&tmp, path)
        });
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), "Failed to persist storage: {e}");
    }
}

/// One tab's view of the shared storage.
#[derive(Clone)]
pub struct TabStorage {
    shared: Arc<SharedStorage>,
    tab_id: String,
}

impl TabStorage {
    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.shared.get(key)
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.shared.write(&self.tab_id, key, Some(value.into()));
    }

    pub fn remove(&self, key: &str) {
        self.shared.write(&self.tab_id, key, None);
    }

    pub fn keys(&self) -> Vec<String> {
        self.shared.keys()
    }

    /// Change notifications caused by other tabs.
    pub fn subscribe(&self) -> StorageEvents {
        StorageEvents {
            rx: self.shared.events.subscribe(),
            tab_id: self.tab_id.clone(),
        }
    }
}

/// Receiver half of the cross-tab change stream for a single tab.
pub struct StorageEvents {
    rx: broadcast::Receiver<StorageEvent>,
    tab_id: String,
}

impl StorageEvents {
    /// Next event written by another tab, or how many were missed after
    /// falling behind; `None` once storage is gone.
    pub async fn recv(&mut self) -> Option<StorageNotice> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.source_tab == self.tab_id => continue,
                Ok(event) => return Some(StorageNotice::Changed(event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Storage event stream lagged");
                    return Some(StorageNotice::Missed(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
