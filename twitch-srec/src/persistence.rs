//! Registry persistence.
//!
//! The registry is loaded once at startup and saved after changes. Saves are
//! coalesced: a burst of events inside the debounce window produces a single
//! write of the latest snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::streamer::{StreamerRegistry, StreamerState};
use crate::utils::fs;

/// Persisted form of one tracked channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedStreamer {
    pub name: String,
    #[serde(flatten)]
    pub state: StreamerState,
}

/// Everything that survives a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub global_location: PathBuf,
    #[serde(default)]
    pub streamers: Vec<PersistedStreamer>,
}

impl PersistedState {
    pub fn empty(global_location: impl Into<PathBuf>) -> Self {
        Self {
            global_location: global_location.into(),
            streamers: Vec::new(),
        }
    }
}

/// Storage backend for [`PersistedState`].
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last saved state, `None` when nothing was saved yet.
    async fn load(&self) -> Result<Option<PersistedState>>;

    async fn save(&self, state: &PersistedState) -> Result<()>;
}

/// Pretty-printed JSON document on disk.
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self) -> Result<Option<PersistedState>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(fs::io_error("reading state file", &self.path, e)),
        };
        let state = serde_json::from_slice(&bytes)?;
        Ok(Some(state))
    }

    async fn save(&self, state: &PersistedState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        fs::ensure_parent_dir_with_op("creating state directory", &self.path).await?;

        let path = self.path.clone();
        // Write next to the target and rename so readers never see a partial file.
        tokio::task::spawn_blocking(move || -> Result<()> {
            use std::io::Write;

            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)
                .map_err(|e| fs::io_error("creating temp state file", &dir, e))?;
            tmp.write_all(&json)
                .map_err(|e| fs::io_error("writing state file", &path, e))?;
            tmp.as_file()
                .sync_all()
                .map_err(|e| fs::io_error("syncing state file", &path, e))?;
            tmp.persist(&path)
                .map_err(|e| fs::io_error("replacing state file", &path, e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| crate::Error::Other(format!("state save task failed: {e}")))?
    }
}

/// Save the registry after every change until `token` is cancelled.
///
/// Events arriving within `debounce` of the first unsaved one are folded
/// into the same write. A final save is made on cancellation.
pub fn spawn_persistence(
    registry: Arc<StreamerRegistry>,
    store: Arc<dyn StateStore>,
    debounce: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    let mut events = registry.subscribe();

    tokio::spawn(async move {
        info!("Persistence worker started");
        // Set while the latest changes are not on disk yet.
        let mut dirty = false;

        loop {
            if !dirty {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            debug!("Persisting after: {}", event.description());
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!("Persistence worker lagged {} events", n);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
                dirty = true;
            }

            // Let the burst settle before writing. A failed save is retried
            // after the same delay without waiting for another change.
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(debounce) => {}
            }
            // Everything queued so far is covered by the snapshot below.
            while let Ok(_) | Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) =
                events.try_recv()
            {}

            match store.save(&registry.snapshot()).await {
                Ok(()) => dirty = false,
                Err(e) => warn!(error = %e, "Failed to persist streamer state, retrying"),
            }
        }

        if let Err(e) = store.save(&registry.snapshot()).await {
            warn!(error = %e, "Failed to persist streamer state on shutdown");
        }
        info!("Persistence worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streamer::StreamerStatus;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        saves: Mutex<Vec<PersistedState>>,
        /// Number of upcoming saves that fail.
        failures: Mutex<usize>,
    }

    #[async_trait]
    impl StateStore for RecordingStore {
        async fn load(&self) -> Result<Option<PersistedState>> {
            Ok(self.saves.lock().last().cloned())
        }

        async fn save(&self, state: &PersistedState) -> Result<()> {
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(crate::Error::Other("disk full".to_string()));
                }
            }
            self.saves.lock().push(state.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_json_store_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("state.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("nested").join("state.json"));

        let registry = StreamerRegistry::new("/videos");
        registry.add("alice").unwrap();
        registry.add("bob").unwrap();
        registry.set_status("bob", StreamerStatus::Online).unwrap();
        registry.set_skip_current("bob", true).unwrap();
        let snapshot = registry.snapshot();

        store.save(&snapshot).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_json_store_reads_sparse_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(
            &path,
            r#"{"global_location": "/rec", "streamers": [{"name": "alice", "enabled": false}]}"#,
        )
        .await
        .unwrap();

        let loaded = JsonStateStore::new(&path).load().await.unwrap().unwrap();
        assert_eq!(loaded.global_location, PathBuf::from("/rec"));
        assert_eq!(loaded.streamers[0].name, "alice");
        assert!(!loaded.streamers[0].state.enabled);
        assert_eq!(loaded.streamers[0].state.status, StreamerStatus::Offline);
    }

    #[tokio::test]
    async fn test_json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let err = JsonStateStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, crate::Error::Serialization(_)));
    }

    #[tokio::test]
    async fn test_worker_coalesces_bursts() {
        let registry = Arc::new(StreamerRegistry::new("/videos"));
        let store = Arc::new(RecordingStore::default());
        let token = CancellationToken::new();
        let handle = spawn_persistence(
            registry.clone(),
            store.clone(),
            Duration::from_millis(50),
            token.clone(),
        );

        registry.add("alice").unwrap();
        registry.set_title("alice", "one").unwrap();
        registry.set_title("alice", "two").unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        {
            let saves = store.saves.lock();
            assert_eq!(saves.len(), 1, "burst should produce a single save");
            assert_eq!(saves[0].streamers[0].state.title, "two");
        }

        token.cancel();
        handle.await.unwrap();
        // Final flush on shutdown.
        assert_eq!(store.saves.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_worker_retries_failed_save() {
        let registry = Arc::new(StreamerRegistry::new("/videos"));
        let store = Arc::new(RecordingStore::default());
        *store.failures.lock() = 2;
        let token = CancellationToken::new();
        let handle = spawn_persistence(
            registry.clone(),
            store.clone(),
            Duration::from_millis(30),
            token.clone(),
        );

        // A single change; the retries must not need another event.
        registry.add("alice").unwrap();

        for _ in 0..100 {
            if !store.saves.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(*store.failures.lock(), 0);
        {
            let saves = store.saves.lock();
            assert_eq!(saves.len(), 1);
            assert_eq!(saves[0].streamers[0].name, "alice");
        }

        // Saved state is clean: no further writes until the next change.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.saves.lock().len(), 1);

        token.cancel();
        handle.await.unwrap();
    }
}
