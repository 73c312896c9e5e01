//! Bucket watcher: the storage-event source for the dispatcher.
//!
//! Watches a local bucket root for new objects and emits a finalized
//! [`StorageEvent`] once a file's size has been stable for the configured
//! delay. Hidden files (staging files, metadata sidecars) are ignored.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::StorageEvent;
use crate::storage::{LocalObjectStore, ObjectStore};

use super::dispatcher::{DispatchOutcome, Dispatcher};

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Bucket root does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// How long a file must keep the same size before it counts as finalized (seconds)
    pub stability_delay_secs: u64,

    /// Debounce window for filesystem notifications (milliseconds)
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            stability_delay_secs: 2,
            debounce_ms: 500,
        }
    }
}

/// Counts from a one-shot scan
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub dispatched: usize,
    pub converted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ScanResult {
    fn record(&mut self, outcome: &DispatchOutcome) {
        self.dispatched += 1;
        match outcome {
            DispatchOutcome::Skipped(_) => self.skipped += 1,
            DispatchOutcome::Copied(_) | DispatchOutcome::Transcoded(_) => self.converted += 1,
            DispatchOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Emits storage events for a local bucket and feeds them to a dispatcher
pub struct StorageWatcher {
    store: Arc<LocalObjectStore>,
    dispatcher: Arc<Dispatcher>,
    config: WatcherConfig,
}

impl StorageWatcher {
    pub fn new(store: Arc<LocalObjectStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            config: WatcherConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WatcherConfig) -> Self {
        self.config = config;
        self
    }

    fn validate(&self) -> Result<(), WatcherError> {
        if !self.store.root().exists() {
            return Err(WatcherError::DirectoryNotFound(self.store.root().to_path_buf()));
        }
        Ok(())
    }

    /// Build the event for an object key from its stored metadata
    async fn event_for(&self, key: &str) -> Option<StorageEvent> {
        match self.store.metadata(key).await {
            Ok(meta) => Some(StorageEvent {
                bucket: self.store.bucket().to_string(),
                path: Some(key.to_string()),
                content_type: Some(meta.content_type),
            }),
            Err(e) => {
                tracing::warn!("Failed to read metadata for {}: {}", key, e);
                None
            }
        }
    }

    /// Dispatch every object currently in the bucket.
    ///
    /// Converted artifacts are dispatched too and skipped by the guards, so
    /// rescanning is harmless; re-dispatching a raw note re-creates the same
    /// artifact.
    pub async fn scan_once(&self) -> Result<ScanResult> {
        self.validate()?;

        // Snapshot first: dispatching writes new objects into the tree
        let mut keys = Vec::new();
        let mut dirs = vec![self.store.root().to_path_buf()];

        while let Some(dir) = dirs.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    if !entry.file_name().to_string_lossy().starts_with('.') {
                        dirs.push(path);
                    }
                    continue;
                }

                if let Some(key) = self.store.key_for(&path) {
                    keys.push(key);
                }
            }
        }
        keys.sort();

        let mut result = ScanResult::default();
        for key in keys {
            if let Some(event) = self.event_for(&key).await {
                let outcome = self.dispatcher.dispatch(&event).await;
                result.record(&outcome);
            }
        }

        Ok(result)
    }

    /// Watch the bucket and dispatch new stable objects until stopped
    pub async fn watch(self: Arc<Self>) -> Result<(mpsc::Receiver<DispatchOutcome>, WatchHandle)> {
        self.validate()?;

        let (outcome_tx, outcome_rx) = mpsc::channel::<DispatchOutcome>(100);
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let watcher = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            if let Err(e) = watcher.run(outcome_tx, &mut stop_rx).await {
                tracing::error!("Watcher error: {}", e);
            }
        });

        Ok((
            outcome_rx,
            WatchHandle {
                stop_tx,
                task: handle,
            },
        ))
    }

    async fn run(
        &self,
        outcome_tx: mpsc::Sender<DispatchOutcome>,
        stop_rx: &mut mpsc::Receiver<()>,
    ) -> Result<()> {
        // path -> (size, last_seen)
        let mut pending: HashMap<PathBuf, (u64, Instant)> = HashMap::new();

        let (tx, rx) = std::sync::mpsc::channel();
        let mut debouncer = new_debouncer(Duration::from_millis(self.config.debounce_ms), tx)?;
        debouncer
            .watcher()
            .watch(self.store.root(), RecursiveMode::Recursive)?;

        let stability_delay = Duration::from_secs(self.config.stability_delay_secs);

        tracing::info!("Watching {} for new objects", self.store.root().display());

        loop {
            if stop_rx.try_recv().is_ok() {
                tracing::info!("Watcher stopping...");
                break;
            }

            match rx.recv_timeout(Duration::from_millis(250)) {
                Ok(Ok(events)) => {
                    for event in events {
                        if self.store.key_for(&event.path).is_none() {
                            continue;
                        }
                        if let Ok(metadata) = std::fs::metadata(&event.path) {
                            if metadata.is_file() {
                                pending.insert(event.path, (metadata.len(), Instant::now()));
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!("Watcher error: {:?}", e);
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    tracing::error!("Watcher channel disconnected");
                    break;
                }
            }

            let now = Instant::now();
            let mut stable = Vec::new();
            let mut grown = Vec::new();

            for (path, (last_size, last_seen)) in pending.iter() {
                if now.duration_since(*last_seen) < stability_delay {
                    continue;
                }
                match std::fs::metadata(path) {
                    Ok(m) if m.len() == *last_size && m.len() > 0 => stable.push(path.clone()),
                    Ok(m) => grown.push((path.clone(), m.len())),
                    Err(_) => stable.push(path.clone()),
                }
            }

            for (path, size) in grown {
                pending.insert(path, (size, now));
            }

            for path in stable {
                pending.remove(&path);
                if !path.exists() {
                    continue;
                }
                let Some(key) = self.store.key_for(&path) else {
                    continue;
                };
                if let Some(event) = self.event_for(&key).await {
                    let outcome = self.dispatcher.dispatch(&event).await;
                    let _ = outcome_tx.send(outcome).await;
                }
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Ok(())
    }
}

/// Handle to control the watcher
pub struct WatchHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(()).await;
        self.task.await?;
        Ok(())
    }
}
