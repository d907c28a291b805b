//! Hot-reload playbook directory loader.
//!
//! Loads playbook YAML/JSON files from a directory into the store on startup
//! and watches the directory for changes at runtime. New, modified or
//! deleted files are picked up without restarting the server. Every change
//! publishes `playbook_spec_updated`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use remedy_store::Store;
use remedy_types::{Playbook, channels};

use crate::error::{EngineError, Result};
use crate::notifier::Notifier;

/// Outcome of processing one playbook file.
#[derive(Debug, Clone)]
pub enum PlaybookEvent {
    /// A playbook was loaded or updated.
    Loaded { name: String, path: PathBuf },
    /// A playbook's file was removed; the playbook is deleted.
    Removed { name: String, path: PathBuf },
    /// A file failed to parse or validate.
    Error { path: PathBuf, error: String },
}

/// Loads a directory of playbook files into the store.
#[derive(Clone)]
pub struct PlaybookLoader {
    dir: PathBuf,
    store: Arc<Store>,
    notifier: Notifier,
    /// File path → playbook id, for delete and rename handling.
    path_to_id: Arc<Mutex<HashMap<PathBuf, Uuid>>>,
}

impl PlaybookLoader {
    /// Create a loader for `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>, store: Arc<Store>, notifier: Notifier) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|e| {
                EngineError::Internal(format!(
                    "Failed to create playbook directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(Self {
            dir,
            store,
            notifier,
            path_to_id: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load every playbook file in the directory.
    ///
    /// Invalid files are logged but don't prevent other files from loading.
    pub fn load_all(&self) -> Vec<PlaybookEvent> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!(dir = %self.dir.display(), error = %e, "Failed to read playbook directory");
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| is_playbook_file(p))
            .collect();
        paths.sort();

        let events: Vec<PlaybookEvent> = paths.iter().map(|p| self.load_file(p)).collect();
        let loaded = events
            .iter()
            .filter(|e| matches!(e, PlaybookEvent::Loaded { .. }))
            .count();
        info!(dir = %self.dir.display(), loaded, "Loaded playbooks");
        events
    }

    /// Load or reload a single playbook file.
    pub fn load_file(&self, path: &Path) -> PlaybookEvent {
        debug!(path = %path.display(), "Loading playbook file");
        match self.upsert_from(path) {
            Ok(playbook) => {
                info!(playbook = %playbook.name, path = %path.display(), "Playbook loaded");
                PlaybookEvent::Loaded {
                    name: playbook.name,
                    path: path.to_path_buf(),
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Invalid playbook file");
                PlaybookEvent::Error {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                }
            }
        }
    }

    /// Handle a file being removed.
    pub fn remove_file(&self, path: &Path) -> Option<PlaybookEvent> {
        let id = self.path_to_id.lock().remove(path)?;
        let name = match self.store.get_playbook(id) {
            Ok(Some(p)) => p.name,
            _ => id.to_string(),
        };
        if let Err(e) = self.store.delete_playbook(id) {
            warn!(playbook = %name, error = %e, "Failed to delete playbook");
            return None;
        }
        self.notifier.publish(channels::PLAYBOOK_SPEC_UPDATED);
        info!(playbook = %name, path = %path.display(), "Playbook removed");
        Some(PlaybookEvent::Removed {
            name,
            path: path.to_path_buf(),
        })
    }

    fn upsert_from(&self, path: &Path) -> Result<Playbook> {
        let playbook = parse_file(path)?;

        if let Some(webhook) = &playbook.spec.on.webhook
            && let Some(other) = self.store.find_playbook_by_webhook(&webhook.path)?
            && (other.namespace != playbook.namespace || other.name != playbook.name)
        {
            return Err(EngineError::Validation(format!(
                "webhook path '{}' is already used by playbook '{}'",
                webhook.path, other.name
            )));
        }

        let stored = self.store.upsert_playbook(&playbook)?;
        let previous = self.path_to_id.lock().insert(path.to_path_buf(), stored.id);
        if let Some(old) = previous.filter(|old| *old != stored.id) {
            // The file now defines a different playbook.
            if let Err(e) = self.store.delete_playbook(old) {
                debug!(playbook_id = %old, error = %e, "Renamed playbook already gone");
            }
        }
        self.notifier.publish(channels::PLAYBOOK_SPEC_UPDATED);
        Ok(stored)
    }

    /// Start watching the directory for changes.
    ///
    /// Returns a channel receiver that emits a [`PlaybookEvent`] per changed
    /// file. Events are debounced with a 300ms window to absorb editor save
    /// patterns.
    pub fn watch(&self) -> Result<(tokio::sync::mpsc::Receiver<PlaybookEvent>, WatcherHandle)> {
        let (event_tx, event_rx) = tokio::sync::mpsc::channel(64);
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();

        let mut debouncer = new_debouncer(Duration::from_millis(300), notify_tx)
            .map_err(|e| EngineError::Internal(format!("Failed to create file watcher: {e}")))?;
        debouncer
            .watcher()
            .watch(&self.dir, notify::RecursiveMode::NonRecursive)
            .map_err(|e| {
                EngineError::Internal(format!("Failed to watch {}: {}", self.dir.display(), e))
            })?;

        let loader = self.clone();
        // The notify receiver is std::sync, so it gets its own thread.
        let handle = std::thread::spawn(move || {
            let _debouncer = debouncer;
            while let Ok(Ok(events)) = notify_rx.recv() {
                for event in events {
                    let path = event.path;
                    if event.kind != DebouncedEventKind::Any
                        || !is_playbook_file(&path)
                        || !path.starts_with(&loader.dir)
                    {
                        continue;
                    }
                    let outcome = if path.exists() {
                        Some(loader.load_file(&path))
                    } else {
                        loader.remove_file(&path)
                    };
                    if let Some(outcome) = outcome
                        && event_tx.blocking_send(outcome).is_err()
                    {
                        debug!("Playbook event receiver dropped");
                    }
                }
            }
        });

        Ok((event_rx, WatcherHandle { _thread: handle }))
    }
}

/// Handle that keeps the file watcher alive.
pub struct WatcherHandle {
    _thread: std::thread::JoinHandle<()>,
}

/// Parse a YAML or JSON playbook file and validate it.
pub fn parse_file(path: &Path) -> Result<Playbook> {
    let content = std::fs::read_to_string(path)?;
    let playbook: Playbook = match extension(path).as_deref() {
        Some("json") => serde_json::from_str(&content)?,
        _ => serde_yaml::from_str(&content)
            .map_err(|e| EngineError::Validation(format!("{}: {e}", path.display())))?,
    };
    playbook.validate()?;
    Ok(playbook)
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

fn is_playbook_file(path: &Path) -> bool {
    matches!(extension(path).as_deref(), Some("yaml" | "yml" | "json"))
}
