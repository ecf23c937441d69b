//! File watcher with debouncing for the document and mirror files.
//!
//! Uses notify-debouncer-mini for efficient file change detection. Editors
//! often save by replacing the file, so the parent directories are watched
//! and events are filtered down to the files of interest.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// File event from the watcher.
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// Watched path, as given to `FileWatcher::new` (canonicalized)
    pub path: PathBuf,
    /// Type of event
    pub kind: FileEventKind,
}

/// Type of file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    /// File was deleted
    Deleted,
}

/// Watches a fixed set of files.
pub struct FileWatcher {
    files: Vec<PathBuf>,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

/// Last seen mtime per file, to filter spurious events
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

/// Resolve symlinks so event paths compare equal. On macOS, /var/folders/...
/// is actually /private/var/folders/..., and FSEvents reports the real path.
/// Files that don't exist yet are resolved through their parent.
pub fn canonical(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            parent
                .canonicalize()
                .map(|p| p.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}

impl FileWatcher {
    /// Create a watcher for `files`.
    ///
    /// Uses 200ms debounce period to avoid rapid-fire events during saves.
    pub fn new(files: &[PathBuf]) -> Result<Self> {
        let files: Vec<PathBuf> = files.iter().map(|f| canonical(f)).collect();
        let watched: HashSet<PathBuf> = files.iter().cloned().collect();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(file_event) = Self::process_event(&event, &watched, &mtime_cache)
                        {
                            if event_tx.send(file_event).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        let dirs: HashSet<&Path> = files.iter().filter_map(|f| f.parent()).collect();
        for dir in dirs {
            debouncer.watcher().watch(dir, RecursiveMode::NonRecursive)?;
        }

        Ok(Self {
            files,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Process a single debounced event, returning a FileEvent if relevant.
    fn process_event(
        event: &DebouncedEvent,
        watched: &HashSet<PathBuf>,
        mtime_cache: &MtimeCache,
    ) -> Option<FileEvent> {
        let path = &event.path;
        if !watched.contains(path) {
            return None;
        }

        let kind = if path.exists() {
            FileEventKind::Modified
        } else {
            FileEventKind::Deleted
        };

        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
        match kind {
            FileEventKind::Modified => {
                // Mtime unchanged means a spurious event (seen on Docker volumes)
                if let Ok(mtime) = std::fs::metadata(path).and_then(|m| m.modified()) {
                    if cache.get(path) == Some(&mtime) {
                        return None;
                    }
                    cache.insert(path.clone(), mtime);
                }
            }
            FileEventKind::Deleted => {
                cache.remove(path);
            }
        }

        debug!("File event: {:?} - {}", kind, path.display());

        Some(FileEvent {
            path: path.clone(),
            kind,
        })
    }

    /// Get the receiver for file events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }

    /// The watched files, canonicalized.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}
