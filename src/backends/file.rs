//! Local file backend: one file per key.

use super::{ChangeFeed, Fetched, WatchedBackend};
use crate::error::{ConfigError, Result};
use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// A backend over a directory of files.
pub type FileBackend = WatchedBackend<FileFeed>;

/// Serves each key from the file `root/key` and watches it with `notify`.
///
/// The file's parent directory is watched rather than the file itself, so
/// creating, replacing and deleting the file are all observed. A missing file
/// reads as an absent key; the parent directory must exist.
///
/// Writes that leave the content unchanged are not reported.
///
/// # Examples
///
/// ```rust,no_run
/// use distconfig::backends::{Backend, FileBackend, FileFeed};
/// use distconfig::notify::TokioExecutor;
/// use std::sync::Arc;
///
/// # async fn example() -> distconfig::error::Result<()> {
/// let backend = FileBackend::new(
///     FileFeed::new("/etc/myapp"),
///     Arc::new(TokioExecutor::current()?),
/// );
/// let data = backend.get("service.json").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FileFeed {
    root: PathBuf,
}

impl FileFeed {
    /// Serve keys from files under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory keys are resolved against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The file backing `key`.
    pub fn path_of(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }

    fn watch(&self, path: &Path) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<()>)> {
        let (parent, file_name) = match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => (parent.to_path_buf(), name.to_os_string()),
            _ => {
                return Err(ConfigError::Backend(format!(
                    "Not a file path: {}",
                    path.display()
                )));
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                if touches(&event, &file_name) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| ConfigError::Backend(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .map_err(|e| {
                ConfigError::Backend(format!(
                    "Failed to watch directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        Ok((watcher, rx))
    }
}

fn touches(event: &Event, file_name: &OsString) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|path| path.file_name() == Some(file_name.as_os_str()))
}

async fn read_file(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Watch state of one file.
pub struct FileCursor {
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<()>,
    last: Option<Vec<u8>>,
}

#[async_trait]
impl ChangeFeed for FileFeed {
    type Cursor = FileCursor;

    fn name(&self) -> &'static str {
        "file"
    }

    async fn fetch(&self, key: &str) -> Result<Fetched<FileCursor>> {
        let path = self.path_of(key);
        // Watch before reading so a write in between is not lost.
        let (watcher, events) = self.watch(&path)?;
        let value = read_file(&path).await?;
        Ok(Fetched {
            value: value.clone(),
            cursor: FileCursor {
                _watcher: watcher,
                events,
                last: value,
            },
        })
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        read_file(&self.path_of(key)).await
    }

    async fn wait_for_change(
        &self,
        key: &str,
        cursor: &mut FileCursor,
    ) -> Result<Option<Vec<u8>>> {
        let path = self.path_of(key);
        loop {
            if cursor.events.recv().await.is_none() {
                return Err(ConfigError::WatchError(format!(
                    "file watcher for {} stopped",
                    path.display()
                )));
            }
            // Collapse a burst of events into one read.
            while cursor.events.try_recv().is_ok() {}

            let value = read_file(&path).await?;
            if value != cursor.last {
                cursor.last = value.clone();
                return Ok(value);
            }
        }
    }
}
