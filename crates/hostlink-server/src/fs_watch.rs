//! Directory watches backed by OS-native notification (inotify, kqueue, ...)
//! via the `notify` crate.
//!
//! One watch per exact directory path. Every change notification triggers a
//! full re-read of the directory's immediate entries; there is no diffing.

use hostlink_core::messages::DirEntryInfo;
use hostlink_core::{LinkError, LinkResult};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Called with the fresh listing (or the read/watch error) after each change.
pub type ChangeCallback = Arc<dyn Fn(LinkResult<Vec<DirEntryInfo>>) + Send + Sync>;

/// One active OS watch and the task that turns its events into listings.
struct WatchHandle {
    // Dropping the watcher closes the OS descriptor.
    _watcher: RecommendedWatcher,
    forwarder: JoinHandle<()>,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// All directory watches of one gateway.
#[derive(Default)]
pub struct FilesystemWatcher {
    watches: Mutex<HashMap<PathBuf, WatchHandle>>,
}

impl std::fmt::Debug for FilesystemWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemWatcher")
            .field("watches", &self.watch_count())
            .finish()
    }
}

impl FilesystemWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching `path` (non-recursively).
    ///
    /// Returns `Ok(false)` without doing anything when `path` is already
    /// watched. Must be called from within a tokio runtime.
    pub fn watch_folder(&self, path: impl AsRef<Path>, on_change: ChangeCallback) -> LinkResult<bool> {
        let path = path.as_ref().to_path_buf();
        let mut watches = self.lock();
        if watches.contains_key(&path) {
            debug!(path = %path.display(), "already watching");
            return Ok(false);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .map_err(|e| LinkError::Watch(format!("failed to create watcher: {e}")))?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| LinkError::Watch(format!("failed to watch {}: {e}", path.display())))?;

        let dir = path.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(event) if is_change(&event.kind) => on_change(read_entries(&dir).await),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(path = %dir.display(), error = %e, "watch error");
                        on_change(Err(LinkError::Watch(e.to_string())));
                    }
                }
            }
        });

        info!(path = %path.display(), "watching directory");
        watches.insert(
            path,
            WatchHandle {
                _watcher: watcher,
                forwarder,
            },
        );
        Ok(true)
    }

    /// Stop watching `path`. Unknown paths are a no-op; returns whether a
    /// watch was removed.
    pub fn unwatch_folder(&self, path: impl AsRef<Path>) -> bool {
        let removed = self.lock().remove(path.as_ref()).is_some();
        if removed {
            info!(path = %path.as_ref().display(), "stopped watching directory");
        }
        removed
    }

    /// Close every watch. Returns how many were closed.
    pub fn cleanup(&self) -> usize {
        let drained: Vec<WatchHandle> = self.lock().drain().map(|(_, h)| h).collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "closed all directory watches");
        }
        drained.len()
    }

    pub fn is_watching(&self, path: impl AsRef<Path>) -> bool {
        self.lock().contains_key(path.as_ref())
    }

    pub fn watch_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, WatchHandle>> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read the immediate entries of `dir`, sorted by name.
pub async fn read_entries(dir: &Path) -> LinkResult<Vec<DirEntryInfo>> {
    let mut reader = tokio::fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let is_directory = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        entries.push(DirEntryInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_directory,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Access notifications do not change a listing.
fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Any | EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recorder() -> (ChangeCallback, mpsc::UnboundedReceiver<LinkResult<Vec<DirEntryInfo>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cb: ChangeCallback = Arc::new(move |res: LinkResult<Vec<DirEntryInfo>>| {
            let _ = tx.send(res);
        });
        (cb, rx)
    }

    #[tokio::test]
    async fn read_entries_flags_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();

        let entries = read_entries(dir.path()).await.unwrap();
        assert_eq!(
            entries,
            vec![
                DirEntryInfo {
                    name: "a.txt".into(),
                    is_directory: false
                },
                DirEntryInfo {
                    name: "sub".into(),
                    is_directory: true
                },
            ]
        );
    }

    #[tokio::test]
    async fn read_entries_missing_dir_errors() {
        assert!(read_entries(Path::new("/nonexistent/dir/xyz")).await.is_err());
    }

    #[tokio::test]
    async fn second_watch_on_same_path_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FilesystemWatcher::new();
        let (cb1, mut rx1) = recorder();
        let (cb2, mut rx2) = recorder();

        assert!(watcher.watch_folder(dir.path(), cb1).unwrap());
        assert!(!watcher.watch_folder(dir.path(), cb2).unwrap());
        assert_eq!(watcher.watch_count(), 1);

        std::fs::create_dir(dir.path().join("new-dir")).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), rx1.recv())
            .await
            .expect("change not reported")
            .unwrap()
            .unwrap();
        assert!(first.iter().any(|e| e.name == "new-dir" && e.is_directory));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn watch_missing_path_fails() {
        let watcher = FilesystemWatcher::new();
        let (cb, _rx) = recorder();
        let err = watcher
            .watch_folder("/nonexistent/path/abc123", cb)
            .unwrap_err();
        assert!(matches!(err, LinkError::Watch(_)));
        assert_eq!(watcher.watch_count(), 0);
    }

    #[tokio::test]
    async fn unwatch_stops_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FilesystemWatcher::new();
        let (cb, mut rx) = recorder();
        watcher.watch_folder(dir.path(), cb).unwrap();

        assert!(watcher.unwatch_folder(dir.path()));
        assert!(!watcher.unwatch_folder(dir.path()));
        assert!(!watcher.unwatch_folder("/never/watched"));

        std::fs::write(dir.path().join("late.txt"), b"x").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cleanup_closes_everything() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let watcher = FilesystemWatcher::new();
        let (cb, _rx) = recorder();
        watcher.watch_folder(a.path(), cb.clone()).unwrap();
        watcher.watch_folder(b.path(), cb).unwrap();

        assert_eq!(watcher.cleanup(), 2);
        assert_eq!(watcher.cleanup(), 0);
        assert!(!watcher.is_watching(a.path()));
    }
}
