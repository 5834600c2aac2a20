use std::path::PathBuf;

use log::{debug, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Watches checkpoint directories and signals the orchestrator when their
/// contents change.
///
/// Events are collapsed to a unit signal; the receiver rescans the
/// directories itself, so coalescing bursts loses nothing. The watcher
/// thread talks to the async side through `try_send` - a full channel means
/// a rescan is already pending.
pub struct DirectoryWatcher {
    watcher: RecommendedWatcher,
    watched: Vec<PathBuf>,
}

impl DirectoryWatcher {
    /// Start watching. Directories that do not exist are skipped with a
    /// warning; they can be picked up by a later restart of the watcher.
    pub fn start(dirs: &[PathBuf], signal: mpsc::Sender<()>) -> notify::Result<Self> {
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| match result {
                Ok(event) if is_relevant(&event) => {
                    let _ = signal.try_send(());
                }
                Ok(_) => {}
                Err(e) => warn!("filesystem watch error: {}", e),
            })?;

        let mut watched = Vec::new();
        for dir in dirs {
            if !dir.is_dir() {
                warn!("not watching missing directory {}", dir.display());
                continue;
            }
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
            debug!("watching {}", dir.display());
            watched.push(dir.clone());
        }
        Ok(Self { watcher, watched })
    }

    /// Stop watching all directories. Dropping the watcher does the same.
    pub fn stop(&mut self) {
        for dir in std::mem::take(&mut self.watched) {
            if let Err(e) = self.watcher.unwatch(&dir) {
                debug!("unwatch {} failed: {}", dir.display(), e);
            }
        }
    }

    pub fn watched_dirs(&self) -> &[PathBuf] {
        &self.watched
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

// Renames show up as Modify(Name) on most platforms, so the modify arm
// also covers moves in and out of a watched directory.
fn is_relevant(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
