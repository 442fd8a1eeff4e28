//! Recursive filesystem watcher for a workspace folder.

use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::ExplorerError;

/// Filesystem change relevant to the test tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Deleted(PathBuf),
}

/// Keeps a notify watcher alive; dropping it stops the watch.
pub struct FolderWatcher {
    folder: PathBuf,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for FolderWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderWatcher")
            .field("folder", &self.folder)
            .finish_non_exhaustive()
    }
}

impl FolderWatcher {
    /// Watch `folder` recursively and forward deletions to `events`.
    ///
    /// The notify callback runs on the watcher's own thread; it only sends,
    /// the tree is mutated by whoever drains `events`.
    pub fn start(folder: &Path, events: Sender<FsEvent>) -> Result<Self, ExplorerError> {
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if let EventKind::Remove(_) = event.kind {
                        for path in event.paths {
                            if let Err(err) = events.send(FsEvent::Deleted(path)) {
                                log::debug!("dropping deletion, receiver gone: {err}");
                            }
                        }
                    }
                }
                Err(err) => log::warn!("file watcher error: {err}"),
            },
            notify::Config::default(),
        )?;
        watcher.watch(folder, RecursiveMode::Recursive)?;
        log::debug!("watching {}", folder.display());
        Ok(Self {
            folder: folder.to_path_buf(),
            _watcher: watcher,
        })
    }

    #[must_use]
    pub fn folder(&self) -> &Path {
        &self.folder
    }
}
