//! Filesystem watching.
//!
//! One notify watcher per root. Callbacks never touch the index; they only
//! forward the changed paths into the scheduler's queue.

use std::path::{Path, PathBuf};

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{IndexError, Result};
use crate::scan::{RootKind, RootSpec};
use crate::scheduler::Trigger;

/// The live watchers for the current root set.
#[derive(Default)]
pub struct WatchSet {
    watchers: Vec<(PathBuf, RecommendedWatcher)>,
}

impl std::fmt::Debug for WatchSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSet")
            .field(
                "roots",
                &self.watchers.iter().map(|(path, _)| path).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl WatchSet {
    /// Starts a watcher for every root. Roots that cannot be watched are
    /// logged and left unwatched.
    pub fn start(roots: &[RootSpec], sender: &UnboundedSender<Trigger>) -> Self {
        let mut watchers = Vec::with_capacity(roots.len());
        for spec in roots {
            match create_root_watcher(spec, sender.clone()) {
                Ok(watcher) => watchers.push((spec.path.clone(), watcher)),
                Err(error) => tracing::warn!(
                    "filesystem watcher disabled for {}: {}",
                    spec.path.display(),
                    error
                ),
            }
        }
        Self { watchers }
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Stops every watcher. Dropping a notify watcher joins its thread.
    pub fn stop_all(&mut self) {
        let count = self.watchers.len();
        self.watchers.clear();
        if count > 0 {
            tracing::debug!("stopped {count} filesystem watchers");
        }
    }
}

fn create_root_watcher(
    spec: &RootSpec,
    sender: UnboundedSender<Trigger>,
) -> Result<RecommendedWatcher> {
    let mut watcher = recommended_watcher(move |event: notify::Result<Event>| match event {
        Ok(event) => {
            if matches!(event.kind, EventKind::Access(_)) || event.paths.is_empty() {
                return;
            }
            // The receiver is gone once the scheduler stops.
            let _ = sender.send(Trigger::Changed { paths: event.paths });
        }
        Err(error) => tracing::debug!("filesystem watcher error: {error}"),
    })
    .map_err(|error| {
        IndexError::Internal(format!(
            "failed to create filesystem watcher for {}: {error}",
            spec.path.display()
        ))
    })?;

    let (target, mode) = match spec.kind {
        RootKind::Directory => (spec.path.as_path(), RecursiveMode::Recursive),
        RootKind::File => (spec.base_dir(), RecursiveMode::NonRecursive),
    };
    watcher.watch(target, mode).map_err(|error| {
        IndexError::Internal(format!("failed to watch {}: {error}", target.display()))
    })?;
    Ok(watcher)
}

/// Checks if `candidate` is inside the root's scope.
pub fn path_in_scope(spec: &RootSpec, candidate: &Path) -> bool {
    match spec.kind {
        RootKind::Directory => candidate.starts_with(&spec.path),
        RootKind::File => candidate == spec.path,
    }
}

/// Indices of the roots touched by any of `paths`.
pub fn affected_roots(roots: &[RootSpec], paths: &[PathBuf]) -> Vec<usize> {
    roots
        .iter()
        .enumerate()
        .filter(|(_, spec)| paths.iter().any(|path| path_in_scope(spec, path)))
        .map(|(index, _)| index)
        .collect()
}
