//! Staging → queue migration of complete studies

use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};

use crate::key::StudyKey;
use crate::layout::Layout;
use crate::merge::{MoveOutcome, move_tree};

/// Serializes writes into the queue root with the drainer's claims.
///
/// Only covers this process. A second process draining the same root does
/// not take it.
#[derive(Debug, Clone, Default)]
pub struct QueueLock(Arc<Mutex<()>>);

impl QueueLock {
    pub fn hold(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Moves study trees into the queue root.
#[derive(Debug, Clone)]
pub struct Migrator {
    layout: Arc<Layout>,
    queue_lock: QueueLock,
}

impl Migrator {
    pub fn new(layout: Arc<Layout>) -> Self {
        Self {
            layout,
            queue_lock: QueueLock::default(),
        }
    }

    pub fn queue_lock(&self) -> &QueueLock {
        &self.queue_lock
    }

    /// Move the tree at `source` to the queue directory of `key`, merging
    /// with whatever a previous episode left there.
    pub fn migrate(&self, key: &StudyKey, source: &Path) -> Result<MoveOutcome> {
        let destination = self.layout.queue_dir(key);
        let outcome = {
            let _queue = self.queue_lock.hold();
            move_tree(source, &destination)
                .with_context(|| format!("{key}: migration from {} failed", source.display()))?
        };

        match &outcome {
            MoveOutcome::Renamed => log::info!("{key}: queued"),
            MoveOutcome::Copied(stats) => {
                log::info!("{key}: queued ({} files copied across filesystems)", stats.files())
            }
            MoveOutcome::Merged(stats) => log::info!(
                "{key}: merged into existing queue entry ({} files, {} replaced)",
                stats.files(),
                stats.files_replaced
            ),
        }
        Ok(outcome)
    }
}

/// Remove `dir` if it is empty. Returns true if it was removed.
///
/// A non-empty or already missing directory is the normal case (a sibling is
/// still in progress) and is not reported.
pub fn prune_empty_dir(dir: &Path) -> bool {
    match fs::remove_dir(dir) {
        Ok(()) => {
            log::debug!("pruned empty {}", dir.display());
            true
        }
        Err(e) if matches!(
            e.kind(),
            io::ErrorKind::DirectoryNotEmpty | io::ErrorKind::NotFound
        ) => false,
        Err(e) => {
            log::debug!("left {} in place: {e}", dir.display());
            false
        }
    }
}
