//! Startup recovery: rebuilds in-memory state from what a previous run left on disk

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::time::Instant;

use crate::activity::ActivityTable;
use crate::key::StudyKey;
use crate::drainer::release_claim;
use crate::layout::{
    Layout, PARTIAL_MARKER, is_hidden, list_studies, parse_detached, parse_draining,
};
use crate::manifest::study_files;
use crate::watchdog::{PendingMigration, Watchdog};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Leftover temp files and copies removed.
    pub temp_removed: usize,
    /// Staged studies put back in the table.
    pub adopted: Vec<StudyKey>,
    /// Detached trees queued for migration.
    pub resumed: Vec<StudyKey>,
    /// Studies a drain pass had claimed, put back in the queue.
    pub released: Vec<StudyKey>,
    /// Empty study or subject directories removed.
    pub empty_removed: usize,
    pub markers_cleared: usize,
}

/// Restore table and watchdog backlog from disk. Call before the loops start.
///
/// Adopted studies are stamped `now`, so they get a full idle window before
/// being migrated.
pub fn recover(
    layout: &Layout,
    table: &ActivityTable,
    watchdog: &Watchdog,
    now: Instant,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for root in [layout.staging_root(), layout.queue_root(), layout.processed_root()] {
        report.temp_removed += remove_temp_entries(root)?;
    }

    for (key, path) in draining_claims(layout.queue_root())? {
        log::info!("{key}: returning interrupted drain to the queue");
        release_claim(layout, &key, &path)?;
        report.released.push(key);
    }

    for (key, path) in list_studies(layout.staging_root())? {
        if study_files(&path)?.is_empty() {
            remove_tree(&path)?;
            report.empty_removed += 1;
            continue;
        }
        if table.adopt(&key, now) {
            log::info!("{key}: adopted staged study from previous run");
            report.adopted.push(key);
        }
    }

    for (key, episode, path) in detached_trees(layout.staging_root())? {
        table.observe_episode(episode);
        if study_files(&path)?.is_empty() {
            remove_tree(&path)?;
            report.empty_removed += 1;
            continue;
        }
        log::info!("{key}: resuming interrupted migration of episode {episode}");
        watchdog.enqueue(PendingMigration {
            key: key.clone(),
            episode,
            source: path,
            attempts: 0,
        });
        report.resumed.push(key);
    }

    let pending = watchdog.pending_keys();
    report.markers_cleared += clear_markers(layout.queue_root(), |key| !pending.contains(key))?;
    // An archive merge resumes on the next drain pass if its queue source survived
    report.markers_cleared +=
        clear_markers(layout.processed_root(), |key| !layout.queue_dir(key).exists())?;

    for subject in subject_dirs(layout.staging_root())? {
        let name = subject_name(&subject);
        if table.prune_subject(&name, &subject) {
            report.empty_removed += 1;
        }
    }

    log::info!(
        "recovery: {} adopted, {} resumed, {} released, {} temp entries removed",
        report.adopted.len(),
        report.resumed.len(),
        report.released.len(),
        report.temp_removed
    );
    Ok(report)
}

/// Remove hidden `*.tmp` files and directories anywhere under `root`.
fn remove_temp_entries(root: &Path) -> Result<usize> {
    let pattern = root.join("**").join(".*.tmp");
    let mut found: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .context("invalid glob pattern")?
        .filter_map(|e| e.ok())
        .collect();
    found.sort();

    let mut count = 0;
    for path in found {
        // An enclosing temp dir may already be gone
        let Ok(meta) = fs::symlink_metadata(&path) else {
            continue;
        };
        log::info!("cleaning stale tmp: {}", path.display());
        if meta.is_dir() {
            remove_tree(&path)?;
        } else {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to remove {}", path.display()));
                }
            }
        }
        count += 1;
    }
    Ok(count)
}

fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn subject_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn subject_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("failed to list {}", root.display())),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !is_hidden(&entry.file_name()) && entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// `.{accession}.{episode}.migrating` directories, oldest episode first.
fn detached_trees(staging: &Path) -> Result<Vec<(StudyKey, u64, PathBuf)>> {
    let mut trees = Vec::new();
    for subject in subject_dirs(staging)? {
        let subject_name = subject_name(&subject);
        for entry in fs::read_dir(&subject)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some((accession, episode)) = parse_detached(&name) {
                trees.push((StudyKey::new(&subject_name, accession), episode, entry.path()));
            }
        }
    }
    trees.sort_by_key(|(_, episode, _)| *episode);
    Ok(trees)
}

/// `.{accession}.draining` directories under the queue root.
fn draining_claims(queue: &Path) -> Result<Vec<(StudyKey, PathBuf)>> {
    let mut claims = Vec::new();
    for subject in subject_dirs(queue)? {
        let subject_name = subject_name(&subject);
        for entry in fs::read_dir(&subject)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(accession) = parse_draining(&name) {
                claims.push((StudyKey::new(&subject_name, accession), entry.path()));
            }
        }
    }
    claims.sort();
    Ok(claims)
}

fn clear_markers(root: &Path, clear: impl Fn(&StudyKey) -> bool) -> Result<usize> {
    let mut count = 0;
    for (key, path) in list_studies(root)? {
        let marker = path.join(PARTIAL_MARKER);
        if marker.exists() && clear(&key) {
            log::warn!("{key}: clearing stale merge marker in {}", root.display());
            fs::remove_file(&marker)
                .with_context(|| format!("failed to remove {}", marker.display()))?;
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::StudyStatus;
    use crate::watchdog::WatchdogConfig;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, Arc<Layout>, ActivityTable, Watchdog) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(Layout::under(dir.path()));
        layout.ensure_dirs().unwrap();
        let table = ActivityTable::new();
        let watchdog = Watchdog::new(table.clone(), layout.clone(), WatchdogConfig::default());
        (dir, layout, table, watchdog)
    }

    fn write(path: &Path, data: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    #[test]
    fn adopts_staged_and_drops_temp_files() {
        let (_dir, layout, table, watchdog) = setup();
        let key = StudyKey::new("P1", "A1");
        let study = layout.staging_dir(&key);
        write(&study.join("01/a.dcm"), b"a");
        write(&study.join("01/.incomingXYZ.tmp"), b"half");
        fs::create_dir_all(layout.staging_dir(&StudyKey::new("P2", "EMPTY")).join("01")).unwrap();

        let now = Instant::now();
        let report = recover(&layout, &table, &watchdog, now).unwrap();
        assert_eq!(report.adopted, vec![key.clone()]);
        assert_eq!(report.temp_removed, 1);
        assert!(!study.join("01/.incomingXYZ.tmp").exists());
        assert!(!layout.staging_subject_dir("P2").exists());

        let entry = table.get(&key).unwrap();
        assert_eq!(entry.status, StudyStatus::Receiving);
        assert_eq!(entry.last_activity, now);

        // Full idle window before migration
        assert!(watchdog.sweep(now + Duration::from_secs(60)).migrated.is_empty());
        assert_eq!(watchdog.sweep(now + Duration::from_secs(120)).migrated, vec![key]);
    }

    #[test]
    fn resumes_interrupted_migration() {
        let (_dir, layout, table, watchdog) = setup();
        let key = StudyKey::new("P1", "A1");
        let detached = layout.detached_dir(&key, 7);
        write(&detached.join("01/b.dcm"), b"b");
        // Half-finished merge into the queue
        let queued = layout.queue_dir(&key);
        write(&queued.join("01/a.dcm"), b"a");
        write(&queued.join(PARTIAL_MARKER), b"");

        let now = Instant::now();
        let report = recover(&layout, &table, &watchdog, now).unwrap();
        assert_eq!(report.resumed, vec![key.clone()]);
        assert_eq!(report.markers_cleared, 0);
        assert_eq!(watchdog.backlog_len(), 1);

        // Episode numbering continues past what was on disk
        let ticket = table.begin_write(&StudyKey::new("P9", "Z"), now);
        assert!(ticket.episode() > 7);
        table.abort_write(ticket);

        let sweep = watchdog.sweep(now);
        assert_eq!(sweep.migrated, vec![key.clone()]);
        assert!(queued.join("01/a.dcm").exists());
        assert!(queued.join("01/b.dcm").exists());
        assert!(!queued.join(PARTIAL_MARKER).exists());
        assert!(!detached.exists());
    }

    #[test]
    fn clears_orphan_markers_and_copies() {
        let (_dir, layout, table, watchdog) = setup();
        let key = StudyKey::new("P1", "A1");
        write(&layout.queue_dir(&key).join("a.dcm"), b"a");
        write(&layout.queue_dir(&key).join(PARTIAL_MARKER), b"");
        let copy = layout.queue_subject_dir("P1").join(".A2.tmp");
        write(&copy.join("x.dcm"), b"x");

        let report = recover(&layout, &table, &watchdog, Instant::now()).unwrap();
        assert_eq!(report.markers_cleared, 1);
        assert_eq!(report.temp_removed, 1);
        assert!(!copy.exists());
        assert!(!layout.queue_dir(&key).join(PARTIAL_MARKER).exists());
        assert!(layout.queue_dir(&key).join("a.dcm").exists());
    }

    #[test]
    fn releases_interrupted_drain() {
        let (_dir, layout, table, watchdog) = setup();
        let key = StudyKey::new("P1", "A1");
        let claimed = layout.draining_dir(&key);
        write(&claimed.join("01/a.dcm"), b"old");
        write(&claimed.join("01/b.dcm"), b"b");
        // Queued after the claim, before the crash
        let queued = layout.queue_dir(&key);
        write(&queued.join("01/a.dcm"), b"new");

        let report = recover(&layout, &table, &watchdog, Instant::now()).unwrap();
        assert_eq!(report.released, vec![key.clone()]);
        assert!(!claimed.exists());
        assert_eq!(fs::read(queued.join("01/a.dcm")).unwrap(), b"new");
        assert!(queued.join("01/b.dcm").exists());
        assert!(!queued.join(PARTIAL_MARKER).exists());
    }

    #[test]
    fn empty_roots_are_fine() {
        let (_dir, layout, table, watchdog) = setup();
        let report = recover(&layout, &table, &watchdog, Instant::now()).unwrap();
        assert_eq!(report, RecoveryReport::default());
    }
}
