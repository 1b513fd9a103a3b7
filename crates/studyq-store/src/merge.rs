//! Directory tree relocation with a source-wins merge policy
//!
//! [`move_tree`] is the entry point: a plain rename when the destination is
//! free, a copy through a hidden temporary sibling across filesystems, and a
//! marker-guarded merge when the destination already exists. [`merge_tree`]
//! is usable on its own.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::layout::PARTIAL_MARKER;

/// How files get from source to destination during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Rename each file, copying only when the rename crosses filesystems.
    /// The source loses files as they are moved.
    Move,
    /// Copy every file; the source is left untouched.
    Copy,
}

/// Counters from one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub files_moved: usize,
    pub files_copied: usize,
    /// Destination files overwritten by a source file of the same name.
    pub files_replaced: usize,
    pub dirs_created: usize,
}

impl MergeStats {
    pub fn files(&self) -> usize {
        self.files_moved + self.files_copied
    }
}

/// What [`move_tree`] ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Destination was free; one rename.
    Renamed,
    /// Destination was free but on another filesystem; copied then deleted.
    Copied(MergeStats),
    /// Destination existed; merged into it.
    Merged(MergeStats),
}

fn is_cross_device(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::CrossesDevices
}

/// Merge the tree at `src` into `dst`, overwriting files that exist in both.
///
/// Directories are created as needed. Files already in `dst` but not in `src`
/// are kept. A file replaced concurrently in `dst` is simply overwritten again
/// (last writer wins). Stray `.partial` markers in `src` are not carried over.
pub fn merge_tree(src: &Path, dst: &Path, transfer: Transfer) -> Result<MergeStats> {
    let mut stats = MergeStats::default();
    merge_dir(src, dst, transfer, &mut stats)?;
    Ok(stats)
}

fn merge_dir(src: &Path, dst: &Path, transfer: Transfer, stats: &mut MergeStats) -> Result<()> {
    if !dst.is_dir() {
        fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
        stats.dirs_created += 1;
    }

    for entry in fs::read_dir(src).with_context(|| format!("failed to list {}", src.display()))? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            merge_dir(&from, &to, transfer, stats)?;
        } else if entry.file_name() == PARTIAL_MARKER {
            continue;
        } else {
            place_file(&from, &to, transfer, stats)
                .with_context(|| format!("failed to place {} → {}", from.display(), to.display()))?;
        }
    }
    Ok(())
}

fn place_file(from: &Path, to: &Path, transfer: Transfer, stats: &mut MergeStats) -> io::Result<()> {
    let replacing = to.exists();

    if transfer == Transfer::Move {
        match fs::rename(from, to) {
            Ok(()) => {
                stats.files_moved += 1;
                if replacing {
                    stats.files_replaced += 1;
                }
                return Ok(());
            }
            Err(e) if is_cross_device(&e) => {}
            Err(e) => return Err(e),
        }
    }

    copy_file(from, to)?;
    stats.files_copied += 1;
    if replacing {
        stats.files_replaced += 1;
    }
    Ok(())
}

/// Copy through a temp file in the destination directory, then rename over
/// `to`. Readers never see a half-written file, and a failed copy leaves no
/// temp file behind.
fn copy_file(from: &Path, to: &Path) -> io::Result<()> {
    let dir = to.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".merge")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    let mut reader = fs::File::open(from)?;
    io::copy(&mut reader, tmp.as_file_mut())?;
    tmp.persist(to).map_err(|e| e.error)?;
    Ok(())
}

/// Hidden sibling used to assemble a cross-filesystem copy.
fn copy_staging_path(dst: &Path) -> Result<PathBuf> {
    let name = dst
        .file_name()
        .with_context(|| format!("destination has no file name: {}", dst.display()))?;
    Ok(dst.with_file_name(format!(".{}.tmp", name.to_string_lossy())))
}

/// Relocate the tree at `src` to `dst`.
///
/// - `dst` absent: rename. If the rename crosses filesystems, copy into a
///   hidden temp sibling, rename that into place, then delete `src`. A failed
///   copy removes the temp sibling and leaves `src` intact.
/// - `dst` present: drop a `.partial` marker into it, merge (source wins),
///   delete `src`, remove the marker. On failure the marker stays so readers
///   of `dst` can tell the tree is incomplete.
///
/// Missing `src` is an error.
pub fn move_tree(src: &Path, dst: &Path) -> Result<MoveOutcome> {
    if !src.is_dir() {
        bail!("source tree missing: {}", src.display());
    }

    // The parent may be pruned between create and rename by a concurrent
    // cleanup; a couple of attempts settle that.
    for _ in 0..3 {
        if dst.exists() {
            return merge_into_existing(src, dst).map(MoveOutcome::Merged);
        }
        let parent = dst.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        match fs::rename(src, dst) {
            Ok(()) => return Ok(MoveOutcome::Renamed),
            Err(e) if is_cross_device(&e) => {
                return copy_across(src, dst).map(MoveOutcome::Copied);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && src.is_dir() => {
                log::debug!("{}: parent vanished during rename, retrying", dst.display());
            }
            // Destination appeared between the check and the rename
            Err(e) if dst.exists() => {
                log::debug!("{}: destination appeared ({e}), merging", dst.display());
                return merge_into_existing(src, dst).map(MoveOutcome::Merged);
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to rename {} → {}", src.display(), dst.display())
                });
            }
        }
    }
    bail!("destination parent keeps disappearing: {}", dst.display())
}

fn copy_across(src: &Path, dst: &Path) -> Result<MergeStats> {
    let tmp = copy_staging_path(dst)?;
    if tmp.exists() {
        log::warn!("removing stale copy {}", tmp.display());
        fs::remove_dir_all(&tmp)
            .with_context(|| format!("failed to remove {}", tmp.display()))?;
    }

    let stats = match merge_tree(src, &tmp, Transfer::Copy) {
        Ok(stats) => stats,
        Err(e) => {
            if let Err(cleanup) = fs::remove_dir_all(&tmp) {
                log::warn!("failed to remove partial copy {}: {cleanup}", tmp.display());
            }
            return Err(e);
        }
    };

    match fs::rename(&tmp, dst) {
        Ok(()) => {}
        Err(_) if dst.exists() => {
            // Lost a race with another writer; fold the finished copy in
            merge_into_existing(&tmp, dst)?;
        }
        Err(e) => {
            return Err(e).with_context(|| {
                format!("failed to rename {} → {}", tmp.display(), dst.display())
            });
        }
    }

    fs::remove_dir_all(src).with_context(|| format!("failed to remove {}", src.display()))?;
    Ok(stats)
}

fn merge_into_existing(src: &Path, dst: &Path) -> Result<MergeStats> {
    let marker = dst.join(PARTIAL_MARKER);
    fs::write(&marker, b"").with_context(|| format!("failed to mark {}", dst.display()))?;

    let stats = merge_tree(src, dst, Transfer::Move)?;

    match fs::remove_dir_all(src) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("failed to remove {}", src.display()));
        }
    }
    fs::remove_file(&marker)
        .with_context(|| format!("failed to unmark {}", dst.display()))?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, data: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    fn files_under(root: &Path) -> Vec<String> {
        let pattern = root.join("**/*");
        let mut files: Vec<String> = glob::glob(&pattern.to_string_lossy())
            .unwrap()
            .filter_map(|p| p.ok())
            .filter(|p| p.is_file())
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().into_owned())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn merge_unions_and_source_wins() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src.join("01/a.dcm"), b"new-a");
        write(&src.join("01/b.dcm"), b"b");
        write(&dst.join("01/a.dcm"), b"old-a");
        write(&dst.join("02/c.dcm"), b"c");

        let stats = merge_tree(&src, &dst, Transfer::Move).unwrap();
        assert_eq!(stats.files(), 2);
        assert_eq!(stats.files_replaced, 1);

        assert_eq!(files_under(&dst), vec!["01/a.dcm", "01/b.dcm", "02/c.dcm"]);
        assert_eq!(fs::read(dst.join("01/a.dcm")).unwrap(), b"new-a");
    }

    #[test]
    fn copy_leaves_source_intact() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src.join("01/a.dcm"), b"a");

        let stats = merge_tree(&src, &dst, Transfer::Copy).unwrap();
        assert_eq!(stats.files_copied, 1);
        assert!(src.join("01/a.dcm").exists());
        assert_eq!(fs::read(dst.join("01/a.dcm")).unwrap(), b"a");
    }

    #[test]
    fn merge_skips_source_marker() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src.join("a.dcm"), b"a");
        write(&src.join(PARTIAL_MARKER), b"");

        merge_tree(&src, &dst, Transfer::Copy).unwrap();
        assert!(!dst.join(PARTIAL_MARKER).exists());
    }

    #[test]
    fn move_tree_renames_when_free() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("received/P1/A1");
        let dst = dir.path().join("queue/P1/A1");
        write(&src.join("01/a.dcm"), b"a");

        let outcome = move_tree(&src, &dst).unwrap();
        assert_eq!(outcome, MoveOutcome::Renamed);
        assert!(!src.exists());
        assert_eq!(files_under(&dst), vec!["01/a.dcm"]);
    }

    #[test]
    fn move_tree_merges_into_existing() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("received/P1/A1");
        let dst = dir.path().join("queue/P1/A1");
        write(&src.join("01/a.dcm"), b"second");
        write(&dst.join("01/a.dcm"), b"first");
        write(&dst.join("01/z.dcm"), b"z");

        let outcome = move_tree(&src, &dst).unwrap();
        assert!(matches!(outcome, MoveOutcome::Merged(_)));
        assert!(!src.exists());
        assert!(!dst.join(PARTIAL_MARKER).exists());
        assert_eq!(files_under(&dst), vec!["01/a.dcm", "01/z.dcm"]);
        assert_eq!(fs::read(dst.join("01/a.dcm")).unwrap(), b"second");
    }

    #[test]
    fn move_tree_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src.join("a.dcm"), b"a");
        write(&dst.join("b.dcm"), b"b");

        move_tree(&src, &dst).unwrap();
        let leftovers: Vec<_> = fs::read_dir(&dst)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
        assert!(!dir.path().join(".dst.tmp").exists());
    }

    #[test]
    fn move_tree_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = move_tree(&dir.path().join("nope"), &dir.path().join("dst")).unwrap_err();
        assert!(err.to_string().contains("source tree missing"));
    }

    #[test]
    fn move_tree_keeps_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("received/P1/A1");
        let sibling = dir.path().join("received/P1/A2");
        write(&src.join("a.dcm"), b"a");
        write(&sibling.join("b.dcm"), b"b");

        move_tree(&src, &dir.path().join("queue/P1/A1")).unwrap();
        assert!(sibling.join("b.dcm").exists());
    }

    #[test]
    fn copy_across_assembles_then_renames() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("out/dst");
        write(&src.join("01/a.dcm"), b"a");
        fs::create_dir_all(dst.parent().unwrap()).unwrap();

        let stats = copy_across(&src, &dst).unwrap();
        assert_eq!(stats.files_copied, 1);
        assert!(!src.exists());
        assert!(!dir.path().join("out/.dst.tmp").exists());
        assert_eq!(files_under(&dst), vec!["01/a.dcm"]);
    }
}
