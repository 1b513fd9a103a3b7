//! On-disk layout of the staging, queue and processed roots
//!
//! Directory layout:
//! ```text
//! {root}/
//! ├── received/                         # staging: studies still arriving
//! │   └── {subject}/
//! │       ├── {accession}/
//! │       │   └── {series}_{desc}/{instance}.dcm
//! │       └── .{accession}.{episode}.migrating   # detached, being migrated
//! ├── queue/                            # complete studies awaiting dispatch
//! │   └── {subject}/
//! │       ├── {accession}/...           # .partial marker while a merge runs
//! │       └── .{accession}.draining     # claimed by the drainer
//! ├── processed/                        # dispatched studies + manifest.json
//! └── failed-migrations.jsonl
//! ```
//!
//! Names starting with `.` are never treated as studies.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::key::{StudyKey, series_segment};

/// Marker file present in a queue study while a merge into it is incomplete.
pub const PARTIAL_MARKER: &str = ".partial";

const DETACHED_SUFFIX: &str = ".migrating";
const DRAINING_SUFFIX: &str = ".draining";

/// Resolved directory roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    staging: PathBuf,
    queue: PathBuf,
    processed: PathBuf,
    failure_log: PathBuf,
}

impl Layout {
    /// Standard layout below a single root directory.
    pub fn under(root: &Path) -> Self {
        Self {
            staging: root.join("received"),
            queue: root.join("queue"),
            processed: root.join("processed"),
            failure_log: root.join("failed-migrations.jsonl"),
        }
    }

    pub fn new(staging: PathBuf, queue: PathBuf, processed: PathBuf, failure_log: PathBuf) -> Self {
        Self {
            staging,
            queue,
            processed,
            failure_log,
        }
    }

    /// Create the three roots if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.staging, &self.queue, &self.processed] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging
    }

    pub fn queue_root(&self) -> &Path {
        &self.queue
    }

    pub fn processed_root(&self) -> &Path {
        &self.processed
    }

    pub fn failure_log(&self) -> &Path {
        &self.failure_log
    }

    pub fn staging_dir(&self, key: &StudyKey) -> PathBuf {
        self.staging.join(key.rel_path())
    }

    pub fn queue_dir(&self, key: &StudyKey) -> PathBuf {
        self.queue.join(key.rel_path())
    }

    pub fn processed_dir(&self, key: &StudyKey) -> PathBuf {
        self.processed.join(key.rel_path())
    }

    pub fn staging_subject_dir(&self, subject: &str) -> PathBuf {
        self.staging.join(subject)
    }

    pub fn queue_subject_dir(&self, subject: &str) -> PathBuf {
        self.queue.join(subject)
    }

    /// Directory an instance of `key` is written to.
    pub fn series_dir(
        &self,
        key: &StudyKey,
        series_number: Option<u32>,
        series_description: Option<&str>,
    ) -> PathBuf {
        let study = self.staging_dir(key);
        match series_segment(series_number, series_description) {
            Some(segment) => study.join(segment),
            None => study,
        }
    }

    /// Hidden sibling a claimed study is renamed to before migration.
    pub fn detached_dir(&self, key: &StudyKey, episode: u64) -> PathBuf {
        self.staging_subject_dir(key.subject())
            .join(format!(".{}.{episode}{DETACHED_SUFFIX}", key.accession()))
    }

    /// Hidden sibling a queued study is renamed to while it is processed.
    pub fn draining_dir(&self, key: &StudyKey) -> PathBuf {
        self.queue_subject_dir(key.subject())
            .join(format!(".{}{DRAINING_SUFFIX}", key.accession()))
    }

    /// Move the live staging tree of `key` aside so new objects start a fresh tree.
    pub fn detach(&self, key: &StudyKey, episode: u64) -> io::Result<PathBuf> {
        let to = self.detached_dir(key, episode);
        fs::rename(self.staging_dir(key), &to)?;
        Ok(to)
    }
}

/// True for names reserved for in-progress work.
pub fn is_hidden(name: &OsStr) -> bool {
    name.as_encoded_bytes().first() == Some(&b'.')
}

/// Parse `.{accession}.{episode}.migrating` back into its parts.
pub fn parse_detached(name: &str) -> Option<(&str, u64)> {
    let inner = name.strip_prefix('.')?.strip_suffix(DETACHED_SUFFIX)?;
    let (accession, episode) = inner.rsplit_once('.')?;
    if accession.is_empty() {
        return None;
    }
    Some((accession, episode.parse().ok()?))
}

/// Parse `.{accession}.draining` back into the accession.
pub fn parse_draining(name: &str) -> Option<&str> {
    let accession = name.strip_prefix('.')?.strip_suffix(DRAINING_SUFFIX)?;
    (!accession.is_empty()).then_some(accession)
}

/// List visible `{subject}/{accession}` directories under `root`, sorted by key.
///
/// A missing root yields an empty list.
pub fn list_studies(root: &Path) -> Result<Vec<(StudyKey, PathBuf)>> {
    let mut studies = Vec::new();
    let subjects = match fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(studies),
        Err(e) => return Err(e).with_context(|| format!("failed to list {}", root.display())),
    };

    for subject in subjects {
        let subject = subject?;
        if is_hidden(&subject.file_name()) || !subject.file_type()?.is_dir() {
            continue;
        }
        let subject_name = subject.file_name().to_string_lossy().into_owned();
        for study in fs::read_dir(subject.path())? {
            let study = study?;
            if is_hidden(&study.file_name()) || !study.file_type()?.is_dir() {
                continue;
            }
            let key = StudyKey::new(&subject_name, &study.file_name().to_string_lossy());
            studies.push((key, study.path()));
        }
    }

    studies.sort();
    Ok(studies)
}
