//! Queue drainer: hands complete studies to the downstream processor

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use studyq_core::{Shutdown, TickOutcome, run_periodic};

use crate::key::StudyKey;
use crate::layout::{Layout, PARTIAL_MARKER, list_studies};
use crate::manifest::{StudyManifest, study_files};
use crate::merge::move_tree;
use crate::migrator::{QueueLock, prune_empty_dir};

/// A complete study in the queue root. Once claimed, `path` is the hidden
/// `.{accession}.draining` directory the processor reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedStudy {
    pub key: StudyKey,
    pub path: PathBuf,
}

/// Downstream consumer of complete studies.
pub trait StudyProcessor: Send + Sync {
    /// Short name, recorded in manifests.
    fn name(&self) -> &str;

    /// Process one study. An error returns the study to the queue for the
    /// next cycle.
    fn process(&self, study: &QueuedStudy) -> Result<()>;
}

/// Default processor: logs what it would hand downstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProcessor;

impl StudyProcessor for LogProcessor {
    fn name(&self) -> &str {
        "log"
    }

    fn process(&self, study: &QueuedStudy) -> Result<()> {
        let files = study_files(&study.path)?;
        log::info!("{}: ready, {} instances at {}", study.key, files.len(), study.path.display());
        Ok(())
    }
}

/// Runs an external program with the study directory appended to its
/// arguments. `STUDYQ_SUBJECT` / `STUDYQ_ACCESSION` are set in its
/// environment. A non-zero exit status is a failure.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
}

impl CommandProcessor {
    /// Build from `[program, args...]`.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let Some((program, args)) = argv.split_first() else {
            bail!("processor command is empty");
        };
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl StudyProcessor for CommandProcessor {
    fn name(&self) -> &str {
        &self.program
    }

    fn process(&self, study: &QueuedStudy) -> Result<()> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(&study.path)
            .env("STUDYQ_SUBJECT", study.key.subject())
            .env("STUDYQ_ACCESSION", study.key.accession())
            .status()
            .with_context(|| format!("failed to run {}", self.program))?;
        if !status.success() {
            bail!("{} exited with {status}", self.program);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainConfig {
    pub interval: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
        }
    }
}

/// What one drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub drained: Vec<StudyKey>,
    pub failed: Vec<StudyKey>,
    /// Studies skipped because a merge into them is incomplete.
    pub skipped_partial: usize,
}

pub struct QueueDrainer {
    layout: Arc<Layout>,
    processor: Arc<dyn StudyProcessor>,
    config: DrainConfig,
    queue_lock: QueueLock,
}

impl std::fmt::Debug for QueueDrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDrainer")
            .field("processor", &self.processor.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueueDrainer {
    pub fn new(layout: Arc<Layout>, processor: Arc<dyn StudyProcessor>, config: DrainConfig) -> Self {
        Self {
            layout,
            processor,
            config,
            queue_lock: QueueLock::default(),
        }
    }

    /// Share the lock the migrator holds while writing into the queue, so a
    /// claim never splits a study from objects merged into it concurrently.
    pub fn with_queue_lock(mut self, queue_lock: QueueLock) -> Self {
        self.queue_lock = queue_lock;
        self
    }

    /// Complete studies in the queue, plus the number skipped as partial.
    ///
    /// Hidden entries (copies being assembled) are never listed; studies
    /// carrying the partial marker are skipped until the merge finishes.
    pub fn ready_studies(&self) -> Result<(Vec<QueuedStudy>, usize)> {
        let mut ready = Vec::new();
        let mut partial = 0;
        for (key, path) in list_studies(self.layout.queue_root())? {
            if path.join(PARTIAL_MARKER).exists() {
                log::debug!("{key}: merge in progress, skipping");
                partial += 1;
                continue;
            }
            ready.push(QueuedStudy { key, path });
        }
        Ok((ready, partial))
    }

    /// One pass over the queue. Failures are isolated per study; only a
    /// failure to list the queue fails the pass.
    pub fn drain_once(&self) -> Result<DrainReport> {
        let (studies, skipped_partial) = self.ready_studies()?;
        let mut report = DrainReport {
            skipped_partial,
            ..DrainReport::default()
        };

        for study in studies {
            let claimed = match self.claim(&study) {
                Ok(Some(claimed)) => claimed,
                Ok(None) => {
                    log::debug!("{}: merge started before the claim, skipping", study.key);
                    report.skipped_partial += 1;
                    continue;
                }
                Err(e) => {
                    log::error!("{e:#}");
                    report.failed.push(study.key);
                    continue;
                }
            };

            match self.drain_claimed(&claimed) {
                Ok(archived) => {
                    log::info!("{}: drained to {}", study.key, archived.display());
                    report.drained.push(study.key);
                }
                Err(e) => {
                    log::error!("{}: processing failed, returned to queue: {e:#}", study.key);
                    let _queue = self.queue_lock.hold();
                    if let Err(e) = release_claim(&self.layout, &study.key, &claimed.path) {
                        log::error!("{e:#}, released at next startup");
                    }
                    report.failed.push(study.key);
                }
            }
        }
        Ok(report)
    }

    /// Rename `study` to its draining directory. `None` when a merge into it
    /// is incomplete.
    fn claim(&self, study: &QueuedStudy) -> Result<Option<QueuedStudy>> {
        let _queue = self.queue_lock.hold();
        if study.path.join(PARTIAL_MARKER).exists() {
            return Ok(None);
        }
        let claimed = self.layout.draining_dir(&study.key);
        move_tree(&study.path, &claimed)
            .with_context(|| format!("{}: failed to claim for processing", study.key))?;
        Ok(Some(QueuedStudy {
            key: study.key.clone(),
            path: claimed,
        }))
    }

    fn drain_claimed(&self, claimed: &QueuedStudy) -> Result<PathBuf> {
        self.processor.process(claimed)?;

        let archived = self.layout.processed_dir(&claimed.key);
        move_tree(&claimed.path, &archived)
            .with_context(|| format!("{}: failed to archive", claimed.key))?;
        {
            let _queue = self.queue_lock.hold();
            prune_empty_dir(&self.layout.queue_subject_dir(claimed.key.subject()));
        }

        // Manifest covers the whole archive, including earlier episodes
        match StudyManifest::compute(&claimed.key, &archived, self.processor.name()) {
            Ok(manifest) => {
                if let Err(e) = manifest.write_to(&archived) {
                    log::warn!("{}: {e:#}", claimed.key);
                }
            }
            Err(e) => log::warn!("{}: manifest skipped: {e:#}", claimed.key),
        }
        Ok(archived)
    }

    /// Run drain passes every `config.interval` until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) -> u64 {
        let interval = self.config.interval;
        run_periodic("drainer", interval, shutdown, move || {
            let drainer = self.clone();
            async move {
                let report = tokio::task::spawn_blocking(move || drainer.drain_once()).await??;
                Ok(match report.drained.len() + report.failed.len() {
                    0 => TickOutcome::Idle,
                    n => TickOutcome::Worked(n),
                })
            }
        })
        .await
    }
}

/// Put a claimed study back at its queue directory.
///
/// Objects queued for the same key while it was claimed are newer, so they
/// are merged over the claimed copy. An incomplete merge marker on the queue
/// directory is kept. Callers hold the queue lock, or run before the loops.
pub fn release_claim(layout: &Layout, key: &StudyKey, claimed: &Path) -> Result<()> {
    let queued = layout.queue_dir(key);
    let incomplete = queued.join(PARTIAL_MARKER).exists();
    if queued.exists() {
        move_tree(&queued, claimed)
            .with_context(|| format!("{key}: failed to merge newer objects into claimed copy"))?;
    }
    fs::rename(claimed, &queued)
        .with_context(|| format!("{key}: failed to return {} to the queue", claimed.display()))?;
    if incomplete {
        fs::write(queued.join(PARTIAL_MARKER), b"")
            .with_context(|| format!("{key}: failed to restore merge marker"))?;
    }
    Ok(())
}
