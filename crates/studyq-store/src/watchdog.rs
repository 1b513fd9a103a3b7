//! Idle watchdog: decides a study is complete after enough silence
//!
//! Each cycle retries the backlog of failed migrations, claims every study
//! idle past the threshold, migrates it to the queue root, and prunes subject
//! directories left empty in staging. Episodes of one study reach the queue
//! oldest first.

use std::collections::BTreeSet;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use studyq_core::{RetryPolicy, Shutdown, TickOutcome, is_transient, run_periodic};
use tokio::time::Instant;

use crate::activity::{ActivityTable, Claim};
use crate::failure_log::{FailureLog, FailureRecord};
use crate::key::StudyKey;
use crate::layout::Layout;
use crate::migrator::{Migrator, QueueLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Silence after which a study is presumed complete.
    pub idle_threshold: Duration,
    /// Time between cycles.
    pub interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(120),
            interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// A detached tree waiting to be migrated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMigration {
    pub key: StudyKey,
    pub episode: u64,
    pub source: std::path::PathBuf,
    /// Failed attempts so far.
    pub attempts: u32,
}

impl From<Claim> for PendingMigration {
    fn from(claim: Claim) -> Self {
        Self {
            key: claim.key,
            episode: claim.episode,
            source: claim.source,
            attempts: 0,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Studies newly claimed this cycle.
    pub claimed: usize,
    pub migrated: Vec<StudyKey>,
    /// Failed this cycle, back in the backlog.
    pub retrying: Vec<StudyKey>,
    /// Out of attempts; written to the failure log.
    pub abandoned: Vec<StudyKey>,
    /// Held back behind an older episode of the same study that is still
    /// pending. No attempt is counted.
    pub deferred: Vec<StudyKey>,
    pub pruned_subjects: usize,
}

impl SweepReport {
    pub fn handled(&self) -> usize {
        self.migrated.len() + self.retrying.len() + self.abandoned.len()
    }
}

pub struct Watchdog {
    table: ActivityTable,
    layout: Arc<Layout>,
    migrator: Migrator,
    failures: FailureLog,
    config: WatchdogConfig,
    backlog: Mutex<Vec<PendingMigration>>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("config", &self.config)
            .field("backlog", &self.backlog_len())
            .finish_non_exhaustive()
    }
}

impl Watchdog {
    pub fn new(table: ActivityTable, layout: Arc<Layout>, config: WatchdogConfig) -> Self {
        Self {
            migrator: Migrator::new(layout.clone()),
            failures: FailureLog::new(layout.failure_log()),
            table,
            layout,
            config,
            backlog: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Lock held while a migration writes into the queue root.
    pub fn queue_lock(&self) -> &QueueLock {
        self.migrator.queue_lock()
    }

    /// Schedule a detached tree for migration on the next cycle.
    pub fn enqueue(&self, pending: PendingMigration) {
        log::debug!("{}: queued detached tree {}", pending.key, pending.source.display());
        self.backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pending);
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Keys with a detached tree still waiting for migration.
    pub fn pending_keys(&self) -> BTreeSet<StudyKey> {
        self.backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|p| p.key.clone())
            .collect()
    }

    /// One cycle with the configured idle threshold.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        self.sweep_idle_for(now, self.config.idle_threshold)
    }

    /// One cycle claiming studies idle for at least `threshold`.
    ///
    /// A zero threshold flushes every study without writes in flight.
    pub fn sweep_idle_for(&self, now: Instant, threshold: Duration) -> SweepReport {
        let mut report = SweepReport::default();

        let mut work = {
            let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *backlog)
        };
        let claims = self
            .table
            .claim_idle(now, threshold, |key, episode| self.layout.detach(key, episode));
        report.claimed = claims.len();
        for claim in &claims {
            log::info!(
                "{}: idle for {}s after {} objects, migrating episode {}",
                claim.key,
                claim.idle_for.as_secs(),
                claim.objects,
                claim.episode
            );
        }
        work.extend(claims.into_iter().map(PendingMigration::from));
        work.sort_by(|a, b| a.key.cmp(&b.key).then(a.episode.cmp(&b.episode)));

        // A newer episode merged first would be overwritten by the older one
        let mut blocked = BTreeSet::new();
        let mut subjects = BTreeSet::new();
        for pending in work {
            subjects.insert(pending.key.subject().to_string());
            if blocked.contains(&pending.key) {
                log::debug!(
                    "{}: episode {} waits for an earlier episode",
                    pending.key,
                    pending.episode
                );
                report.deferred.push(pending.key.clone());
                self.enqueue(pending);
                continue;
            }
            let key = pending.key.clone();
            if self.run_migration(pending, &mut report) {
                blocked.insert(key);
            }
        }

        for subject in subjects {
            let dir = self.layout.staging_subject_dir(&subject);
            if self.table.prune_subject(&subject, &dir) {
                report.pruned_subjects += 1;
            }
        }
        report
    }

    /// Migrate one tree. True when it went back on the backlog.
    fn run_migration(&self, mut pending: PendingMigration, report: &mut SweepReport) -> bool {
        let err = match self.migrator.migrate(&pending.key, &pending.source) {
            Ok(_) => {
                self.table.finish(&pending.key, pending.episode);
                report.migrated.push(pending.key);
                return false;
            }
            Err(e) => e,
        };

        pending.attempts += 1;
        let transient = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<io::Error>())
            .is_none_or(is_transient);

        if transient && !self.config.retry.exhausted(pending.attempts) {
            log::warn!(
                "attempt {}/{} failed, retrying next cycle: {err:#}",
                pending.attempts,
                self.config.retry.max_attempts
            );
            report.retrying.push(pending.key.clone());
            self.enqueue(pending);
            return true;
        }

        log::error!(
            "giving up after {} attempts, source left at {}: {err:#}",
            pending.attempts,
            pending.source.display()
        );
        let record = FailureRecord {
            key: pending.key.clone(),
            episode: pending.episode,
            attempts: pending.attempts,
            source: pending.source.clone(),
            error: format!("{err:#}"),
            failed_at: chrono::Utc::now(),
        };
        if let Err(e) = self.failures.append(&record) {
            log::error!("{}: could not record failure: {e:#}", pending.key);
        }
        self.table.finish(&pending.key, pending.episode);
        report.abandoned.push(pending.key);
        false
    }

    /// Run cycles every `config.interval` until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) -> u64 {
        let interval = self.config.interval;
        run_periodic("watchdog", interval, shutdown, move || {
            let watchdog = self.clone();
            async move {
                let now = Instant::now();
                let report = tokio::task::spawn_blocking(move || watchdog.sweep(now)).await?;
                Ok(match report.handled() {
                    0 => TickOutcome::Idle,
                    n => TickOutcome::Worked(n),
                })
            }
        })
        .await
    }
}
