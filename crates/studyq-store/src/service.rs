//! Wiring: one table, one recorder, one watchdog and one drainer over a layout

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use studyq_core::Shutdown;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::activity::ActivityTable;
use crate::drainer::{DrainConfig, QueueDrainer, StudyProcessor};
use crate::layout::Layout;
use crate::recorder::IngestRecorder;
use crate::recovery::{RecoveryReport, recover};
use crate::watchdog::{SweepReport, Watchdog, WatchdogConfig};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceConfig {
    pub watchdog: WatchdogConfig,
    pub drain: DrainConfig,
}

#[derive(Debug)]
pub struct StudyService {
    layout: Arc<Layout>,
    table: ActivityTable,
    recorder: IngestRecorder,
    watchdog: Arc<Watchdog>,
    drainer: Arc<QueueDrainer>,
}

impl StudyService {
    /// Create the roots and wire the components. Nothing runs until
    /// [`StudyService::spawn`].
    pub fn new(
        layout: Layout,
        config: ServiceConfig,
        processor: Arc<dyn StudyProcessor>,
    ) -> Result<Self> {
        layout.ensure_dirs()?;
        let layout = Arc::new(layout);
        let table = ActivityTable::new();
        let watchdog = Watchdog::new(table.clone(), layout.clone(), config.watchdog);
        let drainer = QueueDrainer::new(layout.clone(), processor, config.drain)
            .with_queue_lock(watchdog.queue_lock().clone());
        Ok(Self {
            recorder: IngestRecorder::new(layout.clone(), table.clone()),
            watchdog: Arc::new(watchdog),
            drainer: Arc::new(drainer),
            layout,
            table,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Handle for the receiver; clone one per worker.
    pub fn recorder(&self) -> IngestRecorder {
        self.recorder.clone()
    }

    pub fn table(&self) -> &ActivityTable {
        &self.table
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    pub fn drainer(&self) -> &Arc<QueueDrainer> {
        &self.drainer
    }

    /// Rebuild state left by a previous run.
    pub fn recover(&self) -> Result<RecoveryReport> {
        recover(&self.layout, &self.table, &self.watchdog, Instant::now())
            .context("startup recovery failed")
    }

    /// Migrate every staged study now, regardless of idle time.
    pub fn flush(&self) -> SweepReport {
        self.watchdog.sweep_idle_for(Instant::now(), Duration::ZERO)
    }

    /// Run recovery, then start the watchdog and drainer loops.
    pub fn spawn(&self, shutdown: &Shutdown) -> Result<ServiceHandle> {
        self.recover()?;
        log::info!(
            "watching {} (idle threshold {}s, sweep every {}s)",
            self.layout.staging_root().display(),
            self.watchdog.config().idle_threshold.as_secs(),
            self.watchdog.config().interval.as_secs()
        );
        Ok(ServiceHandle {
            watchdog: tokio::spawn(self.watchdog.clone().run(shutdown.clone())),
            drainer: tokio::spawn(self.drainer.clone().run(shutdown.clone())),
        })
    }
}

/// Running background loops.
#[derive(Debug)]
pub struct ServiceHandle {
    watchdog: JoinHandle<u64>,
    drainer: JoinHandle<u64>,
}

impl ServiceHandle {
    /// Wait for both loops to stop. Returns their tick counts.
    pub async fn join(self) -> Result<(u64, u64)> {
        let watchdog = self.watchdog.await.context("watchdog task panicked")?;
        let drainer = self.drainer.await.context("drainer task panicked")?;
        Ok((watchdog, drainer))
    }
}
