//! `studyq serve` - run the watchdog and drainer until interrupted

use std::process::ExitCode;

use anyhow::{Context, Result};

use studyq_core::{Shutdown, install_signal_handlers};
use studyq_store::StudyService;

use crate::config::Config;

pub fn run(config: &Config) -> Result<ExitCode> {
    let service = StudyService::new(config.layout(), config.service(), config.processor()?)?;

    let shutdown = Shutdown::new();
    install_signal_handlers(&shutdown).context("failed to install signal handlers")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let (watchdog_ticks, drain_ticks) = runtime.block_on(async {
        let handle = service.spawn(&shutdown)?;
        shutdown.requested().await;
        handle.join().await
    })?;

    log::info!(
        "stopped: {watchdog_ticks} watchdog cycles, {drain_ticks} drain passes, {} studies still staged",
        service.table().len()
    );
    Ok(ExitCode::from(130))
}
