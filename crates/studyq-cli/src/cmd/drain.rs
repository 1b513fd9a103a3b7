//! `studyq drain` - one pass over the queue

use std::process::ExitCode;

use anyhow::Result;

use studyq_store::StudyService;

use crate::config::Config;

pub fn run(config: &Config) -> Result<ExitCode> {
    let service = StudyService::new(config.layout(), config.service(), config.processor()?)?;
    let report = service.drainer().drain_once()?;

    if report.drained.is_empty() && report.failed.is_empty() {
        eprintln!("Queue is empty.");
    } else {
        eprintln!("Drained {} studies:", report.drained.len());
        for key in &report.drained {
            eprintln!("  {key}");
        }
    }
    if report.skipped_partial > 0 {
        eprintln!("{} studies skipped (merge in progress)", report.skipped_partial);
    }

    if !report.failed.is_empty() {
        eprintln!("{} studies failed and stay queued:", report.failed.len());
        for key in &report.failed {
            eprintln!("  {key}");
        }
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}
