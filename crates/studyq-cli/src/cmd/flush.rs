//! `studyq flush` - migrate every staged study now

use std::process::ExitCode;

use anyhow::Result;

use studyq_store::StudyService;

use crate::config::Config;

pub fn run(config: &Config) -> Result<ExitCode> {
    let service = StudyService::new(config.layout(), config.service(), config.processor()?)?;
    let recovered = service.recover()?;
    let report = service.flush();

    eprintln!(
        "Migrated {} studies ({} resumed from a previous run)",
        report.migrated.len(),
        recovered.resumed.len()
    );
    for key in &report.migrated {
        eprintln!("  {key}");
    }

    for key in &report.deferred {
        log::warn!("{key}: newer episode held back behind a failed one, resumed on next start");
    }
    let failed = report.retrying.len() + report.abandoned.len();
    if failed > 0 {
        for key in report.retrying.iter().chain(&report.abandoned) {
            log::error!("{key}: migration failed, source kept on disk");
        }
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}
