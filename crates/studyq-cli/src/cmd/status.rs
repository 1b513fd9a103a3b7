//! `studyq status` - staged, queued and processed studies

use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

use studyq_store::layout::list_studies;
use studyq_store::manifest::{series_counts, study_files};
use studyq_store::{FailureLog, StudyManifest};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Include the processed archive
    #[arg(long)]
    pub all: bool,
}

/// One row of the status table.
struct StudyRow {
    area: &'static str,
    key: String,
    series: usize,
    instances: usize,
    hash: String,
}

pub fn run(args: StatusArgs, config: &Config) -> Result<ExitCode> {
    let layout = config.layout();

    let mut rows = Vec::new();
    rows.extend(scan("staged", layout.staging_root())?);
    rows.extend(scan("queued", layout.queue_root())?);
    if args.all {
        rows.extend(scan("processed", layout.processed_root())?);
    }

    if rows.is_empty() {
        eprintln!("No studies.");
    } else {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new("Area").fg(Color::Cyan),
                Cell::new("Study").fg(Color::Cyan),
                Cell::new("Series").fg(Color::Cyan),
                Cell::new("Instances").fg(Color::Cyan),
                Cell::new("Content").fg(Color::Cyan),
            ]);

        for row in &rows {
            let area = match row.area {
                "staged" => Cell::new(row.area).fg(Color::Yellow),
                "queued" => Cell::new(row.area).fg(Color::Green),
                _ => Cell::new(row.area).fg(Color::DarkGrey),
            };
            table.add_row(vec![
                area,
                Cell::new(&row.key),
                Cell::new(row.series),
                Cell::new(row.instances),
                Cell::new(&row.hash),
            ]);
        }

        eprintln!("\n{table}");
        eprintln!("{} studies total", rows.len());
    }

    let failures = FailureLog::new(layout.failure_log()).read_all()?;
    if !failures.is_empty() {
        eprintln!(
            "{} failed migrations recorded in {}",
            failures.len(),
            layout.failure_log().display()
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn scan(area: &'static str, root: &Path) -> Result<Vec<StudyRow>> {
    let mut rows = Vec::new();
    for (key, path) in list_studies(root)? {
        let files = study_files(&path)?;
        let hash = match StudyManifest::read_from(&path) {
            Ok(m) => studyq_store::hash::short_hex(&m.content_hash).to_string(),
            Err(_) => "-".to_string(),
        };
        rows.push(StudyRow {
            area,
            key: key.to_string(),
            series: series_counts(&path, &files).len(),
            instances: files.len(),
            hash,
        });
    }
    Ok(rows)
}
