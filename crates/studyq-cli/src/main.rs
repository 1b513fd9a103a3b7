//! studyq - staging service for DICOM studies
//!
//! Watches the staging tree for studies that have gone quiet, migrates them
//! into the queue, and hands queued studies to the downstream processor.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "studyq")]
#[command(about = "Idle-timeout study completion and queueing for received DICOM objects")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "debug")]
    quiet: bool,

    /// Config file path (default: ./studyq.toml or ~/.config/studyq/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Storage root (overrides [paths] root)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Recover, then run the watchdog and drainer until interrupted
    Serve,
    /// Migrate every staged study now
    Flush,
    /// Run one drain pass over the queue
    Drain,
    /// Show staged, queued and processed studies
    Status(cmd::status::StatusArgs),
    /// Show current configuration
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    studyq_core::init_logging(cli.quiet, cli.debug);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = if let Some(path) = &cli.config {
        Config::from_file(path)?
    } else {
        Config::load()?
    };
    if let Some(root) = cli.root {
        config.paths.root = root;
    }

    match cli.command {
        Command::Serve => cmd::serve::run(&config),
        Command::Flush => cmd::flush::run(&config),
        Command::Drain => cmd::drain::run(&config),
        Command::Status(args) => cmd::status::run(args, &config),
        Command::Config => {
            show_config(&config);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn show_config(config: &Config) {
    use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

    let layout = config.layout();
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Setting").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);

    table.add_row(vec!["Staging", &layout.staging_root().display().to_string()]);
    table.add_row(vec!["Queue", &layout.queue_root().display().to_string()]);
    table.add_row(vec!["Processed", &layout.processed_root().display().to_string()]);
    table.add_row(vec!["Failure log", &layout.failure_log().display().to_string()]);
    table.add_row(vec![
        "Idle threshold",
        &format!("{}s", config.watchdog.idle_threshold_secs),
    ]);
    table.add_row(vec![
        "Watchdog interval",
        &format!("{}s", config.watchdog.interval_secs),
    ]);
    table.add_row(vec![
        "Migration attempts",
        &config.watchdog.max_attempts.to_string(),
    ]);
    table.add_row(vec!["Drain interval", &format!("{}s", config.drain.interval_secs)]);
    table.add_row(vec![
        "Processor",
        &match &config.drain.command {
            Some(argv) => argv.join(" "),
            None => "log (default)".to_string(),
        },
    ]);

    eprintln!("\n{table}");
}
