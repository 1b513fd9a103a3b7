//! Logging setup on top of env_logger

use std::io::{IsTerminal, Write};

/// ANSI color code and padded label for a log level.
fn level_style(level: log::Level, color: bool) -> (&'static str, &'static str, &'static str) {
    let label = match level {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN ",
        log::Level::Info => "INFO ",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    };
    if !color {
        return ("", label, "");
    }
    let ansi = match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[32m",
        log::Level::Debug => "\x1b[36m",
        log::Level::Trace => "\x1b[35m",
    };
    (ansi, label, "\x1b[0m")
}

/// Default filter derived from the `--quiet` / `--debug` flags.
pub fn default_level(quiet: bool, debug: bool) -> &'static str {
    if debug {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    }
}

/// Initialize logging. `RUST_LOG` takes precedence over the flag-derived level.
///
/// TTY: colored labels with millisecond timestamps.
/// Non-TTY: plain `[LEVEL] message` lines for log aggregation.
pub fn init_logging(quiet: bool, debug: bool) {
    let env = env_logger::Env::default().default_filter_or(default_level(quiet, debug));
    let mut builder = env_logger::Builder::from_env(env);

    if std::io::stderr().is_terminal() {
        builder.format(|buf, record| {
            let (pre, label, post) = level_style(record.level(), true);
            writeln!(
                buf,
                "{} [{pre}{label}{post}] {}",
                buf.timestamp_millis(),
                record.args()
            )
        });
    } else {
        builder.format(|buf, record| {
            let (_, label, _) = level_style(record.level(), false);
            writeln!(buf, "[{label}] {}", record.args())
        });
    }

    // A second init (e.g. from tests) is harmless
    let _ = builder.try_init();
}
