//! Configuration loading from TOML files

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use studyq_core::RetryPolicy;
use studyq_store::{
    CommandProcessor, DrainConfig, Layout, LogProcessor, ServiceConfig, StudyProcessor,
    WatchdogConfig,
};

/// Global configuration for studyq
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub watchdog: WatchdogSection,
    pub drain: DrainSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub root: PathBuf,
    pub staging: Option<PathBuf>,
    pub queue: Option<PathBuf>,
    pub processed: Option<PathBuf>,
    pub failure_log: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./dcmstore"),
            staging: None,
            queue: None,
            processed: None,
            failure_log: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WatchdogSection {
    pub idle_threshold_secs: u64,
    pub interval_secs: u64,
    pub max_attempts: u32,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            idle_threshold_secs: 120,
            interval_secs: 60,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DrainSection {
    pub interval_secs: u64,
    /// Program and arguments run per study; the study path is appended.
    pub command: Option<Vec<String>>,
}

impl Default for DrainSection {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            command: None,
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./studyq.toml (current directory)
    /// 2. ~/.config/studyq/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("studyq.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "studyq") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Resolved directory layout; explicit paths override the root defaults.
    pub fn layout(&self) -> Layout {
        let base = Layout::under(&self.paths.root);
        let pick = |explicit: &Option<PathBuf>, default: &Path| {
            explicit.clone().unwrap_or_else(|| default.to_path_buf())
        };
        Layout::new(
            pick(&self.paths.staging, base.staging_root()),
            pick(&self.paths.queue, base.queue_root()),
            pick(&self.paths.processed, base.processed_root()),
            pick(&self.paths.failure_log, base.failure_log()),
        )
    }

    pub fn service(&self) -> ServiceConfig {
        ServiceConfig {
            watchdog: WatchdogConfig {
                idle_threshold: Duration::from_secs(self.watchdog.idle_threshold_secs),
                interval: Duration::from_secs(self.watchdog.interval_secs),
                retry: RetryPolicy::new(self.watchdog.max_attempts),
            },
            drain: DrainConfig {
                interval: Duration::from_secs(self.drain.interval_secs),
            },
        }
    }

    /// Downstream processor: the configured command, or the logging default.
    pub fn processor(&self) -> Result<Arc<dyn StudyProcessor>> {
        match &self.drain.command {
            Some(argv) => Ok(Arc::new(CommandProcessor::from_argv(argv)?)),
            None => Ok(Arc::new(LogProcessor)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.paths.root, PathBuf::from("./dcmstore"));
        assert_eq!(config.watchdog.idle_threshold_secs, 120);
        assert_eq!(config.watchdog.interval_secs, 60);
        assert_eq!(config.drain.interval_secs, 300);
        assert!(config.drain.command.is_none());
    }

    #[test]
    fn parse_config_toml() {
        let toml = r#"
[paths]
root = "/srv/dicom"
queue = "/mnt/queue"

[watchdog]
idle_threshold_secs = 30
interval_secs = 20

[drain]
command = ["dcm2niix", "-z", "y"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.watchdog.idle_threshold_secs, 30);
        assert_eq!(config.watchdog.max_attempts, 3);
        assert_eq!(config.drain.interval_secs, 300);

        let layout = config.layout();
        assert_eq!(layout.staging_root(), Path::new("/srv/dicom/received"));
        assert_eq!(layout.queue_root(), Path::new("/mnt/queue"));
        assert_eq!(layout.failure_log(), Path::new("/srv/dicom/failed-migrations.jsonl"));

        let service = config.service();
        assert_eq!(service.watchdog.interval, Duration::from_secs(20));
        assert_eq!(service.watchdog.retry.max_attempts, 3);
        assert_eq!(config.processor().unwrap().name(), "dcm2niix");
    }

    #[test]
    fn empty_command_rejected() {
        let config: Config = toml::from_str("[drain]\ncommand = []\n").unwrap();
        assert!(config.processor().is_err());
    }

    #[test]
    fn from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("studyq.toml");
        std::fs::write(&path, "[watchdog]\nidle_threshold_secs = \"soon\"\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("studyq.toml"));
    }
}
