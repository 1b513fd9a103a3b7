//! Ingest recorder: lands one received object in staging

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::Instant;

use crate::activity::ActivityTable;
use crate::key::{StudyKey, instance_file_name};
use crate::layout::Layout;

/// Status returned to the receiver for a store request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Success,
    /// The object could not be written (permissions, full disk, ...).
    OutOfResources,
}

impl StoreStatus {
    /// Wire status code.
    pub const fn code(self) -> u16 {
        match self {
            Self::Success => 0x0000,
            Self::OutOfResources => 0xC001,
        }
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success (0x{:04X})", self.code()),
            Self::OutOfResources => write!(f, "out of resources (0x{:04X})", self.code()),
        }
    }
}

/// Transport-level details of how an object arrived. Logged only.
#[derive(Debug, Clone)]
pub struct ArrivalInfo {
    pub calling_ae: Option<String>,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

impl Default for ArrivalInfo {
    fn default() -> Self {
        Self {
            calling_ae: None,
            received_at: chrono::Utc::now(),
        }
    }
}

/// One object handed over by the receiver.
#[derive(Debug, Clone)]
pub struct IncomingObject {
    pub subject_id: String,
    pub accession_id: String,
    pub series_number: Option<u32>,
    pub series_description: Option<String>,
    pub instance_id: String,
    pub bytes: Vec<u8>,
    pub arrival: ArrivalInfo,
}

impl IncomingObject {
    pub fn new(subject_id: &str, accession_id: &str, instance_id: &str, bytes: Vec<u8>) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            accession_id: accession_id.to_string(),
            series_number: None,
            series_description: None,
            instance_id: instance_id.to_string(),
            bytes,
            arrival: ArrivalInfo::default(),
        }
    }

    pub fn with_series(mut self, number: u32, description: Option<&str>) -> Self {
        self.series_number = Some(number);
        self.series_description = description.map(str::to_string);
        self
    }

    pub fn with_arrival(mut self, arrival: ArrivalInfo) -> Self {
        self.arrival = arrival;
        self
    }

    pub fn study_key(&self) -> StudyKey {
        StudyKey::new(&self.subject_id, &self.accession_id)
    }
}

/// Writes objects into staging and stamps the activity table.
///
/// Cheap to clone; hand one to each receiver worker.
#[derive(Debug, Clone)]
pub struct IngestRecorder {
    layout: Arc<Layout>,
    table: ActivityTable,
}

impl IngestRecorder {
    pub fn new(layout: Arc<Layout>, table: ActivityTable) -> Self {
        Self { layout, table }
    }

    /// Store one object.
    ///
    /// The table entry is reserved before the write and stamped only after
    /// the file is in place, so the watchdog never claims a study with a
    /// write in progress. A failed write is rolled back and reported as
    /// [`StoreStatus::OutOfResources`].
    pub fn record(&self, object: &IncomingObject) -> StoreStatus {
        let key = object.study_key();
        let ticket = self.table.begin_write(&key, Instant::now());

        match self.write_object(&key, object) {
            Ok(path) => {
                self.table.complete_write(ticket, Instant::now());
                log::debug!(
                    "{key}: stored {} ({} bytes, from {})",
                    path.display(),
                    object.bytes.len(),
                    object.arrival.calling_ae.as_deref().unwrap_or("unknown")
                );
                StoreStatus::Success
            }
            Err(e) => {
                self.table.abort_write(ticket);
                log::error!("{key}: rejected instance {}: {e:#}", object.instance_id);
                StoreStatus::OutOfResources
            }
        }
    }

    /// Verification request; answers as long as the service is up.
    pub fn verify(&self) -> StoreStatus {
        StoreStatus::Success
    }

    fn write_object(&self, key: &StudyKey, object: &IncomingObject) -> Result<PathBuf> {
        let dir = self.layout.series_dir(
            key,
            object.series_number,
            object.series_description.as_deref(),
        );
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let path = dir.join(instance_file_name(&object.instance_id));

        // Write beside the target and rename so a half-written instance is
        // never visible under its final name; re-ingest overwrites.
        let mut tmp = tempfile::Builder::new()
            .prefix(".incoming")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        tmp.write_all(&object.bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tmp.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("failed to persist {}", path.display()))?;
        Ok(path)
    }
}
