//! studyq-store: idle-timeout study completion and staged directory migration
//!
//! Objects land in a staging tree keyed by subject and accession. A study that
//! has been silent for the idle threshold is detached, migrated into the queue
//! root (merging with earlier episodes), and later handed to a downstream
//! processor and archived with a blake3 manifest.

pub mod activity;
pub mod drainer;
pub mod failure_log;
pub mod hash;
pub mod key;
pub mod layout;
pub mod manifest;
pub mod merge;
pub mod migrator;
pub mod recorder;
pub mod recovery;
pub mod service;
pub mod watchdog;

pub use activity::{ActivityEntry, ActivityTable, StudyStatus};
pub use drainer::{
    CommandProcessor, DrainConfig, DrainReport, LogProcessor, QueueDrainer, QueuedStudy,
    StudyProcessor,
};
pub use failure_log::{FailureLog, FailureRecord};
pub use key::StudyKey;
pub use layout::Layout;
pub use manifest::StudyManifest;
pub use migrator::QueueLock;
pub use merge::{MergeStats, MoveOutcome, Transfer, merge_tree, move_tree};
pub use recorder::{ArrivalInfo, IncomingObject, IngestRecorder, StoreStatus};
pub use recovery::RecoveryReport;
pub use service::{ServiceConfig, ServiceHandle, StudyService};
pub use watchdog::{SweepReport, Watchdog, WatchdogConfig};
