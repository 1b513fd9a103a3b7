//! End-to-end study lifecycle: ingest, idle detection, migration, drain
//!
//! Loop tests run on tokio's paused clock, so minutes of idle time pass instantly.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use studyq_core::Shutdown;
use studyq_store::activity::StudyStatus;
use studyq_store::migrator::Migrator;
use studyq_store::{
    ActivityTable, DrainConfig, IncomingObject, Layout, LogProcessor, QueueDrainer, QueuedStudy,
    ServiceConfig, StudyKey, StudyManifest, StudyProcessor, StudyService, Watchdog,
    WatchdogConfig,
};
use tempfile::TempDir;
use tokio::time::Instant;

fn object(subject: &str, accession: &str, series: u32, instance: &str) -> IncomingObject {
    IncomingObject::new(subject, accession, instance, instance.as_bytes().to_vec())
        .with_series(series, Some("AX T1"))
}

fn files_under(dir: &Path) -> Vec<String> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        if entry.file_type().unwrap().is_dir() {
            for file in files_under(&entry.path()) {
                out.push(format!("{}/{file}", entry.file_name().to_string_lossy()));
            }
        } else {
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    out.sort();
    out
}

#[tokio::test(start_paused = true)]
async fn study_migrates_after_idle_window() {
    let dir = TempDir::new().unwrap();
    let svc = StudyService::new(
        Layout::under(dir.path()),
        ServiceConfig::default(),
        Arc::new(LogProcessor),
    )
    .unwrap();
    let layout = svc.layout().clone();
    let key = StudyKey::new("P1", "A1");
    let start = Instant::now();

    let shutdown = Shutdown::new();
    let handle = svc.spawn(&shutdown).unwrap();
    let recorder = svc.recorder();

    // Three objects at t = 0, 5, 10
    assert!(recorder.record(&object("P1", "A1", 1, "1.1")).is_success());
    tokio::time::sleep_until(start + Duration::from_secs(5)).await;
    assert!(recorder.record(&object("P1", "A1", 1, "1.2")).is_success());
    tokio::time::sleep_until(start + Duration::from_secs(10)).await;
    assert!(recorder.record(&object("P1", "A1", 2, "2.1")).is_success());

    // Cycles at 60 and 120 see less than 120s of silence
    tokio::time::sleep_until(start + Duration::from_secs(129)).await;
    assert!(layout.staging_dir(&key).exists());
    assert!(!layout.queue_dir(&key).exists());
    assert_eq!(svc.table().get(&key).unwrap().objects, 3);

    // The cycle at 180 is the first at or after t = 130
    tokio::time::sleep_until(start + Duration::from_secs(181)).await;
    assert_eq!(
        files_under(&layout.queue_dir(&key)),
        vec!["01_AX T1/1.1.dcm", "01_AX T1/1.2.dcm", "02_AX T1/2.1.dcm"]
    );
    assert!(!layout.staging_subject_dir("P1").exists());
    assert!(svc.table().is_empty());

    shutdown.request();
    handle.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn steady_trickle_keeps_study_open() {
    let dir = TempDir::new().unwrap();
    let svc = StudyService::new(
        Layout::under(dir.path()),
        ServiceConfig::default(),
        Arc::new(LogProcessor),
    )
    .unwrap();
    let key = StudyKey::new("P1", "A1");
    let start = Instant::now();
    let shutdown = Shutdown::new();
    let handle = svc.spawn(&shutdown).unwrap();
    let recorder = svc.recorder();

    // One object every 100s for ten minutes never leaves 120s of silence
    for i in 0..6u64 {
        tokio::time::sleep_until(start + Duration::from_secs(i * 100)).await;
        recorder.record(&object("P1", "A1", 1, &format!("1.{i}")));
    }
    tokio::time::sleep_until(start + Duration::from_secs(590)).await;
    assert!(!svc.layout().queue_dir(&key).exists());
    assert_eq!(svc.table().get(&key).unwrap().objects, 6);

    shutdown.request();
    handle.join().await.unwrap();
}

#[test]
fn object_arriving_mid_migration_reopens_study() {
    let dir = TempDir::new().unwrap();
    let layout = Arc::new(Layout::under(dir.path()));
    layout.ensure_dirs().unwrap();
    let table = ActivityTable::new();
    let recorder = studyq_store::IngestRecorder::new(layout.clone(), table.clone());
    let key = StudyKey::new("P1", "A1");

    recorder.record(&object("P1", "A1", 1, "1.1"));
    let first_episode = table.get(&key).unwrap().episode;

    // Claim by hand so the migration can be paused halfway
    let later = Instant::now() + Duration::from_secs(200);
    let claims = table.claim_idle(later, Duration::from_secs(120), |k, e| layout.detach(k, e));
    assert_eq!(claims.len(), 1);
    assert_eq!(table.get(&key).unwrap().status, StudyStatus::Migrating);

    // A late object lands in a fresh tree, not in the detached one
    recorder.record(&object("P1", "A1", 1, "1.2"));
    let reopened = table.get(&key).unwrap();
    assert_eq!(reopened.status, StudyStatus::Receiving);
    assert!(reopened.episode > first_episode);
    assert!(layout.staging_dir(&key).join("01_AX T1/1.2.dcm").exists());
    assert!(!claims[0].source.join("01_AX T1/1.2.dcm").exists());

    Migrator::new(layout.clone())
        .migrate(&claims[0].key, &claims[0].source)
        .unwrap();
    // The old episode finishing does not drop the reopened one
    assert!(!table.finish(&key, claims[0].episode));
    assert!(table.get(&key).is_some());

    let watchdog = Watchdog::new(table.clone(), layout.clone(), WatchdogConfig::default());
    let report = watchdog.sweep(Instant::now() + Duration::from_secs(300));
    assert_eq!(report.migrated, vec![key.clone()]);
    assert_eq!(
        files_under(&layout.queue_dir(&key)),
        vec!["01_AX T1/1.1.dcm", "01_AX T1/1.2.dcm"]
    );
    assert!(table.is_empty());
    assert!(!layout.staging_subject_dir("P1").exists());
}

#[test]
fn sibling_accessions_do_not_interfere() {
    let dir = TempDir::new().unwrap();
    let layout = Arc::new(Layout::under(dir.path()));
    layout.ensure_dirs().unwrap();
    let table = ActivityTable::new();
    let recorder = studyq_store::IngestRecorder::new(layout.clone(), table.clone());
    let watchdog = Watchdog::new(table.clone(), layout.clone(), WatchdogConfig::default());

    recorder.record(&object("P1", "A1", 1, "1.1"));
    recorder.record(&object("P1", "A2", 1, "9.1"));
    let now = Instant::now();

    // Only A1 goes idle: refresh A2 just before the sweep
    let ticket = table.begin_write(&StudyKey::new("P1", "A2"), now + Duration::from_secs(100));
    table.complete_write(ticket, now + Duration::from_secs(100));

    let report = watchdog.sweep(now + Duration::from_secs(150));
    assert_eq!(report.migrated, vec![StudyKey::new("P1", "A1")]);
    assert!(layout.staging_dir(&StudyKey::new("P1", "A2")).join("01_AX T1/9.1.dcm").exists());
    assert!(layout.staging_subject_dir("P1").exists());
    assert!(!layout.queue_dir(&StudyKey::new("P1", "A2")).exists());
}

/// Fails studies whose accession is listed.
struct Picky {
    reject: &'static str,
    seen: Mutex<Vec<StudyKey>>,
}

impl StudyProcessor for Picky {
    fn name(&self) -> &str {
        "picky"
    }

    fn process(&self, study: &QueuedStudy) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(study.key.clone());
        anyhow::ensure!(study.key.accession() != self.reject, "rejected {}", study.key);
        Ok(())
    }
}

#[test]
fn flush_then_drain_archives_with_manifest() {
    let dir = TempDir::new().unwrap();
    let processor = Arc::new(Picky {
        reject: "B1",
        seen: Mutex::new(Vec::new()),
    });
    let svc = StudyService::new(
        Layout::under(dir.path()),
        ServiceConfig::default(),
        processor.clone(),
    )
    .unwrap();
    let recorder = svc.recorder();
    recorder.record(&object("P1", "A1", 1, "1.1"));
    recorder.record(&object("P1", "A1", 2, "2.1"));
    recorder.record(&object("P2", "B1", 1, "3.1"));

    assert_eq!(svc.flush().migrated.len(), 2);
    let report = svc.drainer().drain_once().unwrap();
    assert_eq!(report.drained, vec![StudyKey::new("P1", "A1")]);
    assert_eq!(report.failed, vec![StudyKey::new("P2", "B1")]);

    let archived = svc.layout().processed_dir(&StudyKey::new("P1", "A1"));
    let manifest = StudyManifest::read_from(&archived).unwrap();
    assert_eq!(manifest.instance_count(), 2);
    assert_eq!(manifest.series.len(), 2);
    assert_eq!(manifest.processor, "picky");
    assert!(!svc.layout().queue_subject_dir("P1").exists());

    // The rejected study waits in the queue for the next pass
    assert!(svc.layout().queue_dir(&StudyKey::new("P2", "B1")).exists());
    let again = svc.drainer().drain_once().unwrap();
    assert_eq!(again.failed, vec![StudyKey::new("P2", "B1")]);
    assert_eq!(processor.seen.lock().unwrap().len(), 3);
}

#[test]
fn restart_adopts_leftover_study() {
    let dir = TempDir::new().unwrap();
    {
        let svc = StudyService::new(
            Layout::under(dir.path()),
            ServiceConfig::default(),
            Arc::new(LogProcessor),
        )
        .unwrap();
        svc.recorder().record(&object("P1", "A1", 1, "1.1"));
    }

    let svc = StudyService::new(
        Layout::under(dir.path()),
        ServiceConfig::default(),
        Arc::new(LogProcessor),
    )
    .unwrap();
    assert!(svc.table().is_empty());
    let report = svc.recover().unwrap();
    assert_eq!(report.adopted, vec![StudyKey::new("P1", "A1")]);
    assert_eq!(svc.flush().migrated.len(), 1);

    let drainer = QueueDrainer::new(
        Arc::new(svc.layout().clone()),
        Arc::new(LogProcessor),
        DrainConfig::default(),
    );
    assert_eq!(drainer.drain_once().unwrap().drained.len(), 1);
}
