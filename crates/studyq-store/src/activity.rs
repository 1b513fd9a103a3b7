//! Activity table: last-activity bookkeeping per study
//!
//! The only mutable state shared between the ingest path and the watchdog.
//! One coarse mutex guards the whole map; the number of studies in flight at
//! any time is small.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::key::StudyKey;

/// Where a study is in its receive → migrate lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudyStatus {
    Receiving,
    Migrating,
}

/// Bookkeeping for one study.
#[derive(Debug, Clone)]
pub struct ActivityEntry {
    pub key: StudyKey,
    /// Last time an object for this study finished landing on disk.
    pub last_activity: Instant,
    pub status: StudyStatus,
    /// Receiving episode; bumps whenever the study reopens after a claim.
    pub episode: u64,
    /// Writes reserved but not yet completed or aborted.
    pub in_flight: usize,
    /// Objects landed during the current episode.
    pub objects: u64,
}

impl ActivityEntry {
    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

/// How a write reservation found the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opened {
    /// Joined an episode already receiving.
    Existing,
    /// First object for an absent key.
    New,
    /// Key was mid-migration; a new episode was started.
    Reopened,
}

/// Reservation for one object write. Hand back via
/// [`ActivityTable::complete_write`] or [`ActivityTable::abort_write`].
#[derive(Debug)]
#[must_use = "a write ticket must be completed or aborted"]
pub struct WriteTicket {
    key: StudyKey,
    episode: u64,
    opened: Opened,
}

impl WriteTicket {
    pub fn episode(&self) -> u64 {
        self.episode
    }
}

/// A study taken out of the receiving set, with its detached tree.
#[derive(Debug, Clone)]
pub struct Claim {
    pub key: StudyKey,
    pub episode: u64,
    pub objects: u64,
    pub idle_for: Duration,
    pub source: PathBuf,
}

#[derive(Debug)]
struct TableState {
    entries: FxHashMap<StudyKey, ActivityEntry>,
    next_episode: u64,
}

impl TableState {
    fn bump_episode(&mut self) -> u64 {
        self.next_episode += 1;
        self.next_episode
    }
}

/// Shared, cloneable handle to the activity map.
#[derive(Debug, Clone)]
pub struct ActivityTable {
    state: Arc<Mutex<TableState>>,
}

impl Default for ActivityTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTable {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TableState {
                entries: FxHashMap::default(),
                next_episode: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        // Entries stay consistent across a panicking holder: every mutation
        // is a handful of field writes.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a write for `key`.
    ///
    /// Absent keys get a fresh Receiving entry. A key that is Migrating is
    /// reopened under a new episode: its old tree has already been detached,
    /// so the write lands in a fresh staging tree.
    pub fn begin_write(&self, key: &StudyKey, now: Instant) -> WriteTicket {
        let mut state = self.lock();
        let state = &mut *state;

        let (episode, opened) = match state.entries.get_mut(key) {
            Some(entry) if entry.status == StudyStatus::Receiving => {
                entry.in_flight += 1;
                (entry.episode, Opened::Existing)
            }
            Some(entry) => {
                let previous = entry.episode;
                state.next_episode += 1;
                entry.episode = state.next_episode;
                entry.status = StudyStatus::Receiving;
                entry.last_activity = entry.last_activity.max(now);
                entry.in_flight = 1;
                entry.objects = 0;
                log::info!(
                    "{key}: object arrived during migration of episode {previous}, \
                     reopening as episode {}",
                    entry.episode
                );
                (entry.episode, Opened::Reopened)
            }
            None => {
                let episode = state.bump_episode();
                state.entries.insert(
                    key.clone(),
                    ActivityEntry {
                        key: key.clone(),
                        last_activity: now,
                        status: StudyStatus::Receiving,
                        episode,
                        in_flight: 1,
                        objects: 0,
                    },
                );
                log::debug!("{key}: new episode {episode}");
                (episode, Opened::New)
            }
        };

        WriteTicket {
            key: key.clone(),
            episode,
            opened,
        }
    }

    /// Record a landed object: stamps the entry with `now`.
    pub fn complete_write(&self, ticket: WriteTicket, now: Instant) {
        let mut state = self.lock();
        match state.entries.get_mut(&ticket.key) {
            Some(entry) if entry.episode == ticket.episode => {
                entry.in_flight = entry.in_flight.saturating_sub(1);
                entry.objects += 1;
                entry.last_activity = entry.last_activity.max(now);
            }
            // Claims skip entries with writes in flight, so the episode
            // cannot change under a reservation.
            _ => log::warn!(
                "{}: completed write for unknown episode {}",
                ticket.key,
                ticket.episode
            ),
        }
    }

    /// Undo a reservation whose write failed.
    ///
    /// An episode opened by this reservation that ends up with no landed
    /// objects and no other writes is removed, so a rejected object leaves no
    /// trace in the table.
    pub fn abort_write(&self, ticket: WriteTicket) {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(&ticket.key) else {
            return;
        };
        if entry.episode != ticket.episode {
            return;
        }
        entry.in_flight = entry.in_flight.saturating_sub(1);
        if ticket.opened != Opened::Existing && entry.in_flight == 0 && entry.objects == 0 {
            log::debug!(
                "{}: dropping empty episode {} after failed write ({:?})",
                ticket.key,
                ticket.episode,
                ticket.opened
            );
            state.entries.remove(&ticket.key);
        }
    }

    /// Claim every study idle for at least `threshold`.
    ///
    /// Runs `detach` for each candidate while still holding the lock, so no
    /// write can slip into the tree between the idle check and the detach.
    /// Entries with writes in flight are never claimed. A candidate whose
    /// staging tree is gone is dropped; other detach failures leave it
    /// Receiving for the next cycle.
    pub fn claim_idle<F>(&self, now: Instant, threshold: Duration, mut detach: F) -> Vec<Claim>
    where
        F: FnMut(&StudyKey, u64) -> io::Result<PathBuf>,
    {
        let mut state = self.lock();
        let mut candidates: Vec<StudyKey> = state
            .entries
            .values()
            .filter(|e| {
                e.status == StudyStatus::Receiving
                    && e.in_flight == 0
                    && e.idle_for(now) >= threshold
            })
            .map(|e| e.key.clone())
            .collect();
        candidates.sort();

        let mut claims = Vec::with_capacity(candidates.len());
        for key in candidates {
            let Some(entry) = state.entries.get_mut(&key) else {
                continue;
            };
            match detach(&key, entry.episode) {
                Ok(source) => {
                    entry.status = StudyStatus::Migrating;
                    claims.push(Claim {
                        key: key.clone(),
                        episode: entry.episode,
                        objects: entry.objects,
                        idle_for: entry.idle_for(now),
                        source,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    log::warn!("{key}: staging tree vanished, dropping entry");
                    state.entries.remove(&key);
                }
                Err(e) => {
                    log::warn!("{key}: cannot detach for migration, will retry: {e}");
                }
            }
        }
        claims
    }

    /// Remove the entry for `key` if it is still the migrating `episode`.
    ///
    /// Returns false when the study was reopened meanwhile (the newer episode
    /// stays) or is already gone.
    pub fn finish(&self, key: &StudyKey, episode: u64) -> bool {
        let mut state = self.lock();
        match state.entries.get(key) {
            Some(e) if e.episode == episode && e.status == StudyStatus::Migrating => {
                state.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Insert a Receiving entry for a study found on disk. No-op if present.
    pub fn adopt(&self, key: &StudyKey, now: Instant) -> bool {
        let mut state = self.lock();
        if state.entries.contains_key(key) {
            return false;
        }
        let episode = state.bump_episode();
        state.entries.insert(
            key.clone(),
            ActivityEntry {
                key: key.clone(),
                last_activity: now,
                status: StudyStatus::Receiving,
                episode,
                in_flight: 0,
                objects: 0,
            },
        );
        true
    }

    /// Keep future episode numbers above one seen on disk.
    pub fn observe_episode(&self, episode: u64) {
        let mut state = self.lock();
        state.next_episode = state.next_episode.max(episode);
    }

    /// Remove an empty subject directory unless a study of that subject is
    /// still tracked.
    ///
    /// Runs under the table lock so a recorder cannot be creating a sibling
    /// study at the same time. "Not empty" and "not found" are expected.
    pub fn prune_subject(&self, subject: &str, dir: &Path) -> bool {
        let state = self.lock();
        if state.entries.keys().any(|k| k.subject() == subject) {
            return false;
        }
        crate::migrator::prune_empty_dir(dir)
    }

    pub fn get(&self, key: &StudyKey) -> Option<ActivityEntry> {
        self.lock().entries.get(key).cloned()
    }

    /// Copy of all entries, sorted by key.
    pub fn snapshot(&self) -> Vec<ActivityEntry> {
        let mut entries: Vec<_> = self.lock().entries.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
