//! File-backed job store.
//!
//! The whole state is small (one record per busy volume), so each mutation
//! rewrites the store file: encode, write a sibling temp file, fsync, rename.
//! The in-memory state only advances after the file has been replaced.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::types::{now_us, LockEntry, ReplicationJob, SyncJob};

/// On-disk format version.
const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreState {
    version: u32,
    next_seq: u64,
    locks: BTreeMap<String, LockEntry>,
    sync_jobs: BTreeMap<String, SyncJob>,
    replication: BTreeMap<String, ReplicationJob>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            version: STORE_VERSION,
            next_seq: 1,
            locks: BTreeMap::new(),
            sync_jobs: BTreeMap::new(),
            replication: BTreeMap::new(),
        }
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Durable store for volume locks and the two job queues.
pub struct JobStore {
    state: Mutex<StoreState>,
    path: Option<PathBuf>,
}

impl JobStore {
    /// Opens the store at `path`, creating an empty one if the file is absent.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) => {
                let state: StoreState =
                    bincode::deserialize(&bytes).map_err(|source| StoreError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                if state.version != STORE_VERSION {
                    return Err(StoreError::Version {
                        found: state.version,
                        expected: STORE_VERSION,
                    });
                }
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let state = StoreState::new();
                persist(&path, &state)?;
                info!(path = %path.display(), "created job store");
                state
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        debug!(
            path = %path.display(),
            locks = state.locks.len(),
            sync_jobs = state.sync_jobs.len(),
            replication_jobs = state.replication.len(),
            "opened job store"
        );

        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    /// Creates a store that is never written to disk. Used by tests.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::new()),
            path: None,
        }
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut StoreState) -> StoreResult<R>) -> StoreResult<R> {
        let mut guard = self.state.lock();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        if let Some(path) = &self.path {
            persist(path, &next)?;
        }
        *guard = next;
        Ok(out)
    }

    // ---- locks ----

    /// Takes the lock for `volume`, failing with `VolumeBusy` if it is held.
    pub fn acquire(&self, volume: &str, requester: &str) -> StoreResult<LockEntry> {
        self.mutate(|state| {
            if let Some(held) = state.locks.get(volume) {
                return Err(StoreError::VolumeBusy {
                    volume: volume.to_string(),
                    holder: held.requester.clone(),
                });
            }
            let entry = LockEntry {
                volume: volume.to_string(),
                requester: requester.to_string(),
                acquired_at_us: now_us(),
            };
            state.locks.insert(volume.to_string(), entry.clone());
            Ok(entry)
        })
    }

    /// Drops the lock for `volume`. Returns false if none was held.
    pub fn release(&self, volume: &str) -> StoreResult<bool> {
        if !self.state.lock().locks.contains_key(volume) {
            return Ok(false);
        }
        self.mutate(|state| Ok(state.locks.remove(volume).is_some()))
    }

    /// Current holder of the lock for `volume`.
    pub fn lock_holder(&self, volume: &str) -> Option<LockEntry> {
        self.state.lock().locks.get(volume).cloned()
    }

    /// All held locks, ordered by volume name.
    pub fn locks(&self) -> Vec<LockEntry> {
        self.state.lock().locks.values().cloned().collect()
    }

    /// Releases every lock whose volume has no pending sync job.
    ///
    /// Such locks belong to in-handler operations that cannot outlive the
    /// process that started them.
    pub fn release_orphaned_locks(&self) -> StoreResult<Vec<LockEntry>> {
        let orphaned: Vec<LockEntry> = {
            let state = self.state.lock();
            state
                .locks
                .values()
                .filter(|l| !state.sync_jobs.contains_key(&l.volume))
                .cloned()
                .collect()
        };
        if orphaned.is_empty() {
            return Ok(orphaned);
        }
        self.mutate(|state| {
            for lock in &orphaned {
                state.locks.remove(&lock.volume);
            }
            Ok(())
        })?;
        Ok(orphaned)
    }

    // ---- sync queue ----

    /// Queues a merge-back job. At most one job per volume and per target.
    pub fn enqueue_sync(&self, mut job: SyncJob) -> StoreResult<SyncJob> {
        self.mutate(|state| {
            if state.sync_jobs.contains_key(&job.volume) {
                return Err(StoreError::SyncPending { volume: job.volume });
            }
            if let Some(other) = state.sync_jobs.values().find(|j| j.target == job.target) {
                return Err(StoreError::TargetPending {
                    target: job.target,
                    volume: other.volume.clone(),
                });
            }
            job.seq = state.take_seq();
            state.sync_jobs.insert(job.volume.clone(), job.clone());
            Ok(job)
        })
    }

    /// Oldest pending sync job, left in the queue until [`Self::delete_sync`].
    pub fn peek_oldest_sync(&self) -> Option<SyncJob> {
        self.state
            .lock()
            .sync_jobs
            .values()
            .min_by_key(|j| j.queue_key())
            .cloned()
    }

    /// Records that the overlay for `volume` is now merging.
    pub fn mark_started(&self, volume: &str) -> StoreResult<()> {
        self.mutate(|state| match state.sync_jobs.get_mut(volume) {
            Some(job) => {
                job.started = true;
                Ok(())
            }
            None => Err(StoreError::NoSyncJob {
                volume: volume.to_string(),
            }),
        })
    }

    /// Removes the sync job for `volume`. Returns false if none was queued.
    pub fn delete_sync(&self, volume: &str) -> StoreResult<bool> {
        if !self.state.lock().sync_jobs.contains_key(volume) {
            return Ok(false);
        }
        self.mutate(|state| Ok(state.sync_jobs.remove(volume).is_some()))
    }

    /// Sync job queued for `volume`.
    pub fn sync_job(&self, volume: &str) -> Option<SyncJob> {
        self.state.lock().sync_jobs.get(volume).cloned()
    }

    /// All pending sync jobs, oldest first.
    pub fn sync_jobs(&self) -> Vec<SyncJob> {
        let mut jobs: Vec<SyncJob> = self.state.lock().sync_jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.queue_key());
        jobs
    }

    /// True if any sync job is pending.
    pub fn has_sync_jobs(&self) -> bool {
        !self.state.lock().sync_jobs.is_empty()
    }

    // ---- replication queue ----

    /// Queues a cross-node transfer. At most one job per volume.
    pub fn enqueue_replication(&self, mut job: ReplicationJob) -> StoreResult<ReplicationJob> {
        self.mutate(|state| {
            if state.replication.contains_key(&job.volume) {
                return Err(StoreError::ReplicationPending { volume: job.volume });
            }
            job.seq = state.take_seq();
            state.replication.insert(job.volume.clone(), job.clone());
            Ok(job)
        })
    }

    /// Oldest pending replication job, left in the queue until deleted.
    pub fn peek_oldest_replication(&self) -> Option<ReplicationJob> {
        self.state
            .lock()
            .replication
            .values()
            .min_by_key(|j| j.queue_key())
            .cloned()
    }

    /// Removes the replication job for `volume`.
    pub fn delete_replication(&self, volume: &str) -> StoreResult<bool> {
        if !self.state.lock().replication.contains_key(volume) {
            return Ok(false);
        }
        self.mutate(|state| Ok(state.replication.remove(volume).is_some()))
    }

    /// All pending replication jobs, oldest first.
    pub fn replication_jobs(&self) -> Vec<ReplicationJob> {
        let mut jobs: Vec<ReplicationJob> =
            self.state.lock().replication.values().cloned().collect();
        jobs.sort_by_key(|j| j.queue_key());
        jobs
    }

    /// True if any replication job is pending.
    pub fn has_replication_jobs(&self) -> bool {
        !self.state.lock().replication.is_empty()
    }
}

fn persist(path: &Path, state: &StoreState) -> StoreResult<()> {
    let bytes = bincode::serialize(state)?;
    let io = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io)?;
        }
    }

    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp).map_err(io)?;
    file.write_all(&bytes).map_err(io)?;
    file.sync_all().map_err(io)?;
    fs::rename(&tmp, path).map_err(io)?;
    Ok(())
}
