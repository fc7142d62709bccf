//! Local Durable Queue.
//!
//! An ordered list of reports awaiting delivery. Every mutation is persisted
//! through a [`QueueStore`] before the call returns; a failed write leaves
//! the persisted queue exactly as it was.
//!
//! No state is cached between operations. Each one takes the store's
//! exclusive lock, reloads the persisted state, and writes it back before
//! releasing, so several handles (or processes) on one file see each other's
//! appends and removals. Within a process, operations on one handle also
//! serialize on an internal mutex.
//!
//! Producers (the submission path) may append at any time. Peek and remove
//! belong to whoever holds the [`DrainLease`]; the lease is held for a whole
//! drain so no two drains share a head.

pub mod file;
pub mod memory;

use crate::{report::Report, util::now_rfc3339};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

pub use file::{FileLock, JsonFileStore};
pub use memory::MemoryStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Insertion sequence number; strictly increasing, never reused.
    pub seq: u64,
    pub enqueued_at: String,
    /// Diagnostics only; no back-off is derived from it.
    pub attempt_count: u32,
    pub report: Report,
}

/// The persisted shape of the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    pub next_seq: u64,
    pub entries: VecDeque<QueueEntry>,
}

impl QueueState {
    fn check(&self) -> Result<(), QueueError> {
        let mut prev: Option<u64> = None;
        for e in &self.entries {
            if prev.is_some_and(|p| e.seq <= p) {
                return Err(QueueError::Corruption(format!(
                    "entries out of order at seq {}",
                    e.seq
                )));
            }
            if e.seq >= self.next_seq {
                return Err(QueueError::Corruption(format!(
                    "entry seq {} not below next_seq {}",
                    e.seq, self.next_seq
                )));
            }
            prev = Some(e.seq);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding queue state: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decoding queue state at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("queue corruption: {0}")]
    Corruption(String),
    #[error("queue lock poisoned")]
    Poisoned,
    #[error("queue task failed: {0}")]
    Task(String),
}

/// Durable backing for a [`LocalQueue`]. Implementations must make
/// `persist` all-or-nothing.
pub trait QueueStore: Send {
    fn load(&mut self) -> Result<QueueState, QueueError>;
    fn persist(&mut self, state: &QueueState) -> Result<(), QueueError>;
    fn describe(&self) -> String;

    /// Exclusive access to the persisted state, held across one
    /// load/persist cycle. `None` when the store is private to one handle.
    fn exclusive(&self) -> Result<Option<FileLock>, QueueError> {
        Ok(None)
    }

    /// Lock file guarding the right to drain, if drains can come from
    /// other processes.
    fn drain_lock_path(&self) -> Option<PathBuf> {
        None
    }
}

/// Exclusive right to peek and remove. Released on drop.
pub struct DrainLease {
    _lock: Option<FileLock>,
}

pub struct LocalQueue {
    store: Mutex<Box<dyn QueueStore>>,
    drain_lock: Option<PathBuf>,
}

fn load_checked(store: &mut dyn QueueStore) -> Result<QueueState, QueueError> {
    let state = store.load()?;
    state.check()?;
    Ok(state)
}

impl LocalQueue {
    pub fn open(mut store: Box<dyn QueueStore>) -> Result<Self, QueueError> {
        let pending = {
            let _held = store.exclusive()?;
            load_checked(&mut *store)?.entries.len()
        };
        debug!(store = %store.describe(), pending, "queue opened");
        let drain_lock = store.drain_lock_path();
        Ok(Self {
            store: Mutex::new(store),
            drain_lock,
        })
    }

    fn store(&self) -> Result<MutexGuard<'_, Box<dyn QueueStore>>, QueueError> {
        self.store.lock().map_err(|_| QueueError::Poisoned)
    }

    fn read<T>(&self, f: impl FnOnce(&QueueState) -> T) -> Result<T, QueueError> {
        let mut store = self.store()?;
        let _held = store.exclusive()?;
        let state = load_checked(&mut **store)?;
        Ok(f(&state))
    }

    /// Reload under the lock, apply `f`, persist. Nothing is written when
    /// `f` fails.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut QueueState) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let mut store = self.store()?;
        let _held = store.exclusive()?;
        let mut state = load_checked(&mut **store)?;
        let out = f(&mut state)?;
        store.persist(&state)?;
        Ok(out)
    }

    /// Add to the tail. Durable once this returns `Ok`.
    pub fn append(&self, report: Report) -> Result<QueueEntry, QueueError> {
        let entry = self.update(|state| {
            let entry = QueueEntry {
                seq: state.next_seq,
                enqueued_at: now_rfc3339(),
                attempt_count: 0,
                report,
            };
            state.next_seq += 1;
            state.entries.push_back(entry.clone());
            Ok(entry)
        })?;
        debug!(seq = entry.seq, "queue append");
        Ok(entry)
    }

    pub fn peek_oldest(&self) -> Result<Option<QueueEntry>, QueueError> {
        self.read(|state| state.entries.front().cloned())
    }

    /// Remove the current head. An empty queue here means two consumers
    /// raced, which is reported as corruption.
    pub fn remove_oldest(&self) -> Result<QueueEntry, QueueError> {
        let removed = self.update(|state| {
            state.entries.pop_front().ok_or_else(|| {
                QueueError::Corruption("remove_oldest on an empty queue".to_string())
            })
        })?;
        debug!(seq = removed.seq, "queue remove");
        Ok(removed)
    }

    /// Bump the diagnostic attempt counter of the entry with `seq`, if it is
    /// still queued.
    pub fn record_attempt(&self, seq: u64) -> Result<(), QueueError> {
        let mut store = self.store()?;
        let _held = store.exclusive()?;
        let mut state = load_checked(&mut **store)?;
        let Some(entry) = state.entries.iter_mut().find(|e| e.seq == seq) else {
            return Ok(());
        };
        entry.attempt_count = entry.attempt_count.saturating_add(1);
        store.persist(&state)
    }

    /// Point-in-time copy for display. Never drive delivery from this.
    pub fn snapshot_all(&self) -> Result<Vec<QueueEntry>, QueueError> {
        self.read(|state| state.entries.iter().cloned().collect())
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        self.read(|state| state.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// Block until no other drain holds the lease.
    pub fn lease_drain(&self) -> Result<DrainLease, QueueError> {
        let lock = match &self.drain_lock {
            Some(path) => Some(file::lock_exclusive_at(path)?),
            None => None,
        };
        Ok(DrainLease { _lock: lock })
    }
}

/// Run a blocking queue operation on tokio's blocking pool.
pub async fn off_runtime<T, F>(queue: &Arc<LocalQueue>, op: F) -> Result<T, QueueError>
where
    F: FnOnce(&LocalQueue) -> Result<T, QueueError> + Send + 'static,
    T: Send + 'static,
{
    let queue = queue.clone();
    tokio::task::spawn_blocking(move || op(&queue))
        .await
        .map_err(|e| QueueError::Task(e.to_string()))?
}
