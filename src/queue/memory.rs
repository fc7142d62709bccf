use super::{QueueError, QueueState, QueueStore};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

/// Volatile store for tests and dry runs. Clones share the same backing
/// state, so a test can "restart" by opening a new queue on a clone.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<QueueState>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `persist` fail, simulating a full disk.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn persisted(&self) -> QueueState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl QueueStore for MemoryStore {
    fn load(&mut self) -> Result<QueueState, QueueError> {
        self.state
            .lock()
            .map(|s| s.clone())
            .map_err(|_| QueueError::Poisoned)
    }

    fn persist(&mut self, state: &QueueState) -> Result<(), QueueError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(QueueError::Io {
                path: "memory".into(),
                source: std::io::Error::other("simulated write failure"),
            });
        }
        let mut guard = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        *guard = state.clone();
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
