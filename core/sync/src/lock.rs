//! Per-collection write locks with a debounced release.
//!
//! A write takes the lock on its collection for as long as it runs and
//! for `syncDebounceMs` after the last queued write finishes. Writes on one
//! collection run their backend loops one at a time. Reads and stream
//! commits wait for the release so a backend response can never overwrite
//! a newer optimistic write.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use lodestar_common::ModulePath;

struct LockEntry {
    released: watch::Sender<bool>,
    /// Held by the write whose backend loop is running.
    turn: Arc<AsyncMutex<()>>,
    /// Writes currently holding a guard, running or queued.
    writers: usize,
    /// Pending debounced release.
    timer: Option<JoinHandle<()>>,
    /// Bumped on every acquire so a stale timer never releases a newer hold.
    epoch: u64,
}

/// Write locks keyed by collection path. Cheap to clone.
#[derive(Clone, Default)]
pub struct WriteLockManager {
    locks: Arc<Mutex<HashMap<ModulePath, LockEntry>>>,
}

/// Held by a running write; dropping it schedules the debounced release.
pub struct WriteLockGuard {
    manager: WriteLockManager,
    collection: ModulePath,
    debounce: Duration,
    turn: Arc<AsyncMutex<()>>,
    exclusive: Option<OwnedMutexGuard<()>>,
}

impl WriteLockGuard {
    /// Collection this guard locks.
    pub fn collection(&self) -> &ModulePath {
        &self.collection
    }

    /// Whether this guard also holds the collection's write turn.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive.is_some()
    }
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        // Hand the turn to the next queued write before counting down.
        self.exclusive.take();
        self.manager.schedule_release(&self.collection, self.debounce);
    }
}

impl WriteLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `collection`, or extend an existing lock.
    pub fn acquire_or_extend(&self, collection: &ModulePath, debounce: Duration) -> WriteLockGuard {
        let mut locks = self.locks.lock();
        let entry = locks.entry(collection.clone()).or_insert_with(|| {
            debug!("Write lock taken on {}", collection);
            let (released, _) = watch::channel(false);
            LockEntry {
                released,
                turn: Arc::new(AsyncMutex::new(())),
                writers: 0,
                timer: None,
                epoch: 0,
            }
        });
        entry.writers += 1;
        entry.epoch += 1;
        if let Some(timer) = entry.timer.take() {
            trace!("Write lock on {} extended", collection);
            timer.abort();
        }

        WriteLockGuard {
            manager: self.clone(),
            collection: collection.clone(),
            debounce,
            turn: entry.turn.clone(),
            exclusive: None,
        }
    }

    /// Lock `collection` like [`acquire_or_extend`](Self::acquire_or_extend),
    /// then wait until no other write on it is running.
    ///
    /// Queued writes keep the lock held and are served in arrival order.
    pub async fn acquire_exclusive(&self, collection: &ModulePath, debounce: Duration) -> WriteLockGuard {
        let mut guard = self.acquire_or_extend(collection, debounce);
        trace!("Waiting for write turn on {}", collection);
        guard.exclusive = Some(guard.turn.clone().lock_owned().await);
        guard
    }

    /// Called when a write finishes. Starts the debounce once no writer
    /// remains.
    fn schedule_release(&self, collection: &ModulePath, debounce: Duration) {
        let mut locks = self.locks.lock();
        let Some(entry) = locks.get_mut(collection) else {
            return;
        };
        entry.writers = entry.writers.saturating_sub(1);
        if entry.writers > 0 {
            return;
        }

        let epoch = entry.epoch;
        match Handle::try_current() {
            Ok(handle) if !debounce.is_zero() => {
                let manager = self.clone();
                let key = collection.clone();
                entry.timer = Some(handle.spawn(async move {
                    tokio::time::sleep(debounce).await;
                    manager.fire(&key, epoch);
                }));
            }
            _ => {
                if let Some(entry) = locks.remove(collection) {
                    entry.released.send_replace(true);
                    debug!("Write lock released on {}", collection);
                }
            }
        }
    }

    fn fire(&self, collection: &ModulePath, epoch: u64) {
        let mut locks = self.locks.lock();
        let current = matches!(
            locks.get(collection),
            Some(entry) if entry.epoch == epoch && entry.writers == 0
        );
        if !current {
            return;
        }
        if let Some(entry) = locks.remove(collection) {
            entry.released.send_replace(true);
            debug!("Write lock released on {}", collection);
        }
    }

    /// Whether `collection` is held by a write or its debounce.
    pub fn is_locked(&self, collection: &ModulePath) -> bool {
        self.locks.lock().contains_key(collection)
    }

    /// Every locked collection, sorted.
    pub fn locked_paths(&self) -> Vec<ModulePath> {
        let mut paths: Vec<ModulePath> = self.locks.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Wait until `collection` is not write-locked.
    pub async fn await_if_locked(&self, collection: &ModulePath) {
        let receiver = {
            let locks = self.locks.lock();
            match locks.get(collection) {
                Some(entry) => entry.released.subscribe(),
                None => return,
            }
        };
        trace!("Waiting for write lock on {}", collection);
        wait_released(receiver).await;
    }

    /// Wait until neither `collection` nor anything nested under it is
    /// write-locked.
    pub async fn await_all_under(&self, collection: &ModulePath) {
        loop {
            let receivers: Vec<watch::Receiver<bool>> = {
                let locks = self.locks.lock();
                locks
                    .iter()
                    .filter(|(path, _)| collection.contains(path))
                    .map(|(_, entry)| entry.released.subscribe())
                    .collect()
            };
            if receivers.is_empty() {
                return;
            }
            for receiver in receivers {
                wait_released(receiver).await;
            }
        }
    }
}

impl std::fmt::Debug for WriteLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteLockManager")
            .field("locked", &self.locked_paths())
            .finish()
    }
}

async fn wait_released(mut receiver: watch::Receiver<bool>) {
    while !*receiver.borrow_and_update() {
        if receiver.changed().await.is_err() {
            break;
        }
    }
}
