//! Per-project cancellation and write coordination.
//!
//! - [`CancelRegistry`]: project-level cancel signal observed by in-flight
//!   generation batches (`watch` channel carrying a cancel counter).
//! - [`ProjectGuards`]: per-project `RwLock`; batches take it shared while
//!   they persist results, lifecycle rollbacks take it exclusively while they
//!   purge.
//! - [`KeyedMutex`]: per-key serialization (one generation op per unit, one
//!   reindex per unit).
//!
//! Both keyed maps drop a key's entry when its last guard is released.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, watch};

/// Project-scoped cancellation signals.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    channels: Mutex<HashMap<String, watch::Sender<u64>>>,
}

impl CancelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, project_id: &str) -> watch::Sender<u64> {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(project_id.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .clone()
    }

    /// Token that observes cancels issued after this call.
    #[must_use]
    pub fn token(&self, project_id: &str) -> CancelToken {
        let rx = self.sender(project_id).subscribe();
        let seen = *rx.borrow();
        CancelToken { rx, seen }
    }

    /// Signal every token currently issued for `project_id`.
    pub fn cancel(&self, project_id: &str) {
        let tx = self.sender(project_id);
        tx.send_modify(|count| *count = count.wrapping_add(1));
        tracing::info!(project_id, "Cancel requested");
    }
}

/// Observer half of a project's cancel signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<u64>,
    seen: u64,
}

impl CancelToken {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() != self.seen
    }

    /// Resolves once the project is cancelled.
    pub async fn cancelled(&mut self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // registry dropped; nothing can cancel us any more
                std::future::pending::<()>().await;
            }
        }
    }
}

type Slots<K, L> = Arc<Mutex<HashMap<K, Arc<L>>>>;

fn lock_slots<K, L>(slots: &Slots<K, L>) -> MutexGuard<'_, HashMap<K, Arc<L>>> {
    match slots.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn slot_for<K: Eq + Hash + Clone, L: Default>(slots: &Slots<K, L>, key: &K) -> Arc<L> {
    Arc::clone(lock_slots(slots).entry(key.clone()).or_default())
}

/// Guard over one key's lock. Dropping the last guard of a key removes the
/// key's entry, so the maps only hold keys that are locked or awaited.
pub struct KeyGuard<K: Eq + Hash, L, G> {
    guard: Option<G>,
    key: K,
    slots: Slots<K, L>,
}

impl<K: Eq + Hash, L, G> Drop for KeyGuard<K, L, G> {
    fn drop(&mut self) {
        // release first: the owned guard holds a reference to the lock
        drop(self.guard.take());
        let mut slots = lock_slots(&self.slots);
        if slots
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            slots.remove(&self.key);
        }
    }
}

impl<K: Eq + Hash, L, G> std::fmt::Debug for KeyGuard<K, L, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard")
            .field("held", &self.guard.is_some())
            .finish_non_exhaustive()
    }
}

pub type KeyedMutexGuard<K> = KeyGuard<K, tokio::sync::Mutex<()>, OwnedMutexGuard<()>>;
pub type SharedGuard = KeyGuard<String, RwLock<()>, OwnedRwLockReadGuard<()>>;
pub type ExclusiveGuard = KeyGuard<String, RwLock<()>, OwnedRwLockWriteGuard<()>>;

/// Lazily created async lock per key.
#[derive(Debug)]
pub struct KeyedMutex<K> {
    locks: Slots<K, tokio::sync::Mutex<()>>,
}

impl<K> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &K) -> KeyedMutexGuard<K> {
        let guard = slot_for(&self.locks, key).lock_owned().await;
        KeyGuard {
            guard: Some(guard),
            key: key.clone(),
            slots: Arc::clone(&self.locks),
        }
    }

    /// `None` if another holder currently owns the key.
    pub fn try_lock(&self, key: &K) -> Option<KeyedMutexGuard<K>> {
        let guard = slot_for(&self.locks, key).try_lock_owned().ok()?;
        Some(KeyGuard {
            guard: Some(guard),
            key: key.clone(),
            slots: Arc::clone(&self.locks),
        })
    }

    /// Keys with a live entry.
    #[must_use]
    pub fn tracked(&self) -> usize {
        lock_slots(&self.locks).len()
    }
}

/// Per-project reader/writer guard around persistence of generated output.
#[derive(Debug, Default)]
pub struct ProjectGuards {
    locks: Slots<String, RwLock<()>>,
}

impl ProjectGuards {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn shared(&self, project_id: &str) -> SharedGuard {
        let key = project_id.to_string();
        let guard = slot_for(&self.locks, &key).read_owned().await;
        KeyGuard {
            guard: Some(guard),
            key,
            slots: Arc::clone(&self.locks),
        }
    }

    pub async fn exclusive(&self, project_id: &str) -> ExclusiveGuard {
        let key = project_id.to_string();
        let guard = slot_for(&self.locks, &key).write_owned().await;
        KeyGuard {
            guard: Some(guard),
            key,
            slots: Arc::clone(&self.locks),
        }
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        lock_slots(&self.locks).len()
    }
}

/// Coordination primitives shared by the orchestrator, indexer and lifecycle.
#[derive(Debug, Default)]
pub struct Coordination {
    pub cancels: CancelRegistry,
    pub projects: ProjectGuards,
}

impl Coordination {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
