//! Observer lists for state-change notifications.
//!
//! Fan-out order is registration order. `notify` works on a snapshot of
//! the list, so listeners may subscribe or unsubscribe (themselves or
//! others) from inside a callback:
//!
//! - a listener removed during a notification is not called afterwards,
//! - every other listener in the snapshot is still called exactly once,
//! - listeners added during a notification first fire on the next one.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Listeners<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Callback<T>)>>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, Arc::new(callback)));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn is_registered(&self, id: ListenerId) -> bool {
        self.entries.lock().iter().any(|(existing, _)| *existing == id)
    }

    pub fn notify(&self, value: &T) {
        // Never call out while holding the lock.
        let snapshot: Vec<(ListenerId, Callback<T>)> = self.entries.lock().clone();
        for (id, callback) in snapshot {
            if self.is_registered(id) {
                callback(value);
            }
        }
    }
}
