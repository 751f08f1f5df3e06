//! Subscription registry used to republish state changes.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

/// Identifies a subscription returned by [`Observers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<N> = Arc<dyn Fn(&N) + Send + Sync>;

/// A list of callbacks interested in notifications of type `N`.
///
/// Callbacks run in subscription order on the thread calling [`Observers::notify`], which for all
/// daemon-originated changes is the event loop thread. The registry lock is not held while
/// callbacks run, so a callback may unsubscribe itself.
pub struct Observers<N> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(SubscriptionId, Callback<N>)>>,
}

impl<N> Observers<N> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&N) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.entries).push((id, Arc::new(callback)));
        id
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub fn notify(&self, notification: &N) {
        let callbacks = lock(&self.entries)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect::<Vec<_>>();
        for cb in callbacks {
            cb(notification);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

impl<N> Default for Observers<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Locks a mutex, recovering the data if a callback panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
