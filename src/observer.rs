//! Typed observer lists.
//!
//! Subjects (connections, servers, clients) keep an [`Observers`] collection
//! per event. Subscribing hands back a [`Subscription`] guard; dropping the
//! guard unsubscribes, so there is no manual unsubscribe call to forget.
//! Long-lived registrations call [`Subscription::detach`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type EntryList<F> = Mutex<Vec<(u64, Arc<F>)>>;

/// An ordered collection of callbacks for one event kind.
pub struct Observers<F: ?Sized> {
    entries: Arc<EntryList<F>>,
    next_id: AtomicU64,
}

impl<F: ?Sized + Send + Sync + 'static> Observers<F> {
    pub fn new() -> Self {
        Observers {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Adds `callback` and returns the guard that removes it on drop.
    pub fn subscribe(&self, callback: Arc<F>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, callback));

        let entries: Weak<EntryList<F>> = Arc::downgrade(&self.entries);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(entries) = entries.upgrade() {
                    entries.lock().retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    /// Copies the current callbacks in registration order.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries.lock().iter().map(|(_, f)| f.clone()).collect()
    }

    /// Removes and returns all callbacks, most recently registered first.
    pub fn drain_reversed(&self) -> Vec<Arc<F>> {
        let mut entries = std::mem::take(&mut *self.entries.lock());
        entries.reverse();
        entries.into_iter().map(|(_, f)| f).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<F: ?Sized + Send + Sync + 'static> Default for Observers<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes its observer when dropped.
#[must_use = "dropping a subscription immediately unsubscribes the callback"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Leaves the observer registered for the subject's whole lifetime.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
