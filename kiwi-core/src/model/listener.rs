//! Observer registration with RAII unregistration.
//!
//! Listeners are held weakly: a dropped listener is skipped and pruned on the
//! next notification, and dropping the [`ListenerGuard`] removes it at once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::model::Patcher;

/// Receives one call per applied transaction, while change bits are readable.
pub trait PatcherListener: Send + Sync {
    fn patcher_changed(&self, patcher: &Patcher);
}

struct Registry<L: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Weak<L>)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Listeners<L: ?Sized> {
    inner: Arc<Mutex<Registry<L>>>,
}

impl<L: ?Sized + Send + Sync + 'static> Listeners<L> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register `listener` until the returned guard is dropped.
    #[must_use = "the listener is removed when the guard is dropped"]
    pub fn add(&self, listener: &Arc<L>) -> ListenerGuard {
        let id = {
            let mut registry = lock(&self.inner);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push((id, Arc::downgrade(listener)));
            id
        };

        let registry = Arc::downgrade(&self.inner);
        ListenerGuard {
            remove: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    lock(&registry).entries.retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }

    /// Call `f` on every live listener. The registry is not locked during calls,
    /// so listeners may register or unregister from inside `f`.
    pub fn call(&self, mut f: impl FnMut(&L)) {
        let live: Vec<Arc<L>> = {
            let mut registry = lock(&self.inner);
            registry.entries.retain(|(_, weak)| weak.strong_count() > 0);
            registry
                .entries
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        for listener in live {
            f(&listener);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner)
            .entries
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: ?Sized + Send + Sync + 'static> Default for Listeners<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> Clone for Listeners<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Unregisters its listener on drop.
pub struct ListenerGuard {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}
