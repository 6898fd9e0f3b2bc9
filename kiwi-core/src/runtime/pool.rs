use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::{ArcSwap, Guard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deferred destruction of shared resources.
///
/// Values replaced off the audio thread are parked here and dropped by
/// [`clear`](ReleasePool::clear) once the pool holds the last reference.
/// Only non-audio threads touch the pool.
pub struct ReleasePool<T: ?Sized> {
    entries: Mutex<Vec<Arc<T>>>,
}

impl<T: ?Sized> ReleasePool<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, value: Arc<T>) {
        lock(&self.entries).push(value);
    }

    /// Drop every value nobody else references. Returns how many were freed.
    pub fn clear(&self) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|entry| Arc::strong_count(entry) > 1);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: ?Sized> Default for ReleasePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Value shared with the audio thread.
///
/// `load` is lock-free and never frees; `store` swaps in a new value and
/// parks the old one in the pool.
pub struct SwapCell<T> {
    current: ArcSwap<T>,
    pool: Arc<ReleasePool<T>>,
}

impl<T> SwapCell<T> {
    pub fn new(value: T, pool: Arc<ReleasePool<T>>) -> Self {
        Self {
            current: ArcSwap::from_pointee(value),
            pool,
        }
    }

    pub fn load(&self) -> Guard<Arc<T>> {
        self.current.load()
    }

    /// Owned handle, for readers that keep the value across blocks.
    pub fn load_full(&self) -> Arc<T> {
        self.current.load_full()
    }

    pub fn store(&self, value: T) {
        let old = self.current.swap(Arc::new(value));
        self.pool.add(old);
    }

    pub fn pool(&self) -> &Arc<ReleasePool<T>> {
        &self.pool
    }
}
